//! Connection lifecycle engine
//!
//! A [`Connection`] is shared between the registry (as a `Weak` routing
//! entry), the endpoint and whoever awaits its readiness signals. All
//! packet processing happens in a single task driven by [`Connection::run`];
//! the [`PacketHandler`] methods only enqueue work or flip the one-shot
//! destroy latch, so they are safe to call from any thread.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::connection_id::{ConnectionId, ConnectionIdGenerator, ConnectionIdManager, StatelessResetToken};
use crate::connection_state::{LifecycleMachine, LifecycleState, StateEvent};
use crate::error::{ConnectionError, TransportErrorCode};
use crate::frame::{Frame, PacketCodec, UnpackError};
use crate::handshake::{CryptoSetup, EncryptionLevel, HandshakeError, HandshakeEvent};
use crate::packet::{Datagram, ReceivedPacket, stateless_reset_tail};
use crate::recovery::LossDetection;
use crate::registry::{ConnectionRunner, PacketHandler};
use crate::version::{QuicVersion, version_to_alpn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// External collaborators owned by one connection
pub struct ConnectionParts {
    pub crypto: Box<dyn CryptoSetup>,
    pub codec: Box<dyn PacketCodec>,
    pub recovery: Box<dyn LossDetection>,
}

pub struct ConnectionParams {
    pub role: Role,
    pub version: QuicVersion,
    pub remote_addr: SocketAddr,
    /// First ID chosen by this side (sequence number 0)
    pub local_connection_id: ConnectionId,
    /// ID the peer is addressed with until it issues others
    pub remote_connection_id: ConnectionId,
    /// Server only: destination ID of the client's first Initial
    pub original_destination: Option<ConnectionId>,
    pub config: ConnectionConfig,
    pub runner: Arc<dyn ConnectionRunner>,
    pub id_generator: Arc<dyn ConnectionIdGenerator>,
    pub outbound: mpsc::Sender<Datagram>,
    pub parts: ConnectionParts,
}

#[derive(Debug)]
enum Control {
    CloseTransport(TransportErrorCode),
    CloseApplication { code: u64, reason: String },
}

/// Registry entries owned by the connection, released on destroy
#[derive(Debug, Default)]
struct Routing {
    connection_ids: Vec<ConnectionId>,
    reset_token: Option<StatelessResetToken>,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub connection_ids: usize,
}

pub struct Connection {
    /// Identity of this connection in the registry
    this: Weak<Connection>,
    trace_id: Uuid,
    role: Role,
    version: QuicVersion,
    remote_addr: SocketAddr,
    runner: Arc<dyn ConnectionRunner>,
    packet_tx: mpsc::Sender<ReceivedPacket>,
    control_tx: mpsc::UnboundedSender<Control>,
    destroyed: AtomicBool,
    /// Decided when the connection starts closing, or at destroy
    final_error: OnceLock<ConnectionError>,
    machine: Mutex<LifecycleMachine>,
    state_tx: watch::Sender<LifecycleState>,
    early_ready: AtomicBool,
    established: AtomicBool,
    routing: Mutex<Routing>,
    /// Taken by `run`, dropped by `destroy` if never started
    driver: Mutex<Option<Driver>>,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    initial_ids: (ConnectionId, Option<ConnectionId>),
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Arc<Self> {
        let (packet_tx, packet_rx) = mpsc::channel(params.config.max_queued_packets.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LifecycleState::Handshaking);

        let mut codec = params.parts.codec;
        codec.set_peer_connection_id(&params.remote_connection_id);

        let now = Instant::now();
        let driver = Driver {
            crypto: params.parts.crypto,
            codec,
            recovery: params.parts.recovery,
            packet_rx,
            control_rx,
            outbound: params.outbound,
            id_generator: params.id_generator,
            local_ids: ConnectionIdManager::new(
                params.local_connection_id.clone(),
                params.config.active_connection_id_limit,
            ),
            peer_ids: PeerConnectionIds::new(
                params.remote_connection_id,
                params.config.active_connection_id_limit,
            ),
            original_destination: params.original_destination.clone(),
            handshake_deadline: Some(now + params.config.handshake_timeout()),
            idle_deadline: now + params.config.idle_timeout(),
            drain_deadline: None,
            close_packet: None,
            level: EncryptionLevel::Initial,
            config: params.config,
        };

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            trace_id: Uuid::new_v4(),
            role: params.role,
            version: params.version,
            remote_addr: params.remote_addr,
            runner: params.runner,
            packet_tx,
            control_tx,
            destroyed: AtomicBool::new(false),
            final_error: OnceLock::new(),
            machine: Mutex::new(LifecycleMachine::new()),
            state_tx,
            early_ready: AtomicBool::new(false),
            established: AtomicBool::new(false),
            routing: Mutex::new(Routing::default()),
            driver: Mutex::new(Some(driver)),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            initial_ids: (params.local_connection_id, params.original_destination),
        })
    }

    /// Bind the connection's initial IDs in the registry.
    ///
    /// A server binds the client's original destination ID together with
    /// its own. Returns false on collision, in which case nothing is bound.
    pub fn register(self: &Arc<Self>) -> bool {
        let (local, original) = &self.initial_ids;
        match original {
            Some(original) => self.bind_connection_id(original, local),
            None => {
                let handler = self.handler();
                let mut routing = self.routing.lock();
                if self.is_destroyed() || !self.runner.add(local, &handler) {
                    return false;
                }
                routing.connection_ids.push(local.clone());
                true
            }
        }
    }

    /// Process packets, timers and close requests until destroyed.
    ///
    /// Returns `Ok` when the connection was closed cleanly by this side.
    pub async fn run(self: Arc<Self>) -> Result<(), ConnectionError> {
        let driver = self.driver.lock().take();
        let Some(mut driver) = driver else {
            if !self.is_destroyed() {
                return Err(ConnectionError::Internal("connection is already running".to_string()));
            }
            return self.outcome();
        };

        debug!(conn = %self.trace_id, role = ?self.role, remote = %self.remote_addr, "Connection started");

        // Destruction from any thread cancels the driver at its next await,
        // including a pending handshake operation
        tokio::select! {
            _ = self.wait_for_state(|state| state.is_terminal()) => {}
            _ = driver.drive(&self) => {}
        }
        drop(driver);

        if !self.is_destroyed() {
            self.teardown(
                ConnectionError::Internal("connection driver stopped".to_string()),
                StateEvent::Destroy,
            );
        }

        self.outcome()
    }

    fn outcome(&self) -> Result<(), ConnectionError> {
        match self.final_error() {
            Some(err) if !is_clean_close(&err) => Err(err),
            _ => Ok(()),
        }
    }

    /// Resolves once early data may be sent, or the handshake completed.
    /// Fails if the connection closed first.
    pub async fn early_ready(&self) -> Result<(), ConnectionError> {
        let state = self
            .wait_for_state(|state| self.early_ready.load(Ordering::Acquire) || state.is_closed())
            .await;
        if self.early_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(self.close_reason(state))
    }

    /// Resolves once the handshake completed. Fails if the connection closed first.
    pub async fn handshake_complete(&self) -> Result<(), ConnectionError> {
        let state = self
            .wait_for_state(|state| self.established.load(Ordering::Acquire) || state.is_closed())
            .await;
        if self.established.load(Ordering::Acquire) {
            return Ok(());
        }
        Err(self.close_reason(state))
    }

    /// Wait for destruction and return the final error
    pub async fn closed(&self) -> ConnectionError {
        let state = self.wait_for_state(|state| state.is_terminal()).await;
        self.close_reason(state)
    }

    /// Close with an application error code
    pub fn close_with_error(&self, code: u64, reason: impl Into<String>) {
        if self.is_destroyed() {
            return;
        }
        let _ = self.control_tx.send(Control::CloseApplication {
            code,
            reason: reason.into(),
        });
    }

    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub fn final_error(&self) -> Option<ConnectionError> {
        self.final_error.get().cloned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> QuicVersion {
        self.version
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// IDs currently bound to this connection in the registry
    pub fn local_connection_ids(&self) -> Vec<ConnectionId> {
        self.routing.lock().connection_ids.clone()
    }

    /// Peer reset token currently registered for this connection
    pub fn peer_reset_token(&self) -> Option<StatelessResetToken> {
        self.routing.lock().reset_token
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            connection_ids: self.routing.lock().connection_ids.len(),
        }
    }

    fn handler(self: &Arc<Self>) -> Arc<dyn PacketHandler> {
        self.clone()
    }

    async fn wait_for_state(&self, mut ready: impl FnMut(LifecycleState) -> bool) -> LifecycleState {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let state = *state_rx.borrow_and_update();
            if ready(state) {
                return state;
            }
            // The sender lives as long as `self`
            if state_rx.changed().await.is_err() {
                return state;
            }
        }
    }

    fn close_reason(&self, state: LifecycleState) -> ConnectionError {
        self.final_error()
            .unwrap_or_else(|| ConnectionError::Internal(format!("connection is {}", state)))
    }

    /// First error wins
    fn record_error(&self, error: ConnectionError) {
        let _ = self.final_error.set(error);
    }

    /// Apply a lifecycle event and publish the new state
    fn transition(&self, event: StateEvent) -> bool {
        let next = {
            let mut machine = self.machine.lock();
            match machine.transition(event) {
                Ok(next) => next,
                Err(err) => {
                    if !self.is_destroyed() {
                        error!(conn = %self.trace_id, "{}", err);
                    }
                    return false;
                }
            }
        };

        match next {
            LifecycleState::EarlyDataReady => self.early_ready.store(true, Ordering::Release),
            LifecycleState::Active => {
                self.early_ready.store(true, Ordering::Release);
                self.established.store(true, Ordering::Release);
            }
            _ => {}
        }
        self.state_tx.send_replace(next);
        true
    }

    /// One-shot teardown: record the error, release every routing entry and
    /// stop the driver. Never blocks on the driver.
    fn teardown(&self, error: ConnectionError, event: StateEvent) {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.record_error(error);

        let routing = std::mem::take(&mut *self.routing.lock());
        let this: Weak<dyn PacketHandler> = self.this.clone();
        self.runner.remove_closed(&routing.connection_ids, &this);
        if let Some(token) = &routing.reset_token {
            self.runner.remove_reset_token(token);
        }

        let next = {
            let mut machine = self.machine.lock();
            machine
                .transition(event)
                .or_else(|_| machine.transition(StateEvent::Destroy))
                .unwrap_or(LifecycleState::Destroyed)
        };

        // Never started; drop its collaborators now
        let unstarted = self.driver.lock().take();
        drop(unstarted);

        match self.final_error.get() {
            Some(err) => info!(conn = %self.trace_id, "Connection destroyed: {}", err),
            None => info!(conn = %self.trace_id, "Connection destroyed"),
        }
        self.state_tx.send_replace(next);
    }

    fn bind_connection_id(self: &Arc<Self>, existing: &ConnectionId, new: &ConnectionId) -> bool {
        let handler = self.handler();
        let mut routing = self.routing.lock();
        // Checked under the routing lock so a concurrent teardown sees every entry
        if self.is_destroyed() || !self.runner.add_with_conn_id(existing, new, &handler) {
            return false;
        }
        for id in [existing, new] {
            if !routing.connection_ids.contains(id) {
                routing.connection_ids.push(id.clone());
            }
        }
        true
    }

    /// Stop tracking `id` as ours and let the registry retire it
    fn retire_connection_id(&self, id: &ConnectionId) {
        let mut routing = self.routing.lock();
        if self.is_destroyed() {
            return;
        }
        routing.connection_ids.retain(|current| current != id);
        self.runner.retire(id);
    }

    /// Replace the registered peer reset token. Only one is live at a time.
    fn set_peer_reset_token(self: &Arc<Self>, token: Option<StatelessResetToken>) {
        let handler = self.handler();
        let mut routing = self.routing.lock();
        if self.is_destroyed() || routing.reset_token == token {
            return;
        }
        if let Some(old) = routing.reset_token.take() {
            self.runner.remove_reset_token(&old);
        }
        if let Some(token) = token {
            if self.runner.add_reset_token(token, &handler) {
                routing.reset_token = Some(token);
            }
        }
    }
}

impl PacketHandler for Connection {
    fn handle_packet(&self, packet: ReceivedPacket) {
        if self.is_destroyed() {
            return;
        }
        match self.packet_tx.try_send(packet) {
            Ok(()) => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(packet)) => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(conn = %self.trace_id, "Packet queue full, dropping {} bytes", packet.size());
            }
            Err(TrySendError::Closed(_)) => {
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn destroy(&self, error: ConnectionError) {
        self.teardown(error, StateEvent::Destroy);
    }

    fn close_with_transport_error(&self, code: TransportErrorCode) {
        if self.is_destroyed() {
            return;
        }
        let _ = self.control_tx.send(Control::CloseTransport(code));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trace_id", &self.trace_id)
            .field("role", &self.role)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

fn is_clean_close(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Application { remote: false, .. } | ConnectionError::Shutdown(_) => true,
        ConnectionError::Transport { code, remote: false, .. } => *code == TransportErrorCode::NO_ERROR,
        _ => false,
    }
}

#[derive(Debug, Clone)]
struct PeerId {
    id: ConnectionId,
    reset_token: Option<StatelessResetToken>,
}

/// Connection IDs issued to us by the peer
#[derive(Debug)]
struct PeerConnectionIds {
    ids: BTreeMap<u64, PeerId>,
    active: u64,
    retire_prior_to: u64,
    limit: usize,
}

impl PeerConnectionIds {
    fn new(initial: ConnectionId, limit: usize) -> Self {
        let mut ids = BTreeMap::new();
        ids.insert(
            0,
            PeerId {
                id: initial,
                reset_token: None,
            },
        );
        Self {
            ids,
            active: 0,
            retire_prior_to: 0,
            limit: limit.max(2),
        }
    }

    fn active(&self) -> Option<&PeerId> {
        self.ids.get(&self.active)
    }

    /// The server's handshake ID changes when its first packet arrives, and
    /// its reset token comes with the transport parameters
    fn update_initial(&mut self, id: Option<ConnectionId>, reset_token: Option<StatelessResetToken>) {
        if let Some(initial) = self.ids.get_mut(&0) {
            if let Some(id) = id {
                initial.id = id;
            }
            if reset_token.is_some() {
                initial.reset_token = reset_token;
            }
        }
    }

    /// Apply NEW_CONNECTION_ID. Returns the sequence numbers to retire.
    fn insert(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        id: ConnectionId,
        reset_token: StatelessResetToken,
    ) -> Result<Vec<u64>, TransportErrorCode> {
        if retire_prior_to > sequence {
            return Err(TransportErrorCode::FRAME_ENCODING_ERROR);
        }
        if sequence < self.retire_prior_to {
            return Ok(vec![sequence]);
        }
        if let Some(existing) = self.ids.get(&sequence) {
            if existing.id != id || existing.reset_token != Some(reset_token) {
                return Err(TransportErrorCode::PROTOCOL_VIOLATION);
            }
            return Ok(Vec::new());
        }

        self.ids.insert(
            sequence,
            PeerId {
                id,
                reset_token: Some(reset_token),
            },
        );

        let mut retired = Vec::new();
        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let keep = self.ids.split_off(&retire_prior_to);
            retired = self.ids.keys().copied().collect();
            self.ids = keep;
        }

        if self.ids.len() > self.limit {
            return Err(TransportErrorCode::CONNECTION_ID_LIMIT_ERROR);
        }
        Ok(retired)
    }

    /// Move to the lowest remaining ID if the active one was retired
    fn switch_if_retired(&mut self) -> Option<&PeerId> {
        if self.ids.contains_key(&self.active) {
            return None;
        }
        let (&sequence, _) = self.ids.iter().next()?;
        self.active = sequence;
        self.ids.get(&sequence)
    }
}

/// State owned by the connection task
struct Driver {
    crypto: Box<dyn CryptoSetup>,
    codec: Box<dyn PacketCodec>,
    recovery: Box<dyn LossDetection>,
    packet_rx: mpsc::Receiver<ReceivedPacket>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    outbound: mpsc::Sender<Datagram>,
    id_generator: Arc<dyn ConnectionIdGenerator>,
    config: ConnectionConfig,
    local_ids: ConnectionIdManager,
    peer_ids: PeerConnectionIds,
    original_destination: Option<ConnectionId>,
    handshake_deadline: Option<Instant>,
    idle_deadline: Instant,
    drain_deadline: Option<Instant>,
    /// Resent to stray packets while draining after a local close
    close_packet: Option<Bytes>,
    /// Highest level with keys
    level: EncryptionLevel,
}

impl Driver {
    async fn drive(&mut self, conn: &Arc<Connection>) {
        let Some(alpn) = version_to_alpn(conn.version) else {
            warn!(conn = %conn.trace_id, version = %conn.version, "No application protocol for version");
            self.send_frames(
                conn,
                EncryptionLevel::Initial,
                &[Frame::transport_close(
                    TransportErrorCode::NO_APPLICATION_PROTOCOL,
                    "no application protocol",
                )],
            );
            conn.teardown(
                ConnectionError::NoApplicationProtocol {
                    version: conn.version.value(),
                },
                StateEvent::Destroy,
            );
            return;
        };

        match self.crypto.start(alpn).await {
            Ok(events) => self.on_handshake_events(conn, events),
            Err(err) => self.fail_handshake(conn, err),
        }

        loop {
            if conn.is_destroyed() {
                return;
            }
            let deadline = self.next_deadline();

            tokio::select! {
                biased;
                Some(control) = self.control_rx.recv() => self.on_control(conn, control),
                packet = self.packet_rx.recv() => match packet {
                    Some(packet) => self.on_packet(conn, packet).await,
                    None => return,
                },
                _ = time::sleep_until(deadline) => self.on_timeout(conn, Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Instant {
        if let Some(drain) = self.drain_deadline {
            return drain;
        }
        let mut deadline = self.idle_deadline;
        if let Some(handshake) = self.handshake_deadline {
            deadline = deadline.min(handshake);
        }
        if let Some(recovery) = self.recovery.next_timeout() {
            deadline = deadline.min(recovery);
        }
        deadline
    }

    fn on_timeout(&mut self, conn: &Arc<Connection>, now: Instant) {
        if let Some(drain) = self.drain_deadline {
            if now >= drain {
                debug!(conn = %conn.trace_id, "Draining period over");
                let error = conn
                    .final_error()
                    .unwrap_or_else(|| ConnectionError::Shutdown("drained".to_string()));
                conn.teardown(error, StateEvent::DrainTimeout);
            }
            return;
        }

        if self.handshake_deadline.is_some_and(|deadline| now >= deadline) {
            info!(conn = %conn.trace_id, "Handshake timed out");
            conn.teardown(ConnectionError::HandshakeTimeout, StateEvent::Destroy);
            return;
        }

        if now >= self.idle_deadline {
            info!(conn = %conn.trace_id, "Connection idle timeout");
            conn.teardown(ConnectionError::IdleTimeout, StateEvent::Destroy);
            return;
        }

        if self.recovery.next_timeout().is_some_and(|deadline| now >= deadline) && self.recovery.on_timeout(now) {
            self.send_frames(conn, self.send_level(), &[Frame::Ping]);
        }
    }

    fn on_control(&mut self, conn: &Arc<Connection>, control: Control) {
        match control {
            Control::CloseTransport(code) => {
                self.close_locally(
                    conn,
                    ConnectionError::local_transport(code, ""),
                    Frame::transport_close(code, ""),
                );
            }
            Control::CloseApplication { code, reason } => {
                // Application codes may not be revealed before 1-RTT keys
                let frame = if conn.established.load(Ordering::Acquire) {
                    Frame::application_close(code, reason.clone())
                } else {
                    Frame::transport_close(TransportErrorCode::APPLICATION_ERROR, "")
                };
                self.close_locally(
                    conn,
                    ConnectionError::Application {
                        code,
                        remote: false,
                        reason,
                    },
                    frame,
                );
            }
        }
    }

    async fn on_packet(&mut self, conn: &Arc<Connection>, packet: ReceivedPacket) {
        if conn.state() == LifecycleState::Draining {
            self.on_stray_packet(conn);
            return;
        }

        let unpacked = match self.codec.unpack(&packet) {
            Ok(unpacked) => unpacked,
            Err(UnpackError::DecryptionFailed) => {
                let token = self.peer_ids.active().and_then(|peer| peer.reset_token);
                if token.is_some() && stateless_reset_tail(&packet.data) == token {
                    info!(conn = %conn.trace_id, "Received stateless reset");
                    conn.teardown(ConnectionError::StatelessReset, StateEvent::Destroy);
                } else {
                    trace!(conn = %conn.trace_id, "Dropping undecryptable packet of {} bytes", packet.size());
                }
                return;
            }
            Err(UnpackError::KeysUnavailable(level)) => {
                trace!(conn = %conn.trace_id, "Dropping packet, no keys for {:?}", level);
                return;
            }
            Err(UnpackError::Malformed { code, reason }) => {
                self.close_locally(
                    conn,
                    ConnectionError::local_transport(code, reason.clone()),
                    Frame::transport_close(code, reason),
                );
                return;
            }
        };

        let now = Instant::now();
        self.recovery.on_packet_received(unpacked.level, unpacked.packet_number, now);
        self.idle_deadline = now + self.config.idle_timeout();

        if conn.role == Role::Client && !conn.established.load(Ordering::Acquire) {
            if let Some(scid) = unpacked.source_connection_id {
                let current = self.peer_ids.active().map(|peer| &peer.id);
                if current != Some(&scid) {
                    debug!(conn = %conn.trace_id, "Server chose connection ID {}", scid);
                    self.codec.set_peer_connection_id(&scid);
                    self.peer_ids.update_initial(Some(scid), None);
                }
            }
        }

        for frame in unpacked.frames {
            if conn.state().is_closed() {
                break;
            }
            self.on_frame(conn, unpacked.level, frame).await;
        }
    }

    async fn on_frame(&mut self, conn: &Arc<Connection>, level: EncryptionLevel, frame: Frame) {
        match frame {
            Frame::Crypto { data } => match self.crypto.handle_crypto_data(level, data).await {
                Ok(events) => self.on_handshake_events(conn, events),
                Err(err) => self.fail_handshake(conn, err),
            },
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                connection_id,
                reset_token,
            } => self.on_new_connection_id(conn, sequence, retire_prior_to, connection_id, reset_token),
            Frame::RetireConnectionId { sequence } => self.on_retire_connection_id(conn, sequence),
            Frame::ConnectionClose {
                error_code,
                reason,
                application,
                ..
            } => {
                let error = if application {
                    ConnectionError::Application {
                        code: error_code,
                        remote: true,
                        reason,
                    }
                } else {
                    ConnectionError::Transport {
                        code: TransportErrorCode(error_code),
                        remote: true,
                        reason,
                    }
                };
                info!(conn = %conn.trace_id, "Peer closed connection: {}", error);
                conn.record_error(error);
                if conn.transition(StateEvent::CloseReceived) {
                    self.drain_deadline = Some(Instant::now() + self.config.draining_period());
                }
            }
            Frame::HandshakeDone => {
                if conn.role == Role::Server {
                    self.close_locally(
                        conn,
                        ConnectionError::local_transport(
                            TransportErrorCode::PROTOCOL_VIOLATION,
                            "client sent HANDSHAKE_DONE",
                        ),
                        Frame::transport_close(TransportErrorCode::PROTOCOL_VIOLATION, "HANDSHAKE_DONE from client"),
                    );
                }
            }
            Frame::Ping | Frame::Other(_) => {}
        }
    }

    fn on_handshake_events(&mut self, conn: &Arc<Connection>, events: Vec<HandshakeEvent>) {
        for event in events {
            if conn.state().is_closed() {
                return;
            }
            match event {
                HandshakeEvent::WriteCrypto { level, data } => {
                    self.send_frames(conn, level, &[Frame::Crypto { data }]);
                }
                HandshakeEvent::KeysDerived(level) => {
                    debug!(conn = %conn.trace_id, "Keys derived for {:?}", level);
                    self.level = self.level.max(level);
                }
                HandshakeEvent::EarlyDataAccepted => {
                    if self.config.allow_early_data && conn.state() == LifecycleState::Handshaking {
                        if conn.transition(StateEvent::EarlyDataPermitted) {
                            info!(conn = %conn.trace_id, "Early data ready");
                        }
                    }
                }
                HandshakeEvent::TransportParameters { stateless_reset_token } => {
                    // Only servers send a reset token in transport parameters
                    if conn.role == Role::Client && stateless_reset_token.is_some() {
                        self.peer_ids.update_initial(None, stateless_reset_token);
                        if self.peer_ids.active == 0 {
                            conn.set_peer_reset_token(stateless_reset_token);
                        }
                    }
                }
                HandshakeEvent::HandshakeComplete => self.on_handshake_complete(conn),
            }
        }
    }

    fn on_handshake_complete(&mut self, conn: &Arc<Connection>) {
        if !conn.transition(StateEvent::HandshakeCompleted) {
            return;
        }
        self.handshake_deadline = None;
        self.level = EncryptionLevel::OneRtt;
        info!(conn = %conn.trace_id, remote = %conn.remote_addr, "Handshake complete");

        let mut frames = Vec::new();
        if conn.role == Role::Server {
            if let Some(original) = self.original_destination.take() {
                conn.retire_connection_id(&original);
            }
            frames.push(Frame::HandshakeDone);
        }
        frames.extend(self.new_connection_id_frames(conn));

        if !frames.is_empty() {
            self.send_frames(conn, EncryptionLevel::OneRtt, &frames);
        }
    }

    /// Issue local IDs up to the peer's limit
    fn new_connection_id_frames(&mut self, conn: &Arc<Connection>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.local_ids.remaining_capacity() > 0 {
            let Some(existing) = self.local_ids.current().cloned() else {
                break;
            };
            let id = match self.id_generator.generate() {
                Ok(id) => id,
                Err(err) => {
                    warn!(conn = %conn.trace_id, "Failed to generate connection ID: {}", err);
                    break;
                }
            };
            if !conn.bind_connection_id(&existing, &id) {
                debug!(conn = %conn.trace_id, "Could not bind new connection ID {}", id);
                break;
            }

            let sequence = self.local_ids.issue(id.clone());
            let reset_token = conn.runner.stateless_reset_token(&id);
            frames.push(Frame::NewConnectionId {
                sequence,
                retire_prior_to: 0,
                connection_id: id,
                reset_token,
            });
        }
        frames
    }

    fn on_retire_connection_id(&mut self, conn: &Arc<Connection>, sequence: u64) {
        match self.local_ids.retire(sequence) {
            Ok(Some(id)) => {
                debug!(conn = %conn.trace_id, "Peer retired connection ID {} (sequence {})", id, sequence);
                conn.retire_connection_id(&id);
                let frames = self.new_connection_id_frames(conn);
                if !frames.is_empty() {
                    self.send_frames(conn, EncryptionLevel::OneRtt, &frames);
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.close_locally(
                    conn,
                    ConnectionError::local_transport(TransportErrorCode::PROTOCOL_VIOLATION, err.to_string()),
                    Frame::transport_close(TransportErrorCode::PROTOCOL_VIOLATION, "unknown connection ID sequence"),
                );
            }
        }
    }

    fn on_new_connection_id(
        &mut self,
        conn: &Arc<Connection>,
        sequence: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        reset_token: StatelessResetToken,
    ) {
        let retired = match self.peer_ids.insert(sequence, retire_prior_to, connection_id, reset_token) {
            Ok(retired) => retired,
            Err(code) => {
                self.close_locally(
                    conn,
                    ConnectionError::local_transport(code, "invalid NEW_CONNECTION_ID"),
                    Frame::transport_close(code, "invalid NEW_CONNECTION_ID"),
                );
                return;
            }
        };

        if let Some(active) = self.peer_ids.switch_if_retired().cloned() {
            debug!(conn = %conn.trace_id, "Switching to peer connection ID {}", active.id);
            self.codec.set_peer_connection_id(&active.id);
            conn.set_peer_reset_token(active.reset_token);
        }

        if !retired.is_empty() {
            let frames: Vec<Frame> = retired
                .into_iter()
                .map(|sequence| Frame::RetireConnectionId { sequence })
                .collect();
            self.send_frames(conn, self.send_level(), &frames);
        }
    }

    fn on_stray_packet(&mut self, conn: &Arc<Connection>) {
        if !conn.transition(StateEvent::StrayPacket) {
            return;
        }
        let count = conn.machine.lock().stray_packets();
        // Exponential back-off: answer the 1st, 2nd, 4th, 8th, ... stray
        if let Some(close) = self.close_packet.clone() {
            if count.is_power_of_two() {
                trace!(conn = %conn.trace_id, "Resending CONNECTION_CLOSE to stray packet {}", count);
                self.send(conn, self.send_level(), close, false);
            }
        }
    }

    /// Send CONNECTION_CLOSE and start draining
    fn close_locally(&mut self, conn: &Arc<Connection>, error: ConnectionError, frame: Frame) {
        if conn.state().is_closed() {
            return;
        }
        info!(conn = %conn.trace_id, "Closing connection: {}", error);
        conn.record_error(error);
        if !conn.transition(StateEvent::CloseInitiated) {
            return;
        }

        let level = self.send_level();
        match self.codec.pack(level, &[frame]) {
            Ok(packet) => {
                self.close_packet = Some(packet.clone());
                self.send(conn, level, packet, false);
            }
            Err(err) => warn!(conn = %conn.trace_id, "Failed to pack CONNECTION_CLOSE: {}", err),
        }

        conn.transition(StateEvent::CloseSent);
        self.drain_deadline = Some(Instant::now() + self.config.draining_period());
    }

    /// Best-effort close, then immediate destroy
    fn fail_handshake(&mut self, conn: &Arc<Connection>, err: HandshakeError) {
        warn!(conn = %conn.trace_id, "Handshake failed: {}", err);
        let frame = Frame::transport_close(err.transport_code(), err.to_string());
        self.send_frames(conn, self.send_level(), &[frame]);
        conn.teardown(ConnectionError::HandshakeFailed(err.to_string()), StateEvent::Destroy);
    }

    /// CONNECTION_CLOSE and probes cannot go in 0-RTT packets
    fn send_level(&self) -> EncryptionLevel {
        match self.level {
            EncryptionLevel::EarlyData => EncryptionLevel::Initial,
            level => level,
        }
    }

    fn send_frames(&mut self, conn: &Connection, level: EncryptionLevel, frames: &[Frame]) {
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        match self.codec.pack(level, frames) {
            Ok(packet) => {
                if ack_eliciting && !self.recovery.can_send(packet.len()) {
                    debug!(conn = %conn.trace_id, "Congestion limited, dropping {} bytes", packet.len());
                    return;
                }
                self.send(conn, level, packet, ack_eliciting);
            }
            Err(err) => warn!(conn = %conn.trace_id, "Failed to pack frames: {}", err),
        }
    }

    /// Hand a datagram to the writer task. Never blocks.
    fn send(&mut self, conn: &Connection, level: EncryptionLevel, payload: Bytes, ack_eliciting: bool) {
        let size = payload.len();
        let datagram = Datagram {
            destination: conn.remote_addr,
            payload,
        };
        match self.outbound.try_send(datagram) {
            Ok(()) => self.recovery.on_packet_sent(level, size, ack_eliciting, Instant::now()),
            Err(TrySendError::Full(_)) => {
                debug!(conn = %conn.trace_id, "Outbound queue full, dropping {} bytes", size);
            }
            Err(TrySendError::Closed(_)) => {
                trace!(conn = %conn.trace_id, "Writer gone, dropping {} bytes", size);
            }
        }
    }
}
