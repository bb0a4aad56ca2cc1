//! UDP endpoint: one socket, one registry, many connections
//!
//! The read loop inspects each datagram just far enough to route it. Known
//! connection IDs go straight to their connection's queue. Unknown ones are
//! either admitted as new server connections, answered with version
//! negotiation or a stateless reset, or dropped. All outbound datagrams go
//! through a single writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::QuicConfig;
use crate::connection::{Connection, ConnectionParams, ConnectionParts, Role};
use crate::connection_id::{
    ConnectionId, ConnectionIdGenerator, DEFAULT_CONNECTION_ID_LENGTH, RandomConnectionIdGenerator,
};
use crate::error::{ConnectionError, QuicError, Result, TransportErrorCode};
use crate::packet::{
    Datagram, LongPacketType, MIN_INITIAL_PACKET_SIZE, PacketHeader, ReceivedPacket, build_stateless_reset,
    inspect_header, stateless_reset_tail,
};
use crate::registry::{ConnectionRunner, PacketHandler, PacketHandlerMap};
use crate::token::{AcceptAllTokens, TokenValidator};
use crate::version::{QuicVersion, VersionNegotiationPacket};

/// Largest UDP payload
const MAX_DATAGRAM_SIZE: usize = 65_527;

/// Builds the collaborators for a connection the server is admitting
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(
        &self,
        remote_addr: SocketAddr,
        version: QuicVersion,
        original_destination: &ConnectionId,
    ) -> Result<ConnectionParts>;
}

/// Counters for the routing decisions taken by the read loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub datagrams_received: u64,
    pub datagrams_dropped: u64,
    pub version_negotiations_sent: u64,
    pub stateless_resets_sent: u64,
    pub stateless_resets_received: u64,
    pub connections_admitted: u64,
    pub connections_refused: u64,
}

#[derive(Debug, Default)]
struct Counters {
    datagrams_received: AtomicU64,
    datagrams_dropped: AtomicU64,
    version_negotiations_sent: AtomicU64,
    stateless_resets_sent: AtomicU64,
    stateless_resets_received: AtomicU64,
    connections_admitted: AtomicU64,
    connections_refused: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EndpointStats {
        EndpointStats {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            version_negotiations_sent: self.version_negotiations_sent.load(Ordering::Relaxed),
            stateless_resets_sent: self.stateless_resets_sent.load(Ordering::Relaxed),
            stateless_resets_received: self.stateless_resets_received.load(Ordering::Relaxed),
            connections_admitted: self.connections_admitted.load(Ordering::Relaxed),
            connections_refused: self.connections_refused.load(Ordering::Relaxed),
        }
    }
}

/// Endpoint builder
pub struct EndpointBuilder {
    config: QuicConfig,
    factory: Option<Arc<dyn ConnectionFactory>>,
    token_validator: Arc<dyn TokenValidator>,
    id_generator: Option<Arc<dyn ConnectionIdGenerator>>,
}

impl EndpointBuilder {
    pub fn new(config: QuicConfig) -> Self {
        Self {
            config,
            factory: None,
            token_validator: Arc::new(AcceptAllTokens),
            id_generator: None,
        }
    }

    /// Admit incoming connections, building their collaborators with `factory`
    pub fn server(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.token_validator = validator;
        self
    }

    pub fn connection_id_generator(mut self, generator: Arc<dyn ConnectionIdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    /// Bind the socket and start the background tasks
    pub async fn bind(self) -> Result<Endpoint> {
        self.config.validate()?;

        let id_generator = self.id_generator.unwrap_or_else(|| {
            Arc::new(RandomConnectionIdGenerator::new(self.config.endpoint.connection_id_length))
        });
        if id_generator.connection_id_len() != self.config.endpoint.connection_id_length {
            return Err(QuicError::Config(format!(
                "connection ID generator produces {} byte IDs, configured length is {}",
                id_generator.connection_id_len(),
                self.config.endpoint.connection_id_length
            )));
        }

        let socket = Arc::new(UdpSocket::bind(self.config.endpoint.bind_address).await?);
        let local_addr = socket.local_addr()?;

        let registry = Arc::new(PacketHandlerMap::new(
            self.config.stateless_reset_key()?,
            self.config.retired_connection_id_delay(),
        ));

        let (outbound, outbound_rx) = mpsc::channel(self.config.endpoint.outbound_queue_depth);
        let (accept_tx, accept_rx) = mpsc::channel(self.config.endpoint.max_pending_connections.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let role = if self.factory.is_some() { Role::Server } else { Role::Client };
        let inner = Arc::new(EndpointInner {
            socket: socket.clone(),
            local_addr,
            config: self.config,
            registry,
            id_generator,
            token_validator: self.token_validator,
            factory: self.factory,
            outbound,
            accept_tx,
            pending: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let tasks = vec![
            tokio::spawn(EndpointInner::read_loop(inner.clone(), shutdown_rx.clone())),
            tokio::spawn(write_loop(socket, outbound_rx)),
            tokio::spawn(EndpointInner::sweep_loop(inner.clone(), shutdown_rx)),
        ];

        info!(role = ?role, "QUIC endpoint listening on {}", local_addr);

        Ok(Endpoint {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

/// QUIC endpoint bound to one UDP socket
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn builder(config: QuicConfig) -> EndpointBuilder {
        EndpointBuilder::new(config)
    }

    /// Server endpoint admitting connections through `factory`
    pub async fn server(config: QuicConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        EndpointBuilder::new(config).server(factory).bind().await
    }

    /// Client endpoint; unknown connection IDs are never admitted
    pub async fn client(config: QuicConfig) -> Result<Self> {
        EndpointBuilder::new(config).bind().await
    }

    /// Start a client connection to `remote_addr`.
    ///
    /// The returned connection is already registered and running; await
    /// [`Connection::handshake_complete`] before using it.
    pub fn connect(
        &self,
        remote_addr: SocketAddr,
        version: QuicVersion,
        parts: ConnectionParts,
    ) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        if inner.registry.is_closed() {
            return Err(QuicError::EndpointClosed);
        }
        if !version.is_supported() {
            return Err(QuicError::Protocol(format!("unsupported version {}", version)));
        }

        let local_connection_id = inner.id_generator.generate()?;
        // Random until the server picks its own
        let remote_connection_id = ConnectionId::generate_random(DEFAULT_CONNECTION_ID_LENGTH)?;

        let conn = Connection::new(ConnectionParams {
            role: Role::Client,
            version,
            remote_addr,
            local_connection_id,
            remote_connection_id,
            original_destination: None,
            config: inner.config.connection.clone(),
            runner: inner.registry.clone(),
            id_generator: inner.id_generator.clone(),
            outbound: inner.outbound.clone(),
            parts,
        });

        if !conn.register() {
            return Err(QuicError::Protocol("connection ID collision".to_string()));
        }

        info!(conn = %conn.trace_id(), "Connecting to {}", remote_addr);
        inner.spawn_connection(conn.clone(), false);
        Ok(conn)
    }

    /// Next server connection that is ready for use.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Arc<Connection>> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return None;
        }

        let mut accept_rx = self.accept_rx.lock().await;
        loop {
            let conn = tokio::select! {
                conn = accept_rx.recv() => conn?,
                _ = shutdown.changed() => return None,
            };
            // Counted against max_pending_connections until dequeued here
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            if conn.is_destroyed() {
                trace!(conn = %conn.trace_id(), "Skipping connection closed while queued for accept");
                continue;
            }
            return Some(conn);
        }
    }

    /// Accepted connections as a stream, ending at shutdown
    pub fn incoming(&self) -> impl Stream<Item = Arc<Connection>> + '_ {
        stream::unfold(self, |endpoint| async move {
            let conn = endpoint.accept().await?;
            Some((conn, endpoint))
        })
    }

    /// Tear down every connection with `error` and stop the background tasks
    pub fn close(&self, error: ConnectionError) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("Closing endpoint on {}: {}", self.inner.local_addr, error);
        self.inner.registry.close_all(error);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn registry(&self) -> &Arc<PacketHandlerMap> {
        &self.inner.registry
    }

    /// Server connections admitted but not yet returned by `accept`
    pub fn pending_connections(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EndpointStats {
        self.inner.counters.snapshot()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close(ConnectionError::Shutdown("endpoint dropped".to_string()));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("local_addr", &self.inner.local_addr)
            .field("registry", &self.inner.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct EndpointInner {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: QuicConfig,
    registry: Arc<PacketHandlerMap>,
    id_generator: Arc<dyn ConnectionIdGenerator>,
    token_validator: Arc<dyn TokenValidator>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    outbound: mpsc::Sender<Datagram>,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    pending: AtomicUsize,
    counters: Counters,
}

impl EndpointInner {
    async fn read_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, remote_addr)) => {
                        let packet = ReceivedPacket::new(remote_addr, Bytes::copy_from_slice(&buffer[..len]));
                        self.handle_datagram(packet);
                    }
                    // ICMP errors surface on some platforms; not fatal for a shared socket
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
                    ) => {
                        debug!("Ignoring socket error: {}", e);
                    }
                    Err(e) => {
                        error!("Error receiving UDP packet: {}", e);
                        self.registry.close_all(ConnectionError::Shutdown(format!("socket error: {}", e)));
                        break;
                    }
                },
            }
        }

        debug!("Read loop on {} stopped", self.local_addr);
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.retirement_sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let removed = self.registry.sweep_retired(std::time::Instant::now());
                    if removed > 0 {
                        trace!("Removed {} retired connection IDs", removed);
                    }
                }
            }
        }
    }

    /// Route one datagram. Never suspends.
    fn handle_datagram(self: &Arc<Self>, packet: ReceivedPacket) {
        Counters::bump(&self.counters.datagrams_received);

        let header = match inspect_header(&packet.data, self.id_generator.connection_id_len()) {
            Ok(header) => header,
            Err(e) => {
                trace!("Dropping unparseable datagram from {}: {}", packet.remote_addr, e);
                Counters::bump(&self.counters.datagrams_dropped);
                return;
            }
        };

        if let Some(handler) = self.registry.lookup(header.destination_connection_id()) {
            handler.handle_packet(packet);
            return;
        }

        // Late packets for a connection destroyed moments ago
        if self.registry.is_recently_closed(header.destination_connection_id()) {
            trace!(
                "Dropping packet from {} for closed connection {}",
                packet.remote_addr,
                header.destination_connection_id()
            );
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        }

        match header {
            PacketHeader::Short { dcid } => self.handle_unknown_short(packet, &dcid),
            PacketHeader::Long {
                version,
                packet_type,
                dcid,
                scid,
                token,
            } => self.handle_unknown_long(packet, version, packet_type, dcid, scid, token),
        }
    }

    fn handle_unknown_short(&self, packet: ReceivedPacket, dcid: &ConnectionId) {
        if let Some(token) = stateless_reset_tail(&packet.data) {
            if let Some(handler) = self.registry.lookup_by_reset_token(&token) {
                info!("Stateless reset from {}", packet.remote_addr);
                Counters::bump(&self.counters.stateless_resets_received);
                handler.destroy(ConnectionError::StatelessReset);
                return;
            }
        }

        let token = self.registry.stateless_reset_token(dcid);
        match build_stateless_reset(&token, packet.size()) {
            Some(reset) => {
                debug!("Sending stateless reset to {} for unknown connection {}", packet.remote_addr, dcid);
                if self.send(packet.remote_addr, reset) {
                    Counters::bump(&self.counters.stateless_resets_sent);
                }
            }
            None => {
                trace!("Dropping {} byte packet for unknown connection {}", packet.size(), dcid);
                Counters::bump(&self.counters.datagrams_dropped);
            }
        }
    }

    fn handle_unknown_long(
        self: &Arc<Self>,
        packet: ReceivedPacket,
        version: QuicVersion,
        packet_type: Option<LongPacketType>,
        dcid: ConnectionId,
        scid: ConnectionId,
        token: Option<Bytes>,
    ) {
        let Some(factory) = self.factory.clone() else {
            trace!("Client endpoint dropping packet for unknown connection {}", dcid);
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        };

        // Never answer a version negotiation packet
        if version == QuicVersion::NEGOTIATION {
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        }

        if !version.is_supported() {
            if packet.size() >= MIN_INITIAL_PACKET_SIZE {
                debug!("Sending version negotiation to {} (offered {})", packet.remote_addr, version);
                let negotiation = VersionNegotiationPacket::in_response_to(dcid.as_bytes(), scid.as_bytes());
                if self.send(packet.remote_addr, Bytes::from(negotiation.encode())) {
                    Counters::bump(&self.counters.version_negotiations_sent);
                }
            } else {
                Counters::bump(&self.counters.datagrams_dropped);
            }
            return;
        }

        if packet_type != Some(LongPacketType::Initial) {
            trace!("Dropping {:?} packet for unknown connection {}", packet_type, dcid);
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        }

        if packet.size() < MIN_INITIAL_PACKET_SIZE {
            debug!("Dropping undersized Initial ({} bytes) from {}", packet.size(), packet.remote_addr);
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        }

        if self.registry.is_closed() {
            Counters::bump(&self.counters.datagrams_dropped);
            return;
        }

        if self.pending.load(Ordering::Acquire) >= self.config.endpoint.max_pending_connections {
            debug!("Too many pending connections, dropping Initial from {}", packet.remote_addr);
            Counters::bump(&self.counters.connections_refused);
            return;
        }

        if self.config.endpoint.require_address_validation {
            let token = token.unwrap_or_default();
            if !self.token_validator.validate(&token, packet.remote_addr) {
                warn!("Refusing connection from {}: {}", packet.remote_addr, ConnectionError::InvalidToken);
                Counters::bump(&self.counters.connections_refused);
                return;
            }
        }

        let local_connection_id = match self.id_generator.generate() {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to generate connection ID: {}", e);
                Counters::bump(&self.counters.connections_refused);
                return;
            }
        };

        let parts = match factory.new_connection(packet.remote_addr, version, &dcid) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Connection factory refused {}: {}", packet.remote_addr, e);
                Counters::bump(&self.counters.connections_refused);
                return;
            }
        };

        let conn = Connection::new(ConnectionParams {
            role: Role::Server,
            version,
            remote_addr: packet.remote_addr,
            local_connection_id,
            remote_connection_id: scid,
            original_destination: Some(dcid),
            config: self.config.connection.clone(),
            runner: self.registry.clone(),
            id_generator: self.id_generator.clone(),
            outbound: self.outbound.clone(),
            parts,
        });

        if !conn.register() {
            warn!("Connection ID collision admitting {}", packet.remote_addr);
            Counters::bump(&self.counters.connections_refused);
            return;
        }

        info!(conn = %conn.trace_id(), "Accepted new connection from {}", packet.remote_addr);
        Counters::bump(&self.counters.connections_admitted);
        self.pending.fetch_add(1, Ordering::AcqRel);
        conn.handle_packet(packet);
        self.spawn_connection(conn, true);
    }

    /// Run a connection in its own task. Server connections are handed to
    /// `accept` once ready.
    fn spawn_connection(self: &Arc<Self>, conn: Arc<Connection>, announce: bool) {
        let inner = self.clone();
        tokio::spawn(async move {
            let announcement = async {
                if !announce {
                    return;
                }
                let ready = if inner.config.connection.allow_early_data {
                    conn.early_ready().await
                } else {
                    conn.handshake_complete().await
                };

                if let Err(err) = ready {
                    inner.pending.fetch_sub(1, Ordering::AcqRel);
                    debug!(conn = %conn.trace_id(), "Connection failed before accept: {}", err);
                    return;
                }
                if let Err(err) = inner.accept_tx.try_send(conn.clone()) {
                    inner.pending.fetch_sub(1, Ordering::AcqRel);
                    Counters::bump(&inner.counters.connections_refused);
                    let reason = match err {
                        TrySendError::Full(_) => "accept queue full",
                        TrySendError::Closed(_) => "endpoint closed",
                    };
                    warn!(conn = %conn.trace_id(), "Refusing connection from {}: {}", conn.remote_addr(), reason);
                    conn.close_with_transport_error(TransportErrorCode::CONNECTION_REFUSED);
                }
            };

            let (result, ()) = tokio::join!(conn.clone().run(), announcement);
            match result {
                Ok(()) => debug!(conn = %conn.trace_id(), "Connection closed"),
                Err(err) => debug!(conn = %conn.trace_id(), "Connection terminated: {}", err),
            }
        });
    }

    /// Queue a datagram for the writer. Never blocks.
    fn send(&self, destination: SocketAddr, payload: Bytes) -> bool {
        match self.outbound.try_send(Datagram { destination, payload }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full, dropping datagram to {}", destination);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// The only task that writes to the socket
async fn write_loop(socket: Arc<UdpSocket>, mut outbound_rx: mpsc::Receiver<Datagram>) {
    while let Some(datagram) = outbound_rx.recv().await {
        match socket.send_to(&datagram.payload, datagram.destination).await {
            Ok(sent) => trace!("Sent {} bytes to {}", sent, datagram.destination),
            Err(e) => warn!("Failed to send packet to {}: {}", datagram.destination, e),
        }
    }
}
