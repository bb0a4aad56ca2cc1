//! Scripted collaborators shared by the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use quicmux::config::ConnectionConfig;
use quicmux::connection::{Connection, ConnectionParams, ConnectionParts, Role};
use quicmux::connection_id::{ConnectionId, RandomConnectionIdGenerator, StatelessResetKey, StatelessResetToken};
use quicmux::endpoint::ConnectionFactory;
use quicmux::frame::{Frame, PacketCodec, UnpackError, UnpackedPacket};
use quicmux::handshake::{CryptoSetup, EncryptionLevel, HandshakeError, HandshakeEvent};
use quicmux::packet::{Datagram, ReceivedPacket};
use quicmux::recovery::NoLossDetection;
use quicmux::registry::PacketHandlerMap;
use quicmux::version::QuicVersion;

/// Reset token the scripted server announces in its transport parameters
pub const SERVER_RESET_TOKEN: StatelessResetToken = StatelessResetToken::new([0xaa; 16]);

/// CRYPTO payloads understood by [`ScriptedCrypto`]
pub const EARLY: &[u8] = b"early";
pub const FINISH: &[u8] = b"finish";
pub const FAIL: &[u8] = b"fail";
pub const PARAMS: &[u8] = b"params";
pub const HANG: &[u8] = b"hang";

#[derive(Debug, Default)]
pub struct CryptoLog {
    pub alpn: Option<&'static str>,
    pub received: Vec<(EncryptionLevel, Bytes)>,
}

/// Handshake engine driven by the content of CRYPTO frames
pub struct ScriptedCrypto {
    start_events: Vec<HandshakeEvent>,
    log: Arc<Mutex<CryptoLog>>,
}

impl ScriptedCrypto {
    pub fn new(start_events: Vec<HandshakeEvent>) -> (Self, Arc<Mutex<CryptoLog>>) {
        let log = Arc::new(Mutex::new(CryptoLog::default()));
        (
            Self {
                start_events,
                log: log.clone(),
            },
            log,
        )
    }

    /// A client's first flight
    pub fn client_hello() -> Vec<HandshakeEvent> {
        vec![HandshakeEvent::WriteCrypto {
            level: EncryptionLevel::Initial,
            data: Bytes::from_static(b"client hello"),
        }]
    }
}

#[async_trait]
impl CryptoSetup for ScriptedCrypto {
    async fn start(&mut self, alpn: &'static str) -> Result<Vec<HandshakeEvent>, HandshakeError> {
        self.log.lock().alpn = Some(alpn);
        Ok(std::mem::take(&mut self.start_events))
    }

    async fn handle_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: Bytes,
    ) -> Result<Vec<HandshakeEvent>, HandshakeError> {
        self.log.lock().received.push((level, data.clone()));

        match &data[..] {
            EARLY => Ok(vec![
                HandshakeEvent::KeysDerived(EncryptionLevel::EarlyData),
                HandshakeEvent::EarlyDataAccepted,
            ]),
            FINISH => Ok(vec![
                HandshakeEvent::KeysDerived(EncryptionLevel::Handshake),
                HandshakeEvent::KeysDerived(EncryptionLevel::OneRtt),
                HandshakeEvent::HandshakeComplete,
            ]),
            PARAMS => Ok(vec![HandshakeEvent::TransportParameters {
                stateless_reset_token: Some(SERVER_RESET_TOKEN),
            }]),
            FAIL => Err(HandshakeError::Alert {
                alert: 42,
                reason: "bad certificate".to_string(),
            }),
            HANG => {
                // Certificate verification that never finishes
                std::future::pending::<()>().await;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Default)]
pub struct CodecState {
    /// Results handed out by `unpack`, in order
    pub script: VecDeque<Result<UnpackedPacket, UnpackError>>,
    pub packed: Vec<(EncryptionLevel, Vec<Frame>)>,
    pub peer_connection_ids: Vec<ConnectionId>,
}

impl CodecState {
    pub fn all_frames(&self) -> Vec<Frame> {
        self.packed.iter().flat_map(|(_, frames)| frames.clone()).collect()
    }

    pub fn close_frames(&self) -> Vec<Frame> {
        self.all_frames()
            .into_iter()
            .filter(|frame| matches!(frame, Frame::ConnectionClose { .. }))
            .collect()
    }
}

/// Packet protection replaced by a queue of pre-decided results
pub struct ScriptedCodec {
    state: Arc<Mutex<CodecState>>,
}

impl ScriptedCodec {
    pub fn new() -> (Self, Arc<Mutex<CodecState>>) {
        let state = Arc::new(Mutex::new(CodecState::default()));
        (Self { state: state.clone() }, state)
    }
}

impl PacketCodec for ScriptedCodec {
    fn unpack(&mut self, _packet: &ReceivedPacket) -> Result<UnpackedPacket, UnpackError> {
        self.state
            .lock()
            .script
            .pop_front()
            .unwrap_or(Err(UnpackError::KeysUnavailable(EncryptionLevel::OneRtt)))
    }

    fn pack(&mut self, level: EncryptionLevel, frames: &[Frame]) -> quicmux::Result<Bytes> {
        let mut state = self.state.lock();
        state.packed.push((level, frames.to_vec()));
        let mut packet = BytesMut::with_capacity(8);
        packet.put_u8(0x40);
        packet.put_u32(state.packed.len() as u32);
        Ok(packet.freeze())
    }

    fn set_peer_connection_id(&mut self, connection_id: &ConnectionId) {
        self.state.lock().peer_connection_ids.push(connection_id.clone());
    }
}

pub fn crypto_packet(level: EncryptionLevel, data: &'static [u8]) -> Result<UnpackedPacket, UnpackError> {
    frames_packet(level, vec![Frame::Crypto {
        data: Bytes::from_static(data),
    }])
}

pub fn frames_packet(level: EncryptionLevel, frames: Vec<Frame>) -> Result<UnpackedPacket, UnpackError> {
    Ok(UnpackedPacket {
        level,
        packet_number: 0,
        source_connection_id: None,
        frames,
    })
}

pub fn cid(byte: u8) -> ConnectionId {
    ConnectionId::from_slice(&[byte; 8]).unwrap()
}

pub fn peer_addr() -> SocketAddr {
    "127.0.0.1:4433".parse().unwrap()
}

pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout_ms: 10_000,
        max_idle_timeout_ms: 30_000,
        draining_period_ms: 300,
        active_connection_id_limit: 4,
        max_queued_packets: 64,
        allow_early_data: true,
    }
}

pub fn test_registry(retire_delay: Duration) -> Arc<PacketHandlerMap> {
    Arc::new(PacketHandlerMap::new(StatelessResetKey::new([0x5a; 32]), retire_delay))
}

/// One connection wired to a registry and an in-memory outbound queue
pub struct Harness {
    pub conn: Arc<Connection>,
    pub registry: Arc<PacketHandlerMap>,
    pub codec: Arc<Mutex<CodecState>>,
    pub crypto: Arc<Mutex<CryptoLog>>,
    pub outbound: mpsc::Receiver<Datagram>,
    pub local_id: ConnectionId,
    pub original_destination: Option<ConnectionId>,
}

pub struct HarnessBuilder {
    role: Role,
    version: QuicVersion,
    config: ConnectionConfig,
    registry: Option<Arc<PacketHandlerMap>>,
    start_events: Vec<HandshakeEvent>,
    local_id: ConnectionId,
}

impl HarnessBuilder {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            version: QuicVersion::V1,
            config: test_config(),
            registry: None,
            start_events: ScriptedCrypto::client_hello(),
            local_id: cid(0x01),
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            start_events: Vec::new(),
            local_id: cid(0x02),
            ..Self::client()
        }
    }

    pub fn version(mut self, version: QuicVersion) -> Self {
        self.version = version;
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<PacketHandlerMap>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn local_id(mut self, id: ConnectionId) -> Self {
        self.local_id = id;
        self
    }

    pub fn build(self) -> Harness {
        let registry = self.registry.unwrap_or_else(|| test_registry(Duration::ZERO));
        let (crypto, crypto_log) = ScriptedCrypto::new(self.start_events);
        let (codec, codec_state) = ScriptedCodec::new();
        let (outbound_tx, outbound) = mpsc::channel(256);

        let original_destination = match self.role {
            Role::Server => Some(ConnectionId::from_slice(&[self.local_id.as_bytes()[0] ^ 0xf0; 8]).unwrap()),
            Role::Client => None,
        };

        let conn = Connection::new(ConnectionParams {
            role: self.role,
            version: self.version,
            remote_addr: peer_addr(),
            local_connection_id: self.local_id.clone(),
            remote_connection_id: cid(0xee),
            original_destination: original_destination.clone(),
            config: self.config,
            runner: registry.clone(),
            id_generator: Arc::new(RandomConnectionIdGenerator::new(8)),
            outbound: outbound_tx,
            parts: ConnectionParts {
                crypto: Box::new(crypto),
                codec: Box::new(codec),
                recovery: Box::new(NoLossDetection::default()),
            },
        });
        assert!(conn.register());

        Harness {
            conn,
            registry,
            codec: codec_state,
            crypto: crypto_log,
            outbound,
            local_id: self.local_id,
            original_destination,
        }
    }
}

impl Harness {
    /// Queue `result` as the outcome of unpacking the next datagram, then deliver one
    pub fn deliver(&self, result: Result<UnpackedPacket, UnpackError>) {
        self.codec.lock().script.push_back(result);
        self.deliver_raw(Bytes::from_static(b"\x40datagram"));
    }

    /// Deliver a datagram without scripting its unpack result
    pub fn deliver_raw(&self, data: Bytes) {
        use quicmux::registry::PacketHandler;
        self.conn.handle_packet(ReceivedPacket::new(peer_addr(), data));
    }

    /// Datagrams written so far
    pub fn drain_outbound(&mut self) -> Vec<Datagram> {
        let mut datagrams = Vec::new();
        while let Ok(datagram) = self.outbound.try_recv() {
            datagrams.push(datagram);
        }
        datagrams
    }
}

/// Poll `condition` until it holds, letting spawned tasks run in between
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Factory for server connections that records the codec and crypto
/// handles of every connection it builds
#[derive(Default)]
pub struct ScriptedFactory {
    /// Unpack results given to each new connection's codec
    pub script: Mutex<Vec<Result<UnpackedPacket, UnpackError>>>,
    pub created: Mutex<Vec<(SocketAddr, ConnectionId, Arc<Mutex<CodecState>>)>>,
}

impl ConnectionFactory for ScriptedFactory {
    fn new_connection(
        &self,
        remote_addr: SocketAddr,
        _version: QuicVersion,
        original_destination: &ConnectionId,
    ) -> quicmux::Result<ConnectionParts> {
        let (crypto, _) = ScriptedCrypto::new(Vec::new());
        let (codec, state) = ScriptedCodec::new();
        state.lock().script.extend(self.script.lock().iter().cloned());
        self.created
            .lock()
            .push((remote_addr, original_destination.clone(), state));

        Ok(ConnectionParts {
            crypto: Box::new(crypto),
            codec: Box::new(codec),
            recovery: Box::new(NoLossDetection::default()),
        })
    }
}
