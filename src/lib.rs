//! Connection-ID demultiplexing and connection lifecycle for QUIC
//!
//! One [`Endpoint`] owns a UDP socket and a [`PacketHandlerMap`] routing
//! connection IDs and stateless reset tokens to [`Connection`]s. TLS, packet
//! protection, loss recovery and retry tokens are supplied through the
//! collaborator traits in [`handshake`], [`frame`], [`recovery`] and
//! [`token`]. The [`http3`] module classifies unidirectional streams for an
//! HTTP/3 layer built on top.

pub mod config;
pub mod connection;
pub mod connection_id;
pub mod connection_state;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http3;
pub mod packet;
pub mod recovery;
pub mod registry;
pub mod token;
pub mod varint;
pub mod version;

pub use config::QuicConfig;
pub use connection::{Connection, ConnectionParams, ConnectionParts, Role};
pub use connection_id::{ConnectionId, StatelessResetKey, StatelessResetToken};
pub use connection_state::LifecycleState;
pub use endpoint::{ConnectionFactory, Endpoint, EndpointBuilder};
pub use error::{ConnectionError, QuicError, Result, TransportErrorCode};
pub use registry::{ConnectionRunner, PacketHandler, PacketHandlerMap};
pub use version::{NEXT_PROTO_H3, QuicVersion, version_to_alpn};

pub mod prelude {
    pub use crate::config::QuicConfig;
    pub use crate::connection::{Connection, ConnectionParts, Role};
    pub use crate::connection_id::ConnectionId;
    pub use crate::endpoint::{ConnectionFactory, Endpoint};
    pub use crate::error::{ConnectionError, QuicError, TransportErrorCode};
    pub use crate::frame::{Frame, PacketCodec};
    pub use crate::handshake::{CryptoSetup, EncryptionLevel, HandshakeEvent};
    pub use crate::recovery::{LossDetection, NoLossDetection};
    pub use crate::version::QuicVersion;
}
