//! Seam to packet protection and the frame codec
//!
//! The lifecycle engine only looks at the frames that affect routing and
//! teardown. Everything else is opaque and reported as [`Frame::Other`].

use bytes::Bytes;
use thiserror::Error;

use crate::connection_id::{ConnectionId, StatelessResetToken};
use crate::error::{Result, TransportErrorCode};
use crate::handshake::EncryptionLevel;
use crate::packet::ReceivedPacket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    Crypto {
        data: Bytes,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        reset_token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence: u64,
    },
    ConnectionClose {
        /// Transport code, or application code when `application` is set
        error_code: u64,
        /// Frame type that triggered a transport close
        frame_type: Option<u64>,
        reason: String,
        application: bool,
    },
    HandshakeDone,
    /// Any other frame, by type
    Other(u64),
}

impl Frame {
    pub fn transport_close(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        Self::ConnectionClose {
            error_code: code.value(),
            frame_type: None,
            reason: reason.into(),
            application: false,
        }
    }

    pub fn application_close(code: u64, reason: impl Into<String>) -> Self {
        Self::ConnectionClose {
            error_code: code,
            frame_type: None,
            reason: reason.into(),
            application: true,
        }
    }

    /// Whether receiving this frame counts as ack-eliciting activity
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::ConnectionClose { .. })
    }
}

/// A datagram after header protection removal and decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedPacket {
    pub level: EncryptionLevel,
    pub packet_number: u64,
    /// Source connection ID of a long header packet
    pub source_connection_id: Option<ConnectionId>,
    pub frames: Vec<Frame>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnpackError {
    /// AEAD open failed. May be a stateless reset.
    #[error("packet decryption failed")]
    DecryptionFailed,

    /// Keys for the packet's level are not available yet
    #[error("keys unavailable for {0:?}")]
    KeysUnavailable(EncryptionLevel),

    /// Authenticated but unparseable, fatal for the connection
    #[error("malformed packet: {reason}")]
    Malformed {
        code: TransportErrorCode,
        reason: String,
    },
}

/// Packet protection and frame encoding for one connection
pub trait PacketCodec: Send {
    fn unpack(&mut self, packet: &ReceivedPacket) -> std::result::Result<UnpackedPacket, UnpackError>;

    /// Build a protected datagram from `frames` at `level`
    fn pack(&mut self, level: EncryptionLevel, frames: &[Frame]) -> Result<Bytes>;

    /// Destination ID for outgoing packets changed
    fn set_peer_connection_id(&mut self, connection_id: &ConnectionId);
}
