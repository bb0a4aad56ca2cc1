//! Seam to the TLS 1.3 handshake engine (RFC 9001)
//!
//! The connection feeds CRYPTO frame payloads in and acts on the events
//! that come back. Key schedule, certificate handling and transport
//! parameter encoding all live behind [`CryptoSetup`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::connection_id::StatelessResetToken;
use crate::error::TransportErrorCode;

/// Encryption levels for QUIC packets, in the order keys become available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EncryptionLevel {
    /// Initial packets (connection establishment)
    Initial,
    /// Early data (0-RTT)
    EarlyData,
    /// Handshake packets
    Handshake,
    /// Application data (1-RTT)
    OneRtt,
}

/// Output of the handshake engine, in the order it must be acted on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Handshake bytes to send at `level`
    WriteCrypto { level: EncryptionLevel, data: Bytes },
    /// Keys for `level` are installed
    KeysDerived(EncryptionLevel),
    /// 0-RTT keys are available and the peer permits early data
    EarlyDataAccepted,
    /// Peer transport parameters were authenticated
    TransportParameters {
        /// Reset token the server bound to its handshake connection ID
        stateless_reset_token: Option<StatelessResetToken>,
    },
    /// Both Finished messages verified
    HandshakeComplete,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// TLS alert raised locally or by the peer
    #[error("TLS alert {alert}: {reason}")]
    Alert { alert: u8, reason: String },

    /// Peer sent invalid transport parameters
    #[error("invalid transport parameters: {0}")]
    TransportParameters(String),

    #[error("handshake failed: {0}")]
    Other(String),
}

impl HandshakeError {
    /// Code to close the connection with
    pub fn transport_code(&self) -> TransportErrorCode {
        match self {
            Self::Alert { alert, .. } => TransportErrorCode::crypto(*alert),
            Self::TransportParameters(_) => TransportErrorCode::TRANSPORT_PARAMETER_ERROR,
            // handshake_failure
            Self::Other(_) => TransportErrorCode::crypto(40),
        }
    }
}

/// TLS handshake engine driven by one connection.
///
/// Calls may suspend (certificate verification, key logging). The
/// connection abandons a pending call when it is destroyed, so
/// implementations must tolerate being dropped mid-call.
#[async_trait]
pub trait CryptoSetup: Send {
    /// Begin the handshake offering or accepting `alpn`
    async fn start(&mut self, alpn: &'static str) -> Result<Vec<HandshakeEvent>, HandshakeError>;

    /// Process handshake bytes received in CRYPTO frames at `level`
    async fn handle_crypto_data(
        &mut self,
        level: EncryptionLevel,
        data: Bytes,
    ) -> Result<Vec<HandshakeEvent>, HandshakeError>;
}
