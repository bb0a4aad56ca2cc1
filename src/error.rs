use std::fmt;
use thiserror::Error;

/// QUIC transport error code carried in CONNECTION_CLOSE frames (RFC 9000 Section 20.1).
///
/// Codes are wire values and pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportErrorCode(pub u64);

impl TransportErrorCode {
    pub const NO_ERROR: Self = Self(0x0);
    pub const INTERNAL_ERROR: Self = Self(0x1);
    pub const CONNECTION_REFUSED: Self = Self(0x2);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const STREAM_LIMIT_ERROR: Self = Self(0x4);
    pub const STREAM_STATE_ERROR: Self = Self(0x5);
    pub const FINAL_SIZE_ERROR: Self = Self(0x6);
    pub const FRAME_ENCODING_ERROR: Self = Self(0x7);
    pub const TRANSPORT_PARAMETER_ERROR: Self = Self(0x8);
    pub const CONNECTION_ID_LIMIT_ERROR: Self = Self(0x9);
    pub const PROTOCOL_VIOLATION: Self = Self(0xa);
    pub const INVALID_TOKEN: Self = Self(0xb);
    pub const APPLICATION_ERROR: Self = Self(0xc);
    pub const CRYPTO_BUFFER_EXCEEDED: Self = Self(0xd);
    pub const KEY_UPDATE_ERROR: Self = Self(0xe);
    pub const AEAD_LIMIT_REACHED: Self = Self(0xf);
    pub const NO_VIABLE_PATH: Self = Self(0x10);

    /// First code of the range reserved for TLS alerts.
    pub const CRYPTO_ERROR: Self = Self(0x100);

    /// TLS `no_application_protocol` alert.
    pub const NO_APPLICATION_PROTOCOL: Self = Self::crypto(120);

    /// Transport code for a TLS alert.
    pub const fn crypto(alert: u8) -> Self {
        Self(Self::CRYPTO_ERROR.0 | alert as u64)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_crypto_error(&self) -> bool {
        (0x100..=0x1ff).contains(&self.0)
    }

    fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            Self::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            Self::STREAM_LIMIT_ERROR => "STREAM_LIMIT_ERROR",
            Self::STREAM_STATE_ERROR => "STREAM_STATE_ERROR",
            Self::FINAL_SIZE_ERROR => "FINAL_SIZE_ERROR",
            Self::FRAME_ENCODING_ERROR => "FRAME_ENCODING_ERROR",
            Self::TRANSPORT_PARAMETER_ERROR => "TRANSPORT_PARAMETER_ERROR",
            Self::CONNECTION_ID_LIMIT_ERROR => "CONNECTION_ID_LIMIT_ERROR",
            Self::PROTOCOL_VIOLATION => "PROTOCOL_VIOLATION",
            Self::INVALID_TOKEN => "INVALID_TOKEN",
            Self::APPLICATION_ERROR => "APPLICATION_ERROR",
            Self::CRYPTO_BUFFER_EXCEEDED => "CRYPTO_BUFFER_EXCEEDED",
            Self::KEY_UPDATE_ERROR => "KEY_UPDATE_ERROR",
            Self::AEAD_LIMIT_REACHED => "AEAD_LIMIT_REACHED",
            Self::NO_VIABLE_PATH => "NO_VIABLE_PATH",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None if self.is_crypto_error() => write!(f, "CRYPTO_ERROR({:#x})", self.0 & 0xff),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

impl From<u64> for TransportErrorCode {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Final error of a connection, recorded exactly once when it is destroyed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("transport error {code} (remote: {remote}): {reason}")]
    Transport {
        code: TransportErrorCode,
        remote: bool,
        reason: String,
    },

    #[error("application error {code:#x} (remote: {remote}): {reason}")]
    Application {
        code: u64,
        remote: bool,
        reason: String,
    },

    #[error("received a stateless reset")]
    StatelessReset,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("no application protocol for version {version:#010x}")]
    NoApplicationProtocol { version: u32 },

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("address validation token rejected")]
    InvalidToken,

    #[error("shut down: {0}")]
    Shutdown(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConnectionError {
    /// Error for a connection we close ourselves with a transport code.
    pub fn local_transport(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        Self::Transport {
            code,
            remote: false,
            reason: reason.into(),
        }
    }

    /// Transport code to put on the wire when this error terminates a connection.
    pub fn transport_code(&self) -> TransportErrorCode {
        match self {
            Self::Transport { code, .. } => *code,
            Self::Application { .. } => TransportErrorCode::APPLICATION_ERROR,
            Self::HandshakeFailed(_) => TransportErrorCode::crypto(40), // handshake_failure
            Self::NoApplicationProtocol { .. } => TransportErrorCode::NO_APPLICATION_PROTOCOL,
            Self::InvalidToken => TransportErrorCode::INVALID_TOKEN,
            Self::Shutdown(_) => TransportErrorCode::NO_ERROR,
            Self::Internal(_) => TransportErrorCode::INTERNAL_ERROR,
            Self::StatelessReset | Self::HandshakeTimeout | Self::IdleTimeout => {
                TransportErrorCode::NO_ERROR
            }
        }
    }

    /// Whether the error originated at the peer.
    pub fn is_remote(&self) -> bool {
        match self {
            Self::Transport { remote, .. } | Self::Application { remote, .. } => *remote,
            Self::StatelessReset => true,
            _ => false,
        }
    }
}

/// Errors raised while inspecting a datagram header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too small: {size} bytes")]
    TooSmall { size: usize },

    #[error("invalid header")]
    InvalidHeader,

    #[error("invalid connection ID length: {0}")]
    InvalidConnectionIdLength(usize),

    #[error("incomplete packet data")]
    IncompleteData,
}

#[derive(Error, Debug, Clone)]
pub enum QuicError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String), // String instead of std::io::Error for Clone

    #[error("endpoint closed")]
    EndpointClosed,
}

impl From<std::io::Error> for QuicError {
    fn from(err: std::io::Error) -> Self {
        QuicError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for QuicError {
    fn from(err: config::ConfigError) -> Self {
        QuicError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuicError>;
