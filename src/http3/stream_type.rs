//! Unidirectional stream types (RFC 9114 Section 6.2, RFC 9204 Section 4.2)

use std::fmt;

pub const CONTROL_STREAM_TYPE: u64 = 0x00;
pub const PUSH_STREAM_TYPE: u64 = 0x01;
pub const QPACK_ENCODER_STREAM_TYPE: u64 = 0x02;
pub const QPACK_DECODER_STREAM_TYPE: u64 = 0x03;

/// Role of a unidirectional stream, named by its leading varint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// Reserved or unknown; the stream is ignored
    Unknown(u64),
}

impl StreamType {
    pub fn from_value(value: u64) -> Self {
        match value {
            CONTROL_STREAM_TYPE => Self::Control,
            PUSH_STREAM_TYPE => Self::Push,
            QPACK_ENCODER_STREAM_TYPE => Self::QpackEncoder,
            QPACK_DECODER_STREAM_TYPE => Self::QpackDecoder,
            other => Self::Unknown(other),
        }
    }

    pub fn value(&self) -> u64 {
        match self {
            Self::Control => CONTROL_STREAM_TYPE,
            Self::Push => PUSH_STREAM_TYPE,
            Self::QpackEncoder => QPACK_ENCODER_STREAM_TYPE,
            Self::QpackDecoder => QPACK_DECODER_STREAM_TYPE,
            Self::Unknown(value) => *value,
        }
    }

    /// At most one stream of this type per direction
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Control | Self::QpackEncoder | Self::QpackDecoder)
    }

    /// Reserved `0x1f * N + 0x21` values used to exercise unknown-type handling
    pub fn is_grease(&self) -> bool {
        match self {
            Self::Unknown(value) => *value >= 0x21 && (*value - 0x21) % 0x1f == 0,
            _ => false,
        }
    }
}

impl From<u64> for StreamType {
    fn from(value: u64) -> Self {
        Self::from_value(value)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Push => write!(f, "push"),
            Self::QpackEncoder => write!(f, "QPACK encoder"),
            Self::QpackDecoder => write!(f, "QPACK decoder"),
            Self::Unknown(value) => write!(f, "unknown ({:#x})", value),
        }
    }
}
