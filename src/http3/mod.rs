//! HTTP/3 stream multiplexing over QUIC
//!
//! Only the unidirectional stream layer lives here: stream types, the
//! classifier that routes peer streams by type, and the HTTP/3 error codes
//! it closes connections with. Frames and QPACK state machines are
//! provided by the layers built on top.

pub mod classifier;
pub mod error;
pub mod stream_type;

pub use classifier::{Classification, ConnectionCloser, RecvStream, UniStreamClassifier, UniStreamHandler};
pub use error::{H3Error, H3ErrorCode};
pub use stream_type::StreamType;
