//! Unidirectional stream classification
//!
//! Reads the leading stream type of each peer-initiated unidirectional
//! stream and hands the rest of the stream to the matching handler.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

use super::error::{H3Error, H3ErrorCode};
use super::stream_type::StreamType;
use crate::connection::{Connection, Role};
use crate::varint;

/// Receive half of a unidirectional QUIC stream
pub trait RecvStream: AsyncRead + Unpin + Send {
    fn stream_id(&self) -> u64;

    /// Ask the peer to stop sending on this stream
    fn stop_sending(&mut self, code: H3ErrorCode);
}

/// Closes the whole connection on an HTTP/3 protocol error
pub trait ConnectionCloser: Send + Sync {
    fn close_with_application_error(&self, code: H3ErrorCode, reason: &str);
}

impl ConnectionCloser for Connection {
    fn close_with_application_error(&self, code: H3ErrorCode, reason: &str) {
        self.close_with_error(code.value(), reason);
    }
}

/// Receives classified streams. The stream is positioned after its type.
pub trait UniStreamHandler<S>: Send + Sync {
    fn control_stream(&self, stream: S);

    fn push_stream(&self, stream: S);

    fn qpack_encoder_stream(&self, stream: S);

    fn qpack_decoder_stream(&self, stream: S);
}

/// Outcome of classifying one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Dispatched(StreamType),
    /// Unknown type, stream aborted, connection unaffected
    Ignored(StreamType),
    /// Ended or failed before a complete type
    Truncated,
    /// Protocol error, connection closed with it
    Rejected(H3Error),
}

/// Per-connection classifier for peer-initiated unidirectional streams
#[derive(Debug)]
pub struct UniStreamClassifier {
    /// Our side of the connection
    role: Role,
    control_seen: AtomicBool,
    encoder_seen: AtomicBool,
    decoder_seen: AtomicBool,
}

impl UniStreamClassifier {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            control_seen: AtomicBool::new(false),
            encoder_seen: AtomicBool::new(false),
            decoder_seen: AtomicBool::new(false),
        }
    }

    pub async fn classify_and_dispatch<S: RecvStream>(
        &self,
        mut stream: S,
        handler: &dyn UniStreamHandler<S>,
        closer: &dyn ConnectionCloser,
    ) -> Classification {
        let stream_id = stream.stream_id();
        let value = match varint::read(&mut stream).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                trace!(stream_id, "Unidirectional stream ended before its type");
                return Classification::Truncated;
            }
            Err(e) => {
                debug!(stream_id, "Failed to read stream type: {}", e);
                return Classification::Truncated;
            }
        };

        let stream_type = StreamType::from_value(value);
        if let StreamType::Unknown(_) = stream_type {
            trace!(stream_id, grease = stream_type.is_grease(), "Ignoring {} stream", stream_type);
            stream.stop_sending(H3ErrorCode::STREAM_CREATION_ERROR);
            return Classification::Ignored(stream_type);
        }

        if stream_type == StreamType::Push && self.role == Role::Server {
            return self.reject(closer, stream_id, "client opened a push stream");
        }

        if let Some(seen) = self.seen_flag(stream_type) {
            if seen.swap(true, Ordering::AcqRel) {
                return self.reject(closer, stream_id, &format!("duplicate {} stream", stream_type));
            }
        }

        debug!(stream_id, "Accepted {} stream", stream_type);
        match stream_type {
            StreamType::Control => handler.control_stream(stream),
            StreamType::Push => handler.push_stream(stream),
            StreamType::QpackEncoder => handler.qpack_encoder_stream(stream),
            StreamType::QpackDecoder => handler.qpack_decoder_stream(stream),
            StreamType::Unknown(_) => {}
        }
        Classification::Dispatched(stream_type)
    }

    fn seen_flag(&self, stream_type: StreamType) -> Option<&AtomicBool> {
        match stream_type {
            StreamType::Control => Some(&self.control_seen),
            StreamType::QpackEncoder => Some(&self.encoder_seen),
            StreamType::QpackDecoder => Some(&self.decoder_seen),
            StreamType::Push | StreamType::Unknown(_) => None,
        }
    }

    fn reject(&self, closer: &dyn ConnectionCloser, stream_id: u64, reason: &str) -> Classification {
        warn!(stream_id, "Closing connection: {}", reason);
        let error = H3Error::new(H3ErrorCode::STREAM_CREATION_ERROR, reason);
        closer.close_with_application_error(error.code, &error.reason);
        Classification::Rejected(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio_test::io::{Builder, Mock};

    struct MockStream {
        id: u64,
        io: Mock,
        stopped: Arc<Mutex<Option<H3ErrorCode>>>,
    }

    impl MockStream {
        fn new(id: u64, bytes: &[u8]) -> Self {
            let mut builder = Builder::new();
            if !bytes.is_empty() {
                builder.read(bytes);
            }
            Self {
                id,
                io: builder.build(),
                stopped: Arc::new(Mutex::new(None)),
            }
        }
    }

    impl AsyncRead for MockStream {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl RecvStream for MockStream {
        fn stream_id(&self) -> u64 {
            self.id
        }

        fn stop_sending(&mut self, code: H3ErrorCode) {
            *self.stopped.lock() = Some(code);
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        streams: Mutex<Vec<(StreamType, u64)>>,
    }

    impl UniStreamHandler<MockStream> for RecordingHandler {
        fn control_stream(&self, stream: MockStream) {
            self.streams.lock().push((StreamType::Control, stream.id));
        }

        fn push_stream(&self, stream: MockStream) {
            self.streams.lock().push((StreamType::Push, stream.id));
        }

        fn qpack_encoder_stream(&self, stream: MockStream) {
            self.streams.lock().push((StreamType::QpackEncoder, stream.id));
        }

        fn qpack_decoder_stream(&self, stream: MockStream) {
            self.streams.lock().push((StreamType::QpackDecoder, stream.id));
        }
    }

    #[derive(Default)]
    struct RecordingCloser {
        closed: Mutex<Vec<H3ErrorCode>>,
    }

    impl ConnectionCloser for RecordingCloser {
        fn close_with_application_error(&self, code: H3ErrorCode, _reason: &str) {
            self.closed.lock().push(code);
        }
    }

    #[tokio::test]
    async fn test_dispatches_known_types() {
        let classifier = UniStreamClassifier::new(Role::Client);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        for (id, value) in [(3u64, 0u8), (7, 1), (11, 2), (15, 3)] {
            let result = classifier
                .classify_and_dispatch(MockStream::new(id, &[value]), &handler, &closer)
                .await;
            assert_eq!(result, Classification::Dispatched(StreamType::from_value(value as u64)));
        }

        assert_eq!(
            *handler.streams.lock(),
            vec![
                (StreamType::Control, 3),
                (StreamType::Push, 7),
                (StreamType::QpackEncoder, 11),
                (StreamType::QpackDecoder, 15),
            ]
        );
        assert!(closer.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let classifier = UniStreamClassifier::new(Role::Server);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        // 42 needs the two byte encoding
        let stream = MockStream::new(2, &[0x40, 0x2a]);
        let stopped = stream.stopped.clone();
        let result = classifier.classify_and_dispatch(stream, &handler, &closer).await;

        assert_eq!(result, Classification::Ignored(StreamType::Unknown(42)));
        assert_eq!(*stopped.lock(), Some(H3ErrorCode::STREAM_CREATION_ERROR));
        assert!(handler.streams.lock().is_empty());
        assert!(closer.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_grease_type_is_ignored() {
        let classifier = UniStreamClassifier::new(Role::Client);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        let result = classifier
            .classify_and_dispatch(MockStream::new(3, &[0x21]), &handler, &closer)
            .await;
        assert_eq!(result, Classification::Ignored(StreamType::Unknown(0x21)));

        // The control stream that follows is still accepted
        let result = classifier
            .classify_and_dispatch(MockStream::new(7, &[0x00]), &handler, &closer)
            .await;
        assert_eq!(result, Classification::Dispatched(StreamType::Control));
    }

    #[tokio::test]
    async fn test_second_control_stream_closes_connection() {
        let classifier = UniStreamClassifier::new(Role::Server);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        classifier
            .classify_and_dispatch(MockStream::new(2, &[0x00]), &handler, &closer)
            .await;
        let result = classifier
            .classify_and_dispatch(MockStream::new(6, &[0x00]), &handler, &closer)
            .await;

        assert!(matches!(
            result,
            Classification::Rejected(H3Error { code: H3ErrorCode::STREAM_CREATION_ERROR, .. })
        ));
        assert_eq!(*closer.closed.lock(), vec![H3ErrorCode::STREAM_CREATION_ERROR]);
        assert_eq!(handler.streams.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_qpack_streams_rejected() {
        let classifier = UniStreamClassifier::new(Role::Client);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        for (id, value) in [(3u64, 2u8), (7, 2), (11, 3), (15, 3)] {
            classifier
                .classify_and_dispatch(MockStream::new(id, &[value]), &handler, &closer)
                .await;
        }

        assert_eq!(closer.closed.lock().len(), 2);
        assert_eq!(
            *handler.streams.lock(),
            vec![(StreamType::QpackEncoder, 3), (StreamType::QpackDecoder, 11)]
        );
    }

    #[tokio::test]
    async fn test_push_stream_from_client_rejected() {
        let classifier = UniStreamClassifier::new(Role::Server);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        let result = classifier
            .classify_and_dispatch(MockStream::new(2, &[0x01]), &handler, &closer)
            .await;

        assert!(matches!(result, Classification::Rejected(_)));
        assert_eq!(*closer.closed.lock(), vec![H3ErrorCode::STREAM_CREATION_ERROR]);
    }

    #[tokio::test]
    async fn test_truncated_type_is_ignored() {
        let classifier = UniStreamClassifier::new(Role::Client);
        let handler = RecordingHandler::default();
        let closer = RecordingCloser::default();

        let empty = classifier
            .classify_and_dispatch(MockStream::new(3, &[]), &handler, &closer)
            .await;
        // First byte announces a four byte varint
        let partial = classifier
            .classify_and_dispatch(MockStream::new(7, &[0x80, 0x00]), &handler, &closer)
            .await;

        assert_eq!(empty, Classification::Truncated);
        assert_eq!(partial, Classification::Truncated);
        assert!(handler.streams.lock().is_empty());
        assert!(closer.closed.lock().is_empty());
    }
}
