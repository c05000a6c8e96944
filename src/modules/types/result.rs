//! Abstract result variants answered by a query engine
//!
//! An engine never touches the transport. It answers each request with a
//! [`ResultVariant`] describing what to send; the runtime's renderer turns
//! that description into concrete transport actions.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Boxed error type carried by chunk streams
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lazy, finite sequence of body chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Transport-neutral header mapping (ordered, duplicates allowed)
pub type HeaderPairs = Vec<(String, String)>;

/// A lazy, finite, non-restartable sequence of byte chunks plus its
/// cancellation capabilities.
///
/// The renderer pulls chunks one at a time and writes each to the outgoing
/// stream. If rendering stops before the sequence is exhausted (mid-stream
/// failure, client disconnect), [`ChunkSource::cancel`] tells the producer to
/// stop: the "stop early" hook is preferred, the "fail" hook is the fallback.
/// Both hooks are consumed on first use, so cancellation runs at most once.
pub struct ChunkSource {
    stream: ChunkStream,
    stop: Option<Box<dyn FnOnce() + Send>>,
    fail: Option<Box<dyn FnOnce(String) + Send>>,
}

impl ChunkSource {
    /// Wrap a chunk stream with no cancellation capabilities.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
            stop: None,
            fail: None,
        }
    }

    /// Build a source from pre-materialized chunks.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::new(stream::iter(chunks.into_iter().map(Ok)))
    }

    /// Attach a "stop early" capability, invoked when the consumer abandons
    /// the sequence before it is exhausted.
    pub fn on_stop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.stop = Some(Box::new(hook));
        self
    }

    /// Attach a "fail" capability, invoked with the failure reason when the
    /// consumer abandons the sequence and no stop capability exists.
    pub fn on_fail(mut self, hook: impl FnOnce(String) + Send + 'static) -> Self {
        self.fail = Some(Box::new(hook));
        self
    }

    /// Propagate cancellation into the producer, at most once.
    ///
    /// Prefers the stop capability, falls back to the fail capability. Any
    /// panic from the hook is swallowed so the error that triggered the
    /// cancellation is what surfaces to the caller.
    pub fn cancel(&mut self, reason: &str) {
        let stop = self.stop.take();
        let fail = self.fail.take();
        if let Some(stop) = stop {
            let _ = catch_unwind(AssertUnwindSafe(stop));
        } else if let Some(fail) = fail {
            let reason = reason.to_string();
            let _ = catch_unwind(AssertUnwindSafe(move || fail(reason)));
        }
    }

    /// Whether an unused cancellation capability remains.
    pub fn can_cancel(&self) -> bool {
        self.stop.is_some() || self.fail.is_some()
    }
}

impl Stream for ChunkSource {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSource")
            .field("stop", &self.stop.is_some())
            .field("fail", &self.fail.is_some())
            .finish_non_exhaustive()
    }
}

/// Tagged description of how to answer a request.
///
/// Exactly one variant applies per response. The enum is `#[non_exhaustive]`
/// on purpose: renderers in other crates must carry a wildcard arm, which is
/// the fixed safety net for tags they do not recognize.
#[non_exhaustive]
#[derive(Debug)]
pub enum ResultVariant {
    /// A failure to surface with the given status attached
    Error {
        status: u16,
        headers: HeaderPairs,
        message: String,
    },
    /// A materialized body of raw bytes
    Buffer {
        status: u16,
        headers: HeaderPairs,
        buffer: Bytes,
    },
    /// A materialized JSON body
    Json {
        status: u16,
        headers: HeaderPairs,
        json: serde_json::Value,
    },
    /// Status and headers only, no body
    NoContent { status: u16, headers: HeaderPairs },
    /// A lazy sequence of body chunks, written one at a time
    BufferStream {
        status: u16,
        headers: HeaderPairs,
        /// Favor immediate flushing over batching on the connection
        low_latency: bool,
        source: ChunkSource,
    },
}

impl ResultVariant {
    /// An error result with no extra headers.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self::Error {
            status,
            headers: Vec::new(),
            message: message.into(),
        }
    }

    /// A buffer result with the given content type.
    pub fn buffer(status: u16, content_type: &str, buffer: impl Into<Bytes>) -> Self {
        Self::Buffer {
            status,
            headers: vec![("content-type".to_string(), content_type.to_string())],
            buffer: buffer.into(),
        }
    }

    /// A JSON result with the standard content type.
    pub fn json(status: u16, json: serde_json::Value) -> Self {
        Self::Json {
            status,
            headers: vec![(
                "content-type".to_string(),
                "application/json; charset=utf-8".to_string(),
            )],
            json,
        }
    }

    /// An empty 204 result.
    pub fn no_content() -> Self {
        Self::NoContent {
            status: 204,
            headers: Vec::new(),
        }
    }

    /// A streaming result.
    pub fn buffer_stream(
        status: u16,
        headers: HeaderPairs,
        low_latency: bool,
        source: ChunkSource,
    ) -> Self {
        Self::BufferStream {
            status,
            headers,
            low_latency,
            source,
        }
    }

    /// The status code this variant carries.
    pub fn status(&self) -> u16 {
        match self {
            Self::Error { status, .. }
            | Self::Buffer { status, .. }
            | Self::Json { status, .. }
            | Self::NoContent { status, .. }
            | Self::BufferStream { status, .. } => *status,
        }
    }

    /// Variant tag name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error { .. } => "error",
            Self::Buffer { .. } => "buffer",
            Self::Json { .. } => "json",
            Self::NoContent { .. } => "noContent",
            Self::BufferStream { .. } => "bufferStream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_from_chunks_preserves_order() {
        let source = ChunkSource::from_chunks(vec![
            Bytes::from_static(b"b1"),
            Bytes::from_static(b"b2"),
            Bytes::from_static(b"b3"),
        ]);
        let chunks: Vec<Bytes> = block_on(source.map(|c| c.unwrap()).collect());
        assert_eq!(chunks, vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_cancel_prefers_stop() {
        let stops = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        let f = fails.clone();
        let mut source = ChunkSource::from_chunks(vec![])
            .on_stop(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .on_fail(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            });

        source.cancel("boom");
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(fails.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_falls_back_to_fail() {
        let reasons = Arc::new(std::sync::Mutex::new(Vec::new()));
        let r = reasons.clone();
        let mut source = ChunkSource::from_chunks(vec![]).on_fail(move |reason| {
            r.lock().unwrap().push(reason);
        });

        source.cancel("write failed");
        assert_eq!(*reasons.lock().unwrap(), vec!["write failed".to_string()]);
    }

    #[test]
    fn test_cancel_runs_at_most_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        let mut source = ChunkSource::from_chunks(vec![]).on_stop(move || {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert!(source.can_cancel());
        source.cancel("first");
        source.cancel("second");
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!source.can_cancel());
    }

    #[test]
    fn test_cancel_swallows_hook_panic() {
        let mut source =
            ChunkSource::from_chunks(vec![]).on_stop(|| panic!("uncooperative producer"));
        source.cancel("boom");
        assert!(!source.can_cancel());
    }

    #[test]
    fn test_variant_constructors() {
        let v = ResultVariant::json(200, serde_json::json!({"data": null}));
        assert_eq!(v.status(), 200);
        assert_eq!(v.kind(), "json");

        let v = ResultVariant::no_content();
        assert_eq!(v.status(), 204);
        assert_eq!(v.kind(), "noContent");

        let v = ResultVariant::error(422, "bad query");
        assert_eq!(v.status(), 422);
        assert_eq!(v.kind(), "error");

        let v = ResultVariant::buffer(200, "text/html", "<html></html>");
        assert_eq!(v.kind(), "buffer");

        let v =
            ResultVariant::buffer_stream(200, Vec::new(), true, ChunkSource::from_chunks(vec![]));
        assert_eq!(v.kind(), "bufferStream");
    }
}
