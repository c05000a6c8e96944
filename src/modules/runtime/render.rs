//! Result rendering onto the native transport

use axum::body::Body;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use edgeserv_core::EdgeservError;
use edgeserv_types::{BoxError, ChunkSource, HeaderPairs, ResultVariant};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, error, warn};

/// Diagnostic response for result tags the renderer does not recognize.
/// Unreachable for well-formed producers.
const UNHANDLED_VARIANT_STATUS: StatusCode = StatusCode::SERVICE_UNAVAILABLE;
const UNHANDLED_VARIANT_BODY: &str = "Server hasn't implemented this yet";

/// An error annotated with the status and headers chosen for it, so the
/// surrounding layer can finish the response idiomatically.
#[derive(Debug)]
pub struct RenderedError {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub error: EdgeservError,
}

impl RenderedError {
    /// Annotate an error with its own status code and no extra headers.
    pub fn from_error(error: EdgeservError) -> Self {
        let status = StatusCode::from_u16(error.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            status,
            headers: HeaderMap::new(),
            error,
        }
    }
}

impl IntoResponse for RenderedError {
    fn into_response(self) -> Response {
        // Engine-attributed client errors are meant for the client verbatim;
        // everything else goes out sanitized.
        let message = match (&self.error, self.status.is_client_error()) {
            (EdgeservError::Engine(msg), true) => msg.clone(),
            (error, _) => error.sanitized_message(),
        };
        let mut response = Response::new(Body::from(message));
        *response.status_mut() = self.status;
        for (name, value) in self.headers.iter() {
            response.headers_mut().append(name.clone(), value.clone());
        }
        response
    }
}

/// Translate one result variant into a response.
///
/// The `Error` variant is returned as `Err` carrying the chosen status; the
/// caller logs it and finishes the response through
/// [`RenderedError::into_response`]. Every other variant, including the
/// safety-net arm for unrecognized tags, renders to `Ok`.
pub fn render(variant: ResultVariant) -> Result<Response, RenderedError> {
    match variant {
        ResultVariant::Error {
            status,
            headers,
            message,
        } => Err(RenderedError {
            status: status_code(status),
            headers: header_map(&headers),
            error: EdgeservError::Engine(message),
        }),

        ResultVariant::Buffer {
            status,
            headers,
            buffer,
        } => Ok(response_with(status, &headers, Body::from(buffer))),

        ResultVariant::Json {
            status,
            headers,
            json,
        } => {
            let bytes = serde_json::to_vec(&json)
                .map_err(|e| RenderedError::from_error(EdgeservError::from(e)))?;
            Ok(response_with(status, &headers, Body::from(bytes)))
        }

        ResultVariant::NoContent { status, headers } => {
            Ok(response_with(status, &headers, Body::empty()))
        }

        ResultVariant::BufferStream {
            status,
            headers,
            low_latency,
            source,
        } => {
            let mut response = response_with(status, &headers, Body::empty());
            if low_latency {
                // Flush-over-batching hints; the socket itself is tuned at
                // accept time by the lifecycle manager.
                response
                    .headers_mut()
                    .entry(header::CACHE_CONTROL)
                    .or_insert(HeaderValue::from_static("no-cache"));
                response
                    .headers_mut()
                    .entry(HeaderName::from_static("x-accel-buffering"))
                    .or_insert(HeaderValue::from_static("no"));
            }
            *response.body_mut() = Body::from_stream(RenderedStream::new(source));
            Ok(response)
        }

        // ResultVariant is non_exhaustive: a tag this renderer does not know
        // is a producer defect, not a request error.
        other => {
            error!(
                kind = other.kind(),
                status = other.status(),
                "unhandled result variant, answering with fixed diagnostic"
            );
            let mut response = Response::new(Body::from(UNHANDLED_VARIANT_BODY));
            *response.status_mut() = UNHANDLED_VARIANT_STATUS;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            Ok(response)
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn response_with(status: u16, headers: &HeaderPairs, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status_code(status);
    *response.headers_mut() = header_map(headers);
    response
}

/// Convert transport-neutral header pairs, skipping (and logging) any pair
/// the transport cannot represent.
fn header_map(pairs: &HeaderPairs) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => warn!(header = %name, "skipping response header the transport cannot represent"),
        }
    }
    map
}

/// Adapter pulling a [`ChunkSource`] into the outgoing body, one chunk at a
/// time, in source order.
///
/// If the adapter is dropped before the source is exhausted (client
/// disconnect, transport write failure), cancellation is propagated into the
/// source exactly once. A source that fails on its own has nothing left to
/// cancel.
struct RenderedStream {
    source: Option<ChunkSource>,
    exhausted: bool,
}

impl RenderedStream {
    fn new(source: ChunkSource) -> Self {
        Self {
            source: Some(source),
            exhausted: false,
        }
    }
}

impl Stream for RenderedStream {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(source).poll_next(cx) {
            Poll::Ready(None) => {
                this.exhausted = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                // The source itself failed; it is terminal and needs no
                // cancellation. Surface the original error.
                this.exhausted = true;
                error!(error = %e, "chunk source failed mid-stream");
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for RenderedStream {
    fn drop(&mut self) {
        if !self.exhausted {
            if let Some(source) = self.source.as_mut() {
                debug!("response stream closed before the source was exhausted, cancelling");
                source.cancel("response stream closed before the source was exhausted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn chunk(bytes: &'static [u8]) -> Bytes {
        Bytes::from_static(bytes)
    }

    #[tokio::test]
    async fn test_render_json() {
        let variant = ResultVariant::json(200, serde_json::json!({"data": {"ok": true}}));
        let response = render(variant).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json; charset=utf-8"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"data": {"ok": true}}));
    }

    #[tokio::test]
    async fn test_render_buffer_and_no_content() {
        let variant = ResultVariant::buffer(200, "text/html; charset=utf-8", "<!doctype html>");
        let response = render(variant).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<!doctype html>");

        let response = render(ResultVariant::no_content()).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_render_error_carries_status() {
        let mut variant = ResultVariant::error(422, "syntax error at line 1");
        if let ResultVariant::Error { headers, .. } = &mut variant {
            headers.push(("content-type".to_string(), "text/plain".to_string()));
        }
        let rendered = render(variant).unwrap_err();
        assert_eq!(rendered.status, StatusCode::UNPROCESSABLE_ENTITY);

        let response = rendered.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        // client errors pass the engine's message through verbatim
        assert_eq!(&body[..], b"syntax error at line 1");
    }

    #[tokio::test]
    async fn test_rendered_server_error_is_sanitized() {
        let rendered = render(ResultVariant::error(500, "stack trace at executor.rs")).unwrap_err();
        let response = rendered.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Query execution failed");
    }

    #[tokio::test]
    async fn test_stream_chunks_concatenated_in_order() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let source = ChunkSource::from_chunks(vec![chunk(b"b1"), chunk(b"b2"), chunk(b"b3")])
            .on_stop(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let variant = ResultVariant::buffer_stream(200, Vec::new(), false, source);
        let response = render(variant).unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"b1b2b3");
        // the source drained fully, so nothing was cancelled
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_low_latency_adds_flush_hints() {
        let variant = ResultVariant::buffer_stream(
            200,
            vec![(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            )],
            true,
            ChunkSource::from_chunks(vec![]),
        );
        let response = render(variant).unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");
    }

    #[tokio::test]
    async fn test_source_error_terminates_without_cancel() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let inner = futures::stream::iter(vec![
            Ok(chunk(b"b1")),
            Err::<Bytes, BoxError>("producer exploded".into()),
        ]);
        let source = ChunkSource::new(inner).on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut stream = RenderedStream::new(source);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"b1");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
        drop(stream);
        // the error was terminal, cancellation ran zero times (at most once)
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_early_drop_cancels_exactly_once() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = cancels.clone();
        let source = ChunkSource::from_chunks(vec![chunk(b"b1"), chunk(b"b2")]).on_stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut stream = RenderedStream::new(source);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"b1");
        drop(stream);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_early_drop_falls_back_to_fail_hook() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let source = ChunkSource::from_chunks(vec![chunk(b"b1")]).on_fail(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let stream = RenderedStream::new(source);
        drop(stream);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_header_pairs_are_skipped() {
        let map = header_map(&vec![
            ("content-type".to_string(), "text/plain".to_string()),
            ("bad name".to_string(), "value".to_string()),
            ("x-ok".to_string(), "bad\nvalue".to_string()),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map[header::CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn test_from_error_uses_error_status() {
        let rendered = RenderedError::from_error(EdgeservError::BodyRead("eof".into()));
        assert_eq!(rendered.status, StatusCode::BAD_REQUEST);
        let rendered = RenderedError::from_error(EdgeservError::MethodNotAllowed("GET".into()));
        assert_eq!(rendered.status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
