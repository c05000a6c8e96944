//! Query engine trait definition

use async_trait::async_trait;
use axum::http::request::Parts;
use edgeserv_core::Result;
use edgeserv_types::{ChunkSource, ResultVariant};
use futures::future::BoxFuture;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_tungstenite::WebSocketStream;

use crate::digest::RequestDigest;

/// Server-side WebSocket over an upgraded HTTP connection
pub type WsStream = WebSocketStream<TokioIo<Upgraded>>;

/// Externally supplied handler for upgraded connections.
///
/// Receives the request head that initiated the upgrade and the established
/// WebSocket. The broker obtains this lazily, once, on first attach; it stays
/// `None` when upgrades are disabled.
pub type UpgradeHandler = Arc<dyn Fn(Parts, WsStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Interface to the query-execution engine the adaptor fronts.
///
/// The engine owns schema construction, planning and execution; the adaptor
/// only converts digests into these calls and result variants back into
/// transport actions.
#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    /// Execute the query described by the digest.
    async fn execute_query(&self, digest: &mut RequestDigest) -> Result<ResultVariant>;

    /// Render the interactive console for the request.
    async fn render_console(&self, digest: &mut RequestDigest) -> Result<ResultVariant>;

    /// Produce a fresh stream of watch/subscription events.
    ///
    /// Each call returns an independent, finite, non-restartable sequence.
    fn event_stream(&self) -> ChunkSource;

    /// Handler for upgraded connections, if the engine supports them.
    fn upgrade_handler(&self) -> Option<UpgradeHandler> {
        None
    }
}
