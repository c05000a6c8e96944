//! The Edgeserv adaptor: route multiplexing and listener lifecycle

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderValue};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use edgeserv_core::{EdgeservError, Result};
use edgeserv_types::{Capabilities, DynamicOptions, ResultVariant};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::digest::RequestDigest;
use crate::engine::QueryEngine;
use crate::lifecycle::ReleaseHooks;
use crate::render::{render, RenderedError};
use crate::upgrade::{is_upgrade_request, UpgradeBroker};

/// The adaptor tying a [`QueryEngine`] to the HTTP transport.
///
/// One instance serves three wire behaviors on overlapping paths: one-shot
/// query execution, event-stream style streaming, and connection upgrades.
/// Which behavior a request triggers is decided per request from path,
/// method and headers; when every configured path coincides, precedence is
/// deterministic: stream, then console, then query.
pub struct Edgeserv<E> {
    inner: Arc<Inner<E>>,
}

struct Inner<E> {
    engine: E,
    options: DynamicOptions,
    broker: UpgradeBroker,
    hooks: ReleaseHooks,
}

impl<E> Clone for Edgeserv<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: QueryEngine> Edgeserv<E> {
    /// Create an adaptor from an engine and an already-resolved option set.
    pub fn new(engine: E, options: DynamicOptions) -> Self {
        let broker = UpgradeBroker::new(&options);
        Self {
            inner: Arc::new(Inner {
                engine,
                options,
                broker,
                hooks: ReleaseHooks::new(),
            }),
        }
    }

    pub fn options(&self) -> &DynamicOptions {
        &self.inner.options
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.options.capabilities()
    }

    /// Register a teardown callback to run on [`release`](Self::release).
    pub fn on_release(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.hooks.on_release(hook);
    }

    /// Run all registered release hooks once, in order. Idempotent.
    pub fn release(&self) {
        self.inner.hooks.release();
    }

    /// Build the dispatch table for the host router.
    ///
    /// Registration rules, in priority order: the query path always takes
    /// POST, and GET as well when queries run over GET, the console is served
    /// from the query path, or the stream path collapses onto it; a dedicated
    /// GET-only console route exists when enabled on its own path; a
    /// dedicated GET-only stream route exists when watching on its own path.
    pub fn router(&self) -> Router {
        let options = &self.inner.options;

        let serv = self.clone();
        let graphql_handler = move |req: Request| {
            let serv = serv.clone();
            async move { serv.handle_graphql(req).await }
        };
        let method_router = if options.allows_get_on_graphql_path() {
            post(graphql_handler.clone()).get(graphql_handler)
        } else {
            post(graphql_handler)
        };
        let mut router = Router::new().route(&options.graphql_path, method_router);

        if options.graphiql && options.graphiql_path != options.graphql_path {
            let serv = self.clone();
            router = router.route(
                &options.graphiql_path,
                get(move |req: Request| {
                    let serv = serv.clone();
                    async move { serv.console_response(RequestDigest::new(req)).await }
                }),
            );
        }

        if options.watch && options.event_stream_path != options.graphql_path {
            let serv = self.clone();
            router = router.route(
                &options.event_stream_path,
                get(move || {
                    let serv = serv.clone();
                    async move { serv.event_stream_response() }
                }),
            );
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Attach to a listener owned by the host and serve until released.
    ///
    /// Arms the upgrade broker (at most once per broker), registers its
    /// disarm and the accept-loop shutdown as release hooks, then accepts
    /// connections. When streaming or upgrades are enabled, accepted sockets
    /// are tuned for immediate flushing before any response is written on
    /// them. Upgrade requests are always intercepted ahead of the router:
    /// the broker decides them by path alone, and a disabled or released
    /// broker answers every one by closing the connection.
    pub async fn attach(&self, listener: TcpListener) -> Result<()> {
        self.inner
            .broker
            .arm(|| self.inner.engine.upgrade_handler());
        {
            let inner = self.inner.clone();
            self.inner.hooks.on_release(move || inner.broker.disarm());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.inner.hooks.on_release(move || {
            let _ = shutdown_tx.send(true);
        });

        let router = self.router();
        let addr = listener.local_addr()?;
        let tune_sockets = self.inner.options.watch || self.inner.options.websockets;
        info!(addr = %addr, upgrades = self.inner.broker.is_armed(), "edgeserv attached");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("release requested, detaching from listener");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    if tune_sockets {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!(error = %e, peer = %peer, "failed to tune accepted socket");
                        }
                    }

                    let serv = self.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req: hyper::Request<Incoming>| {
                            let serv = serv.clone();
                            let router = router.clone();
                            async move {
                                let req = req.map(Body::new);
                                if is_upgrade_request(req.headers()) {
                                    Ok::<_, Infallible>(serv.inner.broker.intercept(req))
                                } else {
                                    router.oneshot(req).await
                                }
                            }
                        });
                        if let Err(e) = auto::Builder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, service)
                            .await
                        {
                            debug!(error = %e, peer = %peer, "connection ended with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Per-request behavior on the query path.
    async fn handle_graphql(&self, req: Request) -> Response {
        let digest = RequestDigest::new(req);
        let options = &self.inner.options;

        if digest.method == Method::GET {
            // collapsed stream path: an exact event-stream Accept wins
            if options.capabilities().collapsed_stream_path
                && digest.header("accept") == Some("text/event-stream")
            {
                debug!(path = %digest.path, "negotiated event stream on the query path");
                return self.event_stream_response();
            }
            if options.console_on_graphql_get() && accepts_html(digest.header("accept")) {
                return self.console_response(digest).await;
            }
            if !options.graphql_over_get {
                debug!(path = %digest.path, "GET not permitted for query execution");
                let mut response =
                    RenderedError::from_error(EdgeservError::MethodNotAllowed("GET".to_string()))
                        .into_response();
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static("POST"));
                return response;
            }
        }

        self.query_response(digest).await
    }

    async fn query_response(&self, mut digest: RequestDigest) -> Response {
        match self.inner.engine.execute_query(&mut digest).await {
            Ok(variant) => self.finish(variant),
            Err(e) => self.engine_failure(e),
        }
    }

    async fn console_response(&self, mut digest: RequestDigest) -> Response {
        match self.inner.engine.render_console(&mut digest).await {
            Ok(variant) => self.finish(variant),
            Err(e) => self.engine_failure(e),
        }
    }

    fn event_stream_response(&self) -> Response {
        let source = self.inner.engine.event_stream();
        let headers = vec![
            (
                "content-type".to_string(),
                "text/event-stream".to_string(),
            ),
            ("cache-control".to_string(), "no-cache".to_string()),
        ];
        self.finish(ResultVariant::buffer_stream(200, headers, true, source))
    }

    /// Finish a rendered result, logging error results instead of
    /// swallowing them.
    fn finish(&self, variant: ResultVariant) -> Response {
        match render(variant) {
            Ok(response) => response,
            Err(rendered) => {
                if rendered.error.is_error() {
                    error!(status = %rendered.status, error = %rendered.error, "request failed");
                } else {
                    debug!(status = %rendered.status, error = %rendered.error, "request failed");
                }
                rendered.into_response()
            }
        }
    }

    fn engine_failure(&self, error: EdgeservError) -> Response {
        if error.is_error() {
            error!(error = %error, "engine call failed");
        } else {
            debug!(error = %error, "engine rejected request");
        }
        RenderedError::from_error(error).into_response()
    }
}

fn accepts_html(accept: Option<&str>) -> bool {
    accept.is_some_and(|value| value.contains("text/html"))
}
