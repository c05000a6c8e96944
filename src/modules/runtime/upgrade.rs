//! Connection-upgrade brokering

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use edgeserv_types::DynamicOptions;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::engine::UpgradeHandler;

/// Subprotocols echoed back to clients, in preference order.
const SUPPORTED_SUBPROTOCOLS: [&str; 2] = ["graphql-transport-ws", "graphql-ws"];

/// Decides whether an upgrade request is accepted and hands accepted ones to
/// the externally supplied handler.
///
/// The broker starts `disabled` and becomes `armed` lazily on first attach,
/// gated by the `websockets` option; when the option is off the handler cell
/// is filled with `None` permanently and every upgrade is rejected. Only
/// requests whose path (query string stripped) equals the query path exactly
/// are delegated: no prefix routing, no partial matches.
pub struct UpgradeBroker {
    graphql_path: String,
    websockets: bool,
    handler: OnceCell<Option<UpgradeHandler>>,
    armed: AtomicBool,
}

impl UpgradeBroker {
    pub fn new(options: &DynamicOptions) -> Self {
        Self {
            graphql_path: options.graphql_path.clone(),
            websockets: options.websockets,
            handler: OnceCell::new(),
            armed: AtomicBool::new(false),
        }
    }

    /// Arm the broker, obtaining the external handler at most once.
    ///
    /// `supply` is only consulted when the `websockets` option is enabled and
    /// no handler has been cached yet.
    pub fn arm(&self, supply: impl FnOnce() -> Option<UpgradeHandler>) {
        let websockets = self.websockets;
        let handler = self
            .handler
            .get_or_init(|| if websockets { supply() } else { None });
        if handler.is_some() {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    /// Stop accepting upgrades. The cached handler survives for re-attach.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Exact path match against the query path, query string ignored.
    pub fn should_handle(&self, target: &str) -> bool {
        let path = match target.find('?') {
            Some(idx) => &target[..idx],
            None => target,
        };
        path == self.graphql_path
    }

    /// Decide an upgrade request: delegate exact matches to the external
    /// handler, terminate everything else.
    ///
    /// Rejection drops the pending upgrade and answers with
    /// `Connection: close`, the transport-level equivalent of destroying the
    /// socket. Rejection is normal operation, not a failure.
    pub fn intercept(&self, req: Request) -> Response {
        if !self.is_armed() {
            return reject(StatusCode::NOT_FOUND);
        }

        let target = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("");
        if !self.should_handle(target) {
            debug!(target = %target, "upgrade request outside the query path, closing");
            return reject(StatusCode::NOT_FOUND);
        }

        let Some(handler) = self.handler.get().and_then(Option::as_ref).cloned() else {
            return reject(StatusCode::NOT_FOUND);
        };

        match accept_websocket(req, handler) {
            Ok(response) => response,
            Err(status) => {
                debug!(status = %status, "upgrade handshake rejected");
                reject(status)
            }
        }
    }
}

/// Validate the RFC 6455 handshake, spawn the hand-off task and answer 101.
fn accept_websocket(req: Request, handler: UpgradeHandler) -> Result<Response, StatusCode> {
    let headers = req.headers();

    if !header_token_equals(headers, header::UPGRADE, "websocket") {
        return Err(StatusCode::BAD_REQUEST);
    }
    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(HeaderValue::as_bytes)
        != Some(b"13".as_slice())
    {
        return Err(StatusCode::BAD_REQUEST);
    }
    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(StatusCode::BAD_REQUEST)?
        .clone();
    let subprotocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(select_subprotocol)
        .map(str::to_string);

    let (mut parts, _body) = req.into_parts();
    let Some(on_upgrade) = parts.extensions.remove::<OnUpgrade>() else {
        // the transport cannot upgrade this connection
        return Err(StatusCode::BAD_REQUEST);
    };

    let accept_key = derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                handler(parts, socket).await;
            }
            Err(e) => warn!(error = %e, "connection upgrade failed before hand-off"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let response_headers = response.headers_mut();
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    response_headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        response_headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    if let Some(protocol) = subprotocol {
        if let Ok(value) = HeaderValue::from_str(&protocol) {
            response_headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    Ok(response)
}

/// Whether an inbound request asks for a connection upgrade.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    wants_upgrade && headers.contains_key(header::UPGRADE)
}

fn header_token_equals(headers: &HeaderMap, name: header::HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(expected))
}

/// Pick the first offered subprotocol this server speaks.
fn select_subprotocol(offered: &str) -> Option<&str> {
    offered
        .split(',')
        .map(str::trim)
        .find(|candidate| SUPPORTED_SUBPROTOCOLS.contains(candidate))
}

fn reject(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
