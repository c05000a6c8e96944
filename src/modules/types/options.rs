//! Resolved configuration options for the adaptor

use serde::{Deserialize, Serialize};

/// Resolved configuration snapshot for an Edgeserv instance.
///
/// The host resolves its configuration (file, env, preset merging) before
/// constructing the adaptor; this struct is the already-resolved value and is
/// immutable for the adaptor's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicOptions {
    /// Primary path for query execution
    pub graphql_path: String,
    /// Path for the interactive console
    pub graphiql_path: String,
    /// Path for streaming subscription/watch updates
    pub event_stream_path: String,
    /// Enable the interactive console route
    pub graphiql: bool,
    /// Allow GET on the query path to execute queries
    pub graphql_over_get: bool,
    /// Allow GET on the query path to serve the console
    pub graphiql_on_graphql_get: bool,
    /// Enable streaming behavior
    pub watch: bool,
    /// Enable connection-upgrade handling
    pub websockets: bool,
}

impl Default for DynamicOptions {
    fn default() -> Self {
        Self {
            graphql_path: "/graphql".to_string(),
            graphiql_path: "/graphiql".to_string(),
            event_stream_path: "/graphql/stream".to_string(),
            graphiql: true,
            graphql_over_get: false,
            graphiql_on_graphql_get: true,
            watch: false,
            websockets: false,
        }
    }
}

impl DynamicOptions {
    /// Derive the capability record the adaptor is parameterized by.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_upgrade: self.websockets,
            collapsed_stream_path: self.watch && self.graphql_path == self.event_stream_path,
        }
    }

    /// Whether GET is accepted on the query path at all.
    ///
    /// GET is registered when queries may run over GET, when the console is
    /// served from the query path, or when the stream path collapses onto the
    /// query path (content negotiation then picks the behavior per request).
    pub fn allows_get_on_graphql_path(&self) -> bool {
        self.graphql_over_get
            || self.graphiql_on_graphql_get
            || self.graphql_path == self.event_stream_path
    }

    /// Whether the console is reachable through GET on the query path.
    pub fn console_on_graphql_get(&self) -> bool {
        self.graphiql && (self.graphiql_on_graphql_get || self.graphiql_path == self.graphql_path)
    }
}

/// Small capability record replacing per-transport adaptor subclasses.
///
/// Behavior differences between deployments are data, not new types: a
/// deployment that cannot upgrade connections simply carries
/// `supports_upgrade: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The adaptor accepts connection upgrades on the query path
    pub supports_upgrade: bool,
    /// Stream and query share one path, resolved by content negotiation
    pub collapsed_stream_path: bool,
}
