//! HTTP runtime adaptor for Edgeserv
//!
//! This crate adapts a [`QueryEngine`](engine::QueryEngine) onto an HTTP
//! endpoint family, multiplexing synchronous request/response, event-stream
//! style streaming, and WebSocket upgrades onto shared paths. It builds the
//! request digest, renders the engine's result variants onto the transport,
//! and manages the attach/release lifecycle of the upgrade broker against a
//! listener owned by the host.

pub mod digest;
pub mod engine;
pub mod lifecycle;
pub mod render;
pub mod server;
pub mod upgrade;

pub use digest::RequestDigest;
pub use engine::{QueryEngine, UpgradeHandler, WsStream};
pub use lifecycle::ReleaseHooks;
pub use render::{render, RenderedError};
pub use server::Edgeserv;
pub use upgrade::UpgradeBroker;
