//! Type definitions for Edgeserv
//!
//! This crate contains the transport-neutral types shared across the Edgeserv
//! codebase: the resolved option set, the result variants an engine can
//! answer with, and the lazy chunk source used by streaming results.

pub mod options;
pub mod result;

pub use options::{Capabilities, DynamicOptions};
pub use result::{BoxError, ChunkSource, ChunkStream, HeaderPairs, ResultVariant};
