//! Core error taxonomy for Edgeserv
//!
//! This crate contains the error type shared between the adaptor runtime and
//! engine implementations, along with its HTTP status and sanitization rules.

pub mod error;

pub use error::{EdgeservError, Result};
