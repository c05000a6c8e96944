//! Error types for Edgeserv

use thiserror::Error;

/// Main error type for Edgeserv operations
#[derive(Error, Debug)]
pub enum EdgeservError {
    /// The request body could not be read from the transport
    #[error("Body read error: {0}")]
    BodyRead(String),

    /// The request body accessor was invoked a second time
    #[error("Request body was already consumed")]
    BodyConsumed,

    /// The method is not permitted on this path under the current options
    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The query engine reported a failure
    #[error("Engine error: {0}")]
    Engine(String),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(String),

    /// File system error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EdgeservError {
    /// Returns true if this error should be logged at error level
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EdgeservError::Engine(_)
                | EdgeservError::Server(_)
                | EdgeservError::Io(_)
                | EdgeservError::BodyConsumed
                | EdgeservError::Internal(_)
        )
    }

    /// Returns true if this error is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EdgeservError::BodyRead(_) | EdgeservError::MethodNotAllowed(_)
        )
    }

    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            EdgeservError::BodyRead(_) | EdgeservError::Json(_) => 400,
            EdgeservError::MethodNotAllowed(_) => 405,
            _ => 500,
        }
    }

    /// Sanitize the error message to avoid leaking internals to clients
    pub fn sanitized_message(&self) -> String {
        match self {
            // Don't expose engine or server internals
            EdgeservError::Engine(_) => "Query execution failed".to_string(),
            EdgeservError::Server(_) | EdgeservError::Io(_) | EdgeservError::Internal(_) => {
                "Internal server error".to_string()
            }
            EdgeservError::BodyConsumed => "Internal server error".to_string(),

            // Safe to expose
            EdgeservError::BodyRead(msg) => format!("Failed to read request body: {}", msg),
            EdgeservError::MethodNotAllowed(method) => {
                format!("Method not allowed: {}", method)
            }
            EdgeservError::Json(e) => format!("Invalid JSON: {}", e),
        }
    }
}

/// Result type alias using EdgeservError
pub type Result<T> = std::result::Result<T, EdgeservError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(EdgeservError::BodyRead("eof".into()).status_code(), 400);
        assert_eq!(
            EdgeservError::MethodNotAllowed("GET".into()).status_code(),
            405
        );
        assert_eq!(EdgeservError::Engine("err".into()).status_code(), 500);
        assert_eq!(EdgeservError::BodyConsumed.status_code(), 500);
    }

    #[test]
    fn test_error_sanitization() {
        let err = EdgeservError::Engine("panic in planner at plan.rs:42".into());
        assert_eq!(err.sanitized_message(), "Query execution failed");

        let err = EdgeservError::BodyRead("stream yielded no data".into());
        assert_eq!(
            err.sanitized_message(),
            "Failed to read request body: stream yielded no data"
        );

        let err = EdgeservError::Server("bind failed on 0.0.0.0:5678".into());
        assert_eq!(err.sanitized_message(), "Internal server error");
    }

    #[test]
    fn test_error_is_client_error() {
        assert!(EdgeservError::BodyRead("eof".into()).is_client_error());
        assert!(EdgeservError::MethodNotAllowed("PUT".into()).is_client_error());
        assert!(!EdgeservError::Engine("err".into()).is_client_error());
        assert!(!EdgeservError::BodyConsumed.is_client_error());
    }

    #[test]
    fn test_error_log_level() {
        assert!(EdgeservError::BodyConsumed.is_error());
        assert!(EdgeservError::Internal("oops".into()).is_error());
        assert!(!EdgeservError::BodyRead("eof".into()).is_error());
    }
}
