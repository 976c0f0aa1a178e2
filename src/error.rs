//! Error types for the harness, one enum per domain.

use std::time::Duration;

use thiserror::Error;

/// Errors from the durable store.
///
/// Store errors are the only fatal class in the system: the coordinator
/// cannot run without durable state, so callers above the facade log and
/// exit rather than recover.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg.unwrap_or_else(|| e.to_string()))
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Errors from the streaming model client.
///
/// These are never fatal: the executor converts them into `stream_error`
/// events and the FSM's retry ladder takes over.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("model returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("malformed stream: {0}")]
    InvalidStream(String),
}

/// Errors from tool execution.
///
/// The dispatcher converts every variant into an `Error:`-prefixed string
/// delivered to the model as an ordinary tool result.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("not authorized: {0}")]
    NotAuthorized(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}
