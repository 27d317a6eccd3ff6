//! Error types for the Zephyr core.
//!

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Serialisable mirror of the error taxonomy, carried in failed replies and
/// bridge frames so callers can branch on the kind without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationFailed,
    NoHandler,
    Timeout,
    Backpressure,
    BreakerOpen,
    DependencyFailure,
    ProtocolError,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::NoHandler => "no_handler",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::BreakerOpen => "breaker_open",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
    #[error("No handler registered for address {address}")]
    NoHandler { address: String },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Backpressure: {0}")]
    Backpressure(String),
    #[error("Circuit breaker open for {operation_key}")]
    BreakerOpen { operation_key: String },
    #[error("Dependency failure: {0}")]
    DependencyFailure(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Classify this error for transport in a `Reply` or bridge frame
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            CoreError::NoHandler { .. } => ErrorKind::NoHandler,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::Backpressure(_) => ErrorKind::Backpressure,
            CoreError::BreakerOpen { .. } => ErrorKind::BreakerOpen,
            CoreError::DependencyFailure(_) => ErrorKind::DependencyFailure,
            CoreError::ProtocolError(_) => ErrorKind::ProtocolError,
            // Ambient failures surface as internal to remote callers
            CoreError::Configuration(_) | CoreError::Serialization(_) | CoreError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Rebuild an error from a kind and message received over the wire
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::ValidationFailed => CoreError::ValidationFailed(message),
            ErrorKind::NoHandler => CoreError::NoHandler { address: message },
            ErrorKind::Timeout => CoreError::Timeout(message),
            ErrorKind::Backpressure => CoreError::Backpressure(message),
            ErrorKind::BreakerOpen => CoreError::BreakerOpen {
                operation_key: message,
            },
            ErrorKind::DependencyFailure => CoreError::DependencyFailure(message),
            ErrorKind::ProtocolError => CoreError::ProtocolError(message),
            ErrorKind::Internal => CoreError::Internal(message),
        }
    }

    /// Whether a caller may reasonably retry with the same operation key
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout
                | ErrorKind::Backpressure
                | ErrorKind::BreakerOpen
                | ErrorKind::DependencyFailure
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(error: serde_json::Error) -> Self {
        CoreError::Serialization(format!("JSON serialization error: {error}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DependencyFailure(format!("store: {err}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::DependencyFailure(format!("io: {err}"))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
