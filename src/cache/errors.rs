//! Cache error types

use crate::error::CoreError;
use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    /// Failed to connect to cache backend
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    /// Failed to encode or decode a cache entry
    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    /// Cache operation timed out
    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// Distributed tier is short-circuited by its breaker
    #[error("Distributed cache unavailable: {0}")]
    Unavailable(String),

    /// Generic backend error
    #[error("Cache backend error: {0}")]
    BackendError(String),

    /// The loader supplied to `get` failed; nothing was cached
    #[error("Cache loader failed: {0}")]
    Loader(CoreError),
}

impl From<CacheError> for CoreError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Loader(inner) => inner,
            CacheError::Timeout(msg) => CoreError::Timeout(format!("cache: {msg}")),
            other => CoreError::DependencyFailure(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
