//! Error Module
//!
//! Defines error types and result types used throughout the read cache.
//!
//! Errors fall into three classes: store errors (not found, generation mismatch,
//! transient network failures), local I/O errors on the cache directory, and
//! invariant violations detected on a cache entry. Only store errors that no
//! fallback can absorb ever reach the filesystem caller.

use thiserror::Error;

/// Main error type for the read cache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Generation mismatch for {object}: expected {expected}, found {actual}")]
    GenerationMismatch {
        object: String,
        expected: i64,
        actual: i64,
    },

    #[error("Transient store error: {0}")]
    TransientError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cache store error: {0}")]
    CacheStoreError(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Download cancelled: {0}")]
    Cancelled(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CacheError {
    /// Whether a retry of the same store request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::TransientError(_) | CacheError::TimeoutError(_)
        )
    }

    /// Whether the error originated in the object store rather than the local cache
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            CacheError::NotFound(_)
                | CacheError::GenerationMismatch { .. }
                | CacheError::TransientError(_)
                | CacheError::HttpError(_)
                | CacheError::TimeoutError(_)
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for CacheError {
    fn from(err: hyper::Error) -> Self {
        CacheError::TransientError(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for CacheError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        CacheError::TransientError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the read cache
pub type Result<T> = std::result::Result<T, CacheError>;
