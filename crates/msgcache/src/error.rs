//! Error types for the message cache.

use thiserror::Error;

/// Errors returned by caches and their backing stores.
///
/// An absent entry is never an error; lookups return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed or is unreachable.
    #[error("store error: {0}")]
    Store(String),

    /// A cached value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A service or username cannot be used to build a cache key.
    #[error("invalid cache key component: {0:?}")]
    InvalidKey(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<CacheError> for protocol::ProtocolError {
    fn from(err: CacheError) -> Self {
        protocol::ProtocolError::Cache(err.to_string())
    }
}
