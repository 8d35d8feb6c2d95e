//! Cache error types

use redis::RedisError;

/// Boxed error returned by source-of-truth backends
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the key-value store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the source-of-truth collaborator
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Not found")]
    NotFound,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Source fetch failed for {key}: {source}")]
    SourceFetch {
        key: String,
        #[source]
        source: SourceError,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Entry at {0} is not a list")]
    ShapeMismatch(String),

    #[error("Patch failed for {failed} of {total} owners")]
    PatchFailed { failed: usize, total: usize },

    #[error("Job queue {0} is closed")]
    QueueClosed(&'static str),
}

impl CacheError {
    /// True when the source of truth reported the entity as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::SourceFetch {
                source: SourceError::NotFound,
                ..
            }
        )
    }
}
