//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
///
/// Misses are not errors: `get` reports them through [`crate::cache::Lookup`].
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key or value rejected by the active validation profile
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The ring has no shards to route to
    #[error("No shards available")]
    NoShardsAvailable,

    /// Operation exceeded its time budget
    #[error("Operation '{operation}' timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    /// WAL append failed, or mutations are refused after repeated WAL failures
    #[error("WAL write failure: {0}")]
    WalWriteFailure(String),

    /// Snapshot file could not be decoded
    #[error("Snapshot corrupt at {path}: {reason}")]
    SnapshotCorrupt { path: String, reason: String },

    /// A key lock has been held longer than the deadlock threshold
    #[error("Deadlock suspected on key '{key}' after waiting {waited:?}")]
    DeadlockSuspected { key: String, waited: Duration },

    /// Mutations are rejected while an incident is being handled
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Rollback failed repeatedly; cache state can no longer be trusted
    #[error("Fatal cache failure: {0}")]
    Fatal(String),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL or snapshot encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// Returns true for conditions a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Timeout { .. } | CacheError::WalWriteFailure(_) | CacheError::Io(_)
        )
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
