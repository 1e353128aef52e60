//! Cache Entry Module
//!
//! A stored value with its absolute expiry time and a logical access tick
//! used for LRU ordering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed per-entry bookkeeping counted into the size estimate.
pub const ENTRY_OVERHEAD: usize = 64;

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
///
/// `last_access` is a per-shard logical clock rather than a timestamp, so
/// LRU order is exact even for accesses within the same millisecond. It is
/// atomic so that optimistic readers can refresh it under a shared lock.
#[derive(Debug)]
pub struct CacheEntry {
    /// The stored value
    pub value: Vec<u8>,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Expiration timestamp (Unix milliseconds), always after `created_at`
    pub expires_at: u64,
    /// Estimated footprint in bytes
    pub size: usize,
    /// Logical access clock value of the latest read or write
    last_access: AtomicU64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry expiring `ttl` from now.
    ///
    /// Sub-millisecond TTLs are rounded up to one millisecond so that
    /// `expires_at > created_at` always holds.
    pub fn new(key: &str, value: Vec<u8>, ttl: Duration, tick: u64) -> Self {
        let now = current_timestamp_ms();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        Self::restore(key, value, now, now.saturating_add(ttl_ms), tick)
    }

    /// Rebuilds an entry with known timestamps (snapshot load, WAL replay, migration).
    pub fn restore(key: &str, value: Vec<u8>, created_at: u64, expires_at: u64, tick: u64) -> Self {
        let size = estimate_size(key, &value);
        Self {
            value,
            created_at,
            expires_at: expires_at.max(created_at.saturating_add(1)),
            size,
            last_access: AtomicU64::new(tick),
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal
    /// to its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Expiry check against a caller-supplied clock reading.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self) -> u64 {
        self.expires_at.saturating_sub(current_timestamp_ms())
    }

    // == LRU Clock ==
    /// Records an access at logical time `tick`.
    pub fn touch(&self, tick: u64) {
        self.last_access.fetch_max(tick, Ordering::Relaxed);
    }

    /// Logical time of the latest access.
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Estimated bytes held by one entry.
pub fn estimate_size(key: &str, value: &[u8]) -> usize {
    key.len() + value.len() + ENTRY_OVERHEAD
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
