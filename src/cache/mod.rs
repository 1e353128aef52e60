//! Cache Module
//!
//! Sharded in-memory caching with TTL expiration, LRU eviction, WAL-backed
//! durability and load-driven key migration. [`CacheFacade`] is the entry
//! point; the rest is exposed for embedding and tests.

pub mod entry;
mod facade;
pub mod hash_ring;
pub mod locks;
pub mod lru;
mod replay;
pub mod shard;
pub mod stats;
pub mod topology;
pub mod validation;


// Re-export public types
pub use entry::CacheEntry;
pub use facade::{CacheFacade, Collaborators};
pub use hash_ring::{ConsistentHashRing, KeyMove};
pub use locks::{KeyGuard, ShardLockManager};
pub use replay::ReplaySummary;
pub use shard::{CacheShard, Probe, ShardContext, ShardState};
pub use stats::{CacheStats, ShardLoad, StatsCounters};
pub use topology::Topology;
pub use validation::KeyValidator;

// == Public Constants ==
/// Maximum allowed key length in bytes under the strict profile
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum allowed value size in bytes under the strict profile
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB

// == Lookup ==
/// Result of a read. A miss is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Vec<u8>),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        match self {
            Lookup::Hit(value) => Some(value),
            Lookup::Miss => None,
        }
    }
}
