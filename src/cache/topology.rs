//! Shard Topology
//!
//! The shard list, the hash ring over it, and the per-key overrides the
//! balancer leaves behind. A key's route is its override if one exists,
//! otherwise the ring's answer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cache::hash_ring::ConsistentHashRing;
use crate::cache::shard::{CacheShard, ShardContext};
use crate::error::{CacheError, Result};

pub struct Topology {
    ring: ConsistentHashRing,
    /// Indexed by shard number
    shards: Vec<Arc<CacheShard>>,
    /// Keys relocated by the balancer -> shard holding them
    overrides: DashMap<String, usize>,
    /// Key migrations in progress
    migrating: AtomicUsize,
    /// Bumped each time a key migration finishes
    migration_epoch: AtomicU64,
    ctx: Arc<ShardContext>,
}

/// Marks one key migration as in progress until dropped.
pub struct MigrationGuard<'a> {
    topology: &'a Topology,
}

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.topology.migration_epoch.fetch_add(1, Ordering::SeqCst);
        self.topology.migrating.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Topology {
    pub fn new(shard_count: usize, virtual_nodes: usize, ctx: Arc<ShardContext>) -> Self {
        let shards = (0..shard_count)
            .map(|index| Arc::new(CacheShard::new(index, ctx.clone())))
            .collect();
        Self {
            ring: ConsistentHashRing::new(shard_count, virtual_nodes),
            shards,
            overrides: DashMap::new(),
            migrating: AtomicUsize::new(0),
            migration_epoch: AtomicU64::new(0),
            ctx,
        }
    }

    // == Routing ==
    pub fn route(&self, key: &str) -> Result<usize> {
        if let Some(shard) = self.overrides.get(key).map(|s| *s) {
            if shard < self.shards.len() {
                return Ok(shard);
            }
        }
        self.ring.assign(key)
    }

    pub fn route_shard(&self, key: &str) -> Result<&Arc<CacheShard>> {
        let index = self.route(key)?;
        self.shards
            .get(index)
            .ok_or(CacheError::NoShardsAvailable)
    }

    pub fn shard(&self, index: usize) -> Option<&Arc<CacheShard>> {
        self.shards.get(index)
    }

    pub fn shards(&self) -> &[Arc<CacheShard>] {
        &self.shards
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn ring(&self) -> &ConsistentHashRing {
        &self.ring
    }

    // == Overrides ==
    /// Pins `key` to `shard`, or drops the pin if the ring already agrees.
    pub fn set_override(&self, key: &str, shard: usize) {
        if self.ring.assign(key).ok() == Some(shard) {
            self.overrides.remove(key);
        } else {
            self.overrides.insert(key.to_string(), shard);
        }
    }

    pub fn clear_override(&self, key: &str) {
        self.overrides.remove(key);
    }

    pub fn clear_overrides(&self) {
        self.overrides.clear();
    }

    pub fn has_override(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Drops overrides whose key matches `predicate`.
    pub fn drop_overrides_where(&self, predicate: impl Fn(&str, usize) -> bool) {
        self.overrides.retain(|key, shard| !predicate(key, *shard));
    }

    /// Current overrides as `(key, shard)` pairs.
    pub fn relocations(&self) -> Vec<(String, usize)> {
        self.overrides
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn override_keys(&self) -> Vec<String> {
        self.overrides.iter().map(|entry| entry.key().clone()).collect()
    }

    // == Migrations ==
    /// Call before moving a key; hold the guard until its override is set.
    pub fn begin_migration(&self) -> MigrationGuard<'_> {
        self.migrating.fetch_add(1, Ordering::SeqCst);
        MigrationGuard { topology: self }
    }

    pub fn migration_epoch(&self) -> u64 {
        self.migration_epoch.load(Ordering::SeqCst)
    }

    /// True if no migration was running or finished since `epoch` was read,
    /// so a route taken after that read is still accurate.
    pub fn migrations_quiet_since(&self, epoch: u64) -> bool {
        self.migrating.load(Ordering::SeqCst) == 0 && self.migration_epoch() == epoch
    }

    // == Resizing ==
    /// Appends a new, empty shard and puts it on the ring.
    ///
    /// Returns its index and the keys, out of `keys`, that the ring now
    /// assigns to it, each paired with the shard it is leaving.
    pub fn push_shard<'a, I>(&mut self, keys: I) -> (usize, Vec<(String, usize)>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let (index, moves) = self.ring.add_shard(keys);
        debug_assert_eq!(index, self.shards.len());
        self.shards
            .push(Arc::new(CacheShard::new(index, self.ctx.clone())));
        let moves = moves.into_iter().map(|m| (m.key, m.from)).collect();
        (index, moves)
    }

    /// Takes the highest-numbered shard off the ring and out of the list.
    pub fn pop_shard(&mut self) -> Result<Arc<CacheShard>> {
        let last = self.shards.len().checked_sub(1).ok_or_else(|| {
            CacheError::InvalidConfig("no shard to remove".to_string())
        })?;
        self.ring.remove_shard(last, std::iter::empty::<&str>())?;
        self.drop_overrides_where(|_, shard| shard == last);
        self.shards
            .pop()
            .ok_or(CacheError::NoShardsAvailable)
    }

    // == Totals ==
    pub fn total_entries(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.bytes()).sum()
    }
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("shards", &self.shards.len())
            .field("overrides", &self.overrides.len())
            .finish()
    }
}
