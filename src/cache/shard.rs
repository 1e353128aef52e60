//! Cache Shard
//!
//! One partition of the keyspace: a map of entries behind an async RwLock,
//! with its own LRU clock and bounds. Every mutation appends its WAL record
//! while holding the shard write lock, so the log order of a shard's
//! records is the order they were applied in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::cache::entry::{current_timestamp_ms, CacheEntry};
use crate::cache::locks::lock_pair;
use crate::cache::lru::lru_victims;
use crate::cache::stats::{ShardLoad, StatsCounters};
use crate::config::{CacheConfig, DurabilityMode};
use crate::error::{CacheError, Result};
use crate::incident::IncidentResponder;
use crate::persistence::{PersistenceManager, SnapshotEntry, WalOp};

// == Shard State ==
/// Data guarded by the shard lock.
#[derive(Debug, Default)]
pub struct ShardState {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
    /// Sequence number of the last WAL record applied here
    pub last_seq: u64,
    /// LRU clock; atomic so readers can advance it under a shared lock
    clock: AtomicU64,
}

impl ShardState {
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces `key`, returning the previous entry.
    pub fn insert(&mut self, key: String, entry: CacheEntry) -> Option<CacheEntry> {
        self.bytes += entry.size;
        let previous = self.entries.insert(key, entry);
        if let Some(old) = &previous {
            self.bytes = self.bytes.saturating_sub(old.size);
        }
        previous
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.bytes = self.bytes.saturating_sub(entry.size);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
        self.last_seq = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn expired_keys(&self, now_ms: u64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now_ms))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

// == Shard Context ==
/// Collaborators and limits shared by every shard.
pub struct ShardContext {
    pub persistence: Option<Arc<PersistenceManager>>,
    pub incidents: Arc<IncidentResponder>,
    pub stats: Arc<StatsCounters>,
    pub durability: DurabilityMode,
    pub max_items: usize,
    pub max_bytes: usize,
}

impl ShardContext {
    pub fn new(
        config: &CacheConfig,
        persistence: Option<Arc<PersistenceManager>>,
        incidents: Arc<IncidentResponder>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            persistence,
            incidents,
            stats,
            durability: config.durability,
            max_items: config.max_items_per_shard,
            max_bytes: config.max_bytes_per_shard,
        }
    }
}

/// Outcome of an optimistic read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Hit(Vec<u8>),
    /// Present but past its TTL; left for the sweeper
    Expired,
    Absent,
}

// == Cache Shard ==
pub struct CacheShard {
    index: usize,
    state: RwLock<ShardState>,
    ctx: Arc<ShardContext>,
    /// Operations over the shard's lifetime
    operations: AtomicU64,
    /// Operations since the balancer last looked
    window_ops: AtomicU64,
    /// Mirrors of the state sizes, readable without the lock
    entry_count: AtomicUsize,
    byte_count: AtomicUsize,
}

impl CacheShard {
    pub fn new(index: usize, ctx: Arc<ShardContext>) -> Self {
        Self {
            index,
            state: RwLock::new(ShardState::default()),
            ctx,
            operations: AtomicU64::new(0),
            window_ops: AtomicU64::new(0),
            entry_count: AtomicUsize::new(0),
            byte_count: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) async fn write(&self) -> RwLockWriteGuard<'_, ShardState> {
        self.state.write().await
    }

    fn count_op(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.window_ops.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the state sizes for lock-free readers.
    pub(crate) fn sync_counters(&self, state: &ShardState) {
        self.entry_count.store(state.len(), Ordering::Relaxed);
        self.byte_count.store(state.bytes(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Returns and resets the operation count since the previous call.
    pub fn take_window_ops(&self) -> u64 {
        self.window_ops.swap(0, Ordering::Relaxed)
    }

    pub fn load(&self) -> ShardLoad {
        ShardLoad {
            shard: self.index,
            entries: self.len(),
            bytes: self.bytes(),
            operations: self.operations.load(Ordering::Relaxed),
        }
    }

    // == WAL ==
    /// Appends `op` to the WAL while the caller holds `state` exclusively.
    ///
    /// In fail-closed mode a failed append is returned and the caller must
    /// not apply the mutation. In fail-open mode it is logged and swallowed.
    pub(crate) fn log_mutation(&self, state: &mut ShardState, op: WalOp) -> Result<()> {
        let Some(persistence) = &self.ctx.persistence else {
            return Ok(());
        };
        match persistence.append(op) {
            Ok(seq) => {
                state.last_seq = seq;
                self.ctx.incidents.report_wal_success();
                Ok(())
            }
            Err(e) => {
                self.ctx.stats.record_wal_failure();
                self.ctx.incidents.report_wal_failure(&e);
                match self.ctx.durability {
                    DurabilityMode::FailClosed => Err(e),
                    DurabilityMode::FailOpen => {
                        warn!(shard = self.index, error = %e, "applying mutation without WAL record");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Logs a delete whose outcome cannot change what happens next.
    fn log_delete_best_effort(&self, state: &mut ShardState, key: &str) {
        if let Err(e) = self.log_mutation(state, WalOp::Delete { key: key.to_string() }) {
            debug!(shard = self.index, key, error = %e, "eviction not logged");
        }
    }

    // == Get ==
    /// Reads `key` under the shared lock and refreshes its LRU position.
    pub async fn probe(&self, key: &str) -> Probe {
        let state = self.state.read().await;
        self.count_op();
        match state.get(key) {
            Some(entry) if entry.is_expired() => Probe::Expired,
            Some(entry) => {
                entry.touch(state.tick());
                Probe::Hit(entry.value.clone())
            }
            None => Probe::Absent,
        }
    }

    // == Set ==
    /// Stores `key`, then evicts down to the shard bounds.
    ///
    /// Returns the number of entries evicted to make room.
    pub async fn set(&self, key: String, value: Vec<u8>, ttl: Duration) -> Result<usize> {
        let mut state = self.state.write().await;
        self.count_op();

        let entry = CacheEntry::new(&key, value, ttl, state.tick());
        self.log_mutation(
            &mut state,
            WalOp::Set {
                key: key.clone(),
                value: entry.value.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
            },
        )?;
        state.insert(key, entry);

        let (_, evicted) = self.enforce_bounds_locked(&mut state);
        self.sync_counters(&state);
        Ok(evicted)
    }

    // == Delete ==
    /// Removes `key`. Returns false if it was absent or already expired.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        self.count_op();

        let expired = match state.get(key) {
            None => return Ok(false),
            Some(entry) => entry.is_expired(),
        };
        if expired {
            state.remove(key);
            self.ctx.stats.record_expirations(1);
            self.sync_counters(&state);
            return Ok(false);
        }

        self.log_mutation(&mut state, WalOp::Delete { key: key.to_string() })?;
        state.remove(key);
        self.sync_counters(&state);
        Ok(true)
    }

    // == Invalidate ==
    /// Deletes every key accepted by `matches`. The caller holds the lock.
    ///
    /// Stops at the first refused WAL append. The keys removed before that
    /// are returned alongside the error.
    pub(crate) fn invalidate_locked(
        &self,
        state: &mut ShardState,
        matches: &dyn Fn(&str) -> bool,
    ) -> (Vec<String>, Option<CacheError>) {
        let keys: Vec<String> = state.keys().filter(|&k| matches(k)).map(str::to_string).collect();
        let mut removed = Vec::with_capacity(keys.len());
        let mut failure = None;
        for key in keys {
            if let Err(e) = self.log_mutation(state, WalOp::Delete { key: key.clone() }) {
                failure = Some(e);
                break;
            }
            state.remove(&key);
            removed.push(key);
        }
        self.sync_counters(state);
        (removed, failure)
    }

    // == Sweep ==
    /// Removes expired entries and returns how many.
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let removed = self.remove_expired_locked(&mut state);
        self.sync_counters(&state);
        removed
    }

    fn remove_expired_locked(&self, state: &mut ShardState) -> usize {
        let expired = state.expired_keys(current_timestamp_ms());
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            self.ctx.stats.record_expirations(expired.len());
        }
        expired.len()
    }

    /// Brings the shard back within its bounds; returns `(expired, evicted)`.
    pub async fn enforce_bounds(&self) -> (usize, usize) {
        let mut state = self.state.write().await;
        let result = self.enforce_bounds_locked(&mut state);
        self.sync_counters(&state);
        result
    }

    fn over_bounds(&self, state: &ShardState) -> bool {
        state.len() > self.ctx.max_items || state.bytes() > self.ctx.max_bytes
    }

    /// Drops expired entries first, then least recently used ones.
    fn enforce_bounds_locked(&self, state: &mut ShardState) -> (usize, usize) {
        if !self.over_bounds(state) {
            return (0, 0);
        }
        let expired = self.remove_expired_locked(state);

        let mut evicted = 0;
        while self.over_bounds(state) {
            let excess = state.len().saturating_sub(self.ctx.max_items).max(1);
            let victims = lru_victims(&state.entries, excess);
            if victims.is_empty() {
                break;
            }
            for key in victims {
                if !self.over_bounds(state) {
                    break;
                }
                self.log_delete_best_effort(state, &key);
                state.remove(&key);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.ctx.stats.record_evictions(evicted);
            debug!(shard = self.index, evicted, "evicted entries over shard bounds");
        }
        (expired, evicted)
    }

    /// Evicts least recently used entries until at most `target` bytes remain.
    pub async fn evict_to_bytes(&self, target: usize) -> usize {
        let mut state = self.state.write().await;
        let mut evicted = self.remove_expired_locked(&mut state);
        let mut lru_evicted = 0;
        while state.bytes() > target {
            let victims = lru_victims(&state.entries, 16);
            if victims.is_empty() {
                break;
            }
            for key in victims {
                if state.bytes() <= target {
                    break;
                }
                self.log_delete_best_effort(&mut state, &key);
                state.remove(&key);
                lru_evicted += 1;
            }
        }
        if lru_evicted > 0 {
            self.ctx.stats.record_evictions(lru_evicted);
        }
        evicted += lru_evicted;
        self.sync_counters(&state);
        evicted
    }

    // == Introspection ==
    /// Up to `count` keys, least recently used first.
    pub async fn lru_keys(&self, count: usize) -> Vec<String> {
        lru_victims(&self.state.read().await.entries, count)
    }

    /// Presence check that does not count as an access.
    pub async fn contains(&self, key: &str) -> bool {
        self.state.read().await.contains(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.read().await.keys().map(str::to_string).collect()
    }

    /// Live entries for a snapshot, plus the last WAL sequence applied here.
    pub async fn capture(&self) -> (Vec<SnapshotEntry>, u64) {
        let state = self.state.read().await;
        let now = current_timestamp_ms();
        let entries = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired_at(now))
            .map(|(key, entry)| SnapshotEntry {
                key: key.clone(),
                value: entry.value.clone(),
                created_at: entry.created_at,
                expires_at: entry.expires_at,
                last_access: entry.last_access(),
            })
            .collect();
        (entries, state.last_seq)
    }

    // == Migration ==
    /// Moves `key` from this shard to `dst`, logging a `Relocate` record.
    ///
    /// Returns false without moving if the key is gone or expired, or if
    /// `dst` has no room. The caller must hold the key lock.
    pub async fn migrate_to(&self, dst: &CacheShard, key: &str) -> Result<bool> {
        if self.index == dst.index {
            return Ok(false);
        }
        let (mut src_state, mut dst_state) = lock_pair(self, dst).await;

        let size = match src_state.get(key) {
            Some(entry) if !entry.is_expired() => entry.size,
            _ => return Ok(false),
        };
        if dst_state.len() >= dst.ctx.max_items || dst_state.bytes() + size > dst.ctx.max_bytes {
            return Ok(false);
        }

        dst.log_mutation(
            &mut dst_state,
            WalOp::Relocate {
                key: key.to_string(),
                shard: dst.index,
            },
        )?;
        let Some(entry) = src_state.remove(key) else {
            return Ok(false);
        };
        let tick = dst_state.tick();
        dst_state.insert(
            key.to_string(),
            CacheEntry::restore(key, entry.value, entry.created_at, entry.expires_at, tick),
        );

        self.sync_counters(&src_state);
        dst.sync_counters(&dst_state);
        self.ctx.stats.record_migration();
        Ok(true)
    }

    /// Moves `key` to `dst` without logging or bounds checks.
    ///
    /// Only for topology changes, where no other operation can run and the
    /// ring itself decides placement after a restart.
    pub(crate) async fn transfer_to(&self, dst: &CacheShard, key: &str) -> bool {
        if self.index == dst.index {
            return false;
        }
        let (mut src_state, mut dst_state) = lock_pair(self, dst).await;
        let Some(entry) = src_state.remove(key) else {
            return false;
        };
        let tick = dst_state.tick();
        dst_state.insert(
            key.to_string(),
            CacheEntry::restore(key, entry.value, entry.created_at, entry.expires_at, tick),
        );
        self.sync_counters(&src_state);
        dst.sync_counters(&dst_state);
        true
    }
}

impl std::fmt::Debug for CacheShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheShard")
            .field("index", &self.index)
            .field("entries", &self.len())
            .field("bytes", &self.bytes())
            .finish()
    }
}
