//! Lock Management
//!
//! Per-key async mutexes plus the helpers that take shard locks in a fixed
//! order. Every path that needs more than one lock takes them as
//! topology -> key -> shards by ascending index, which rules out cycles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::cache::shard::{CacheShard, ShardState};
use crate::incident::IncidentResponder;

struct KeyLock {
    mutex: Arc<Mutex<()>>,
    /// Milliseconds since the manager's epoch
    last_used: AtomicU64,
}

/// Exclusive hold on one key; released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

// == Shard Lock Manager ==
pub struct ShardLockManager {
    locks: DashMap<String, KeyLock>,
    deadlock_timeout: Duration,
    incidents: Arc<IncidentResponder>,
    epoch: Instant,
}

impl ShardLockManager {
    pub fn new(deadlock_timeout: Duration, incidents: Arc<IncidentResponder>) -> Self {
        Self {
            locks: DashMap::new(),
            deadlock_timeout,
            incidents,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn mutex_for(&self, key: &str) -> Arc<Mutex<()>> {
        let now = self.now_ms();
        let lock = self.locks.entry(key.to_string()).or_insert_with(|| KeyLock {
            mutex: Arc::new(Mutex::new(())),
            last_used: AtomicU64::new(now),
        });
        lock.last_used.store(now, Ordering::Relaxed);
        lock.mutex.clone()
    }

    // == Lock Key ==
    /// Waits for exclusive access to `key`.
    ///
    /// A wait longer than the deadlock timeout is reported to the incident
    /// responder; the caller keeps waiting, bounded by its own op timeout.
    pub async fn lock_key(&self, key: &str) -> KeyGuard {
        let mutex = self.mutex_for(key);
        let guard = match tokio::time::timeout(self.deadlock_timeout, mutex.clone().lock_owned()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                warn!(key, waited = ?self.deadlock_timeout, "key lock wait exceeded deadlock timeout");
                self.incidents.report_deadlock(key, self.deadlock_timeout);
                mutex.lock_owned().await
            }
        };
        KeyGuard { _guard: guard }
    }

    /// Takes the key lock only if nobody holds it.
    pub fn try_lock_key(&self, key: &str) -> Option<KeyGuard> {
        let mutex = self.mutex_for(key);
        mutex
            .try_lock_owned()
            .ok()
            .map(|guard| KeyGuard { _guard: guard })
    }

    // == Reaping ==
    /// Drops key locks nobody holds or waits on that have been idle for
    /// at least `idle`. Returns how many were removed.
    pub fn reap_idle(&self, idle: Duration) -> usize {
        let now = self.now_ms();
        let idle_ms = idle.as_millis() as u64;
        let before = self.locks.len();
        self.locks.retain(|_, lock| {
            Arc::strong_count(&lock.mutex) > 1
                || now.saturating_sub(lock.last_used.load(Ordering::Relaxed)) < idle_ms
        });
        let reaped = before.saturating_sub(self.locks.len());
        if reaped > 0 {
            debug!(reaped, remaining = self.locks.len(), "reaped idle key locks");
        }
        reaped
    }

    /// Number of live key locks.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl std::fmt::Debug for ShardLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLockManager")
            .field("key_locks", &self.locks.len())
            .field("deadlock_timeout", &self.deadlock_timeout)
            .finish()
    }
}

// == Shard Lock Ordering ==
/// Write-locks every shard in ascending index order.
///
/// `shards` must be sorted by index, which the topology guarantees.
pub async fn lock_shards(shards: &[Arc<CacheShard>]) -> Vec<RwLockWriteGuard<'_, ShardState>> {
    let mut guards = Vec::with_capacity(shards.len());
    for shard in shards {
        guards.push(shard.write().await);
    }
    guards
}

/// Write-locks two distinct shards, lower index first, and returns the
/// guards in argument order.
pub async fn lock_pair<'a>(
    a: &'a CacheShard,
    b: &'a CacheShard,
) -> (
    RwLockWriteGuard<'a, ShardState>,
    RwLockWriteGuard<'a, ShardState>,
) {
    if a.index() <= b.index() {
        let first = a.write().await;
        let second = b.write().await;
        (first, second)
    } else {
        let second = b.write().await;
        let first = a.write().await;
        (first, second)
    }
}
