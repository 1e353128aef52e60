//! Cache Statistics Module
//!
//! Lock-free counters shared by every shard, and the serializable report
//! built from them on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Stats Counters ==
/// Live counters shared by every shard and background task.
#[derive(Debug, Default)]
pub struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    migrations: AtomicU64,
    wal_failures: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, n: usize) {
        self.expirations.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.record_deletes(1);
    }

    pub fn record_deletes(&self, n: usize) {
        self.deletes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wal_failure(&self) {
        self.wal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a report; shard-level fields are filled by the caller.
    pub fn report(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            wal_failures: self.wal_failures.load(Ordering::Relaxed),
            ..CacheStats::default()
        }
    }
}

// == Shard Load ==
/// Point-in-time load of one shard.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ShardLoad {
    pub shard: usize,
    pub entries: usize,
    pub bytes: usize,
    /// Operations served over the shard's lifetime
    pub operations: u64,
}

// == Cache Stats ==
/// Statistics report returned by `CacheFacade::stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
    /// Number of entries evicted by bounds or memory pressure
    pub evictions: u64,
    /// Number of entries removed by TTL sweeps
    pub expirations: u64,
    pub sets: u64,
    pub deletes: u64,
    /// Keys relocated by the balancer
    pub migrations: u64,
    /// WAL appends that failed after retries
    pub wal_failures: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Current estimated bytes held
    pub total_bytes: usize,
    pub shard_loads: Vec<ShardLoad>,
    /// Live key-lock objects
    pub key_locks: usize,
    /// Current adaptive sweep interval
    pub sweep_interval_ms: u64,
    /// IncidentResponder state name
    pub incident_state: String,
    pub hit_rate: f64,
    /// 0..=100, hit rate discounted by eviction pressure
    pub efficiency_score: f64,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn compute_hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    // == Efficiency Score ==
    /// Hit rate scaled to 0..=100 and reduced by the share of writes that
    /// ended up evicting something.
    pub fn compute_efficiency(&self) -> f64 {
        let pressure = if self.sets == 0 {
            0.0
        } else {
            (self.evictions as f64 / self.sets as f64).min(1.0)
        };
        self.compute_hit_rate() * (1.0 - pressure) * 100.0
    }

    /// Fills the derived fields.
    pub fn finalize(mut self) -> Self {
        self.total_entries = self.shard_loads.iter().map(|l| l.entries).sum();
        self.total_bytes = self.shard_loads.iter().map(|l| l.bytes).sum();
        self.hit_rate = self.compute_hit_rate();
        self.efficiency_score = self.compute_efficiency();
        self
    }
}
