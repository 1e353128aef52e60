//! Cache Facade
//!
//! The public face of the cache. Routes every operation to its shard,
//! applies validation, time budgets and the incident gate, and owns the
//! background tasks.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::Glob;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::balancer::{BalanceReport, LoadBalancer};
use crate::cache::locks::{lock_shards, ShardLockManager};
use crate::cache::replay;
use crate::cache::shard::{Probe, ShardContext};
use crate::cache::stats::{CacheStats, StatsCounters};
use crate::cache::topology::Topology;
use crate::cache::validation::KeyValidator;
use crate::cache::Lookup;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionController, SweepReport};
use crate::incident::{
    AlertSink, IncidentAlert, IncidentKind, IncidentResponder, IncidentState, LogAlertSink,
};
use crate::persistence::{GcReport, PersistenceManager, RecoveryReport, SnapshotImage, WalSink};
use crate::tasks::BackgroundTasks;

// == Collaborators ==
/// External collaborators the cache talks to.
pub struct Collaborators {
    /// Receives incident alerts
    pub alerts: Arc<dyn AlertSink>,
    /// Replaces the file-backed WAL writer
    pub wal_sink: Option<Box<dyn WalSink>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            alerts: Arc::new(LogAlertSink),
            wal_sink: None,
        }
    }
}

struct CacheCore {
    config: CacheConfig,
    topology: RwLock<Topology>,
    locks: ShardLockManager,
    stats: Arc<StatsCounters>,
    incidents: Arc<IncidentResponder>,
    persistence: Option<Arc<PersistenceManager>>,
    eviction: EvictionController,
    balancer: LoadBalancer,
    validator: KeyValidator,
    /// What the latest startup or rollback recovered
    last_recovery: Mutex<Option<RecoveryReport>>,
}

// == Cache Facade ==
/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct CacheFacade {
    core: Arc<CacheCore>,
    tasks: Arc<Mutex<Option<BackgroundTasks>>>,
}

async fn with_budget<T>(
    operation: &'static str,
    budget: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(budget, fut)
        .await
        .map_err(|_| CacheError::Timeout {
            operation,
            elapsed: budget,
        })?
}

impl CacheFacade {
    // == Lifecycle ==
    pub async fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with(config, Collaborators::default()).await
    }

    /// Builds the cache and, with a data directory, restores it from disk.
    pub async fn open_with(config: CacheConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsCounters::new());
        let incidents = Arc::new(IncidentResponder::new(&config, collaborators.alerts));
        let persistence = match &config.data_dir {
            Some(dir) => Some(Arc::new(PersistenceManager::open(
                dir,
                &config,
                collaborators.wal_sink,
            )?)),
            None => None,
        };
        let ctx = Arc::new(ShardContext::new(
            &config,
            persistence.clone(),
            incidents.clone(),
            stats.clone(),
        ));
        let topology = Topology::new(config.shard_count, config.virtual_nodes, ctx);

        let last_recovery = match &persistence {
            Some(p) => Some(replay::restore(&topology, p, &incidents).await?),
            None => None,
        };

        info!(
            shards = config.shard_count,
            entries = topology.total_entries(),
            persistent = persistence.is_some(),
            durability = ?config.durability,
            "cache opened"
        );

        let core = CacheCore {
            locks: ShardLockManager::new(config.deadlock_timeout, incidents.clone()),
            eviction: EvictionController::new(&config),
            balancer: LoadBalancer::new(&config),
            validator: KeyValidator::new(config.validation, config.max_bytes_per_shard),
            topology: RwLock::new(topology),
            stats,
            incidents,
            persistence,
            last_recovery: Mutex::new(last_recovery),
            config,
        };
        Ok(Self {
            core: Arc::new(core),
            tasks: Arc::new(Mutex::new(None)),
        })
    }

    /// Starts the background tasks. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_none() {
            *tasks = Some(BackgroundTasks::spawn(self));
        }
    }

    /// Stops background tasks and, if configured, writes a final snapshot.
    pub async fn stop(&self) -> Result<()> {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.shutdown().await;
        }
        if self.core.config.snapshot_on_shutdown
            && self.core.incidents.state() != IncidentState::Failed
        {
            self.snapshot().await?;
        }
        info!("cache stopped");
        Ok(())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    // == Get ==
    pub async fn get(&self, key: &str) -> Result<Lookup> {
        self.get_with_timeout(key, self.core.config.op_timeout).await
    }

    pub async fn get_with_timeout(&self, key: &str, budget: Duration) -> Result<Lookup> {
        with_budget("get", budget, self.get_inner(key)).await
    }

    async fn get_inner(&self, key: &str) -> Result<Lookup> {
        let core = &*self.core;
        core.validator.validate_key(key)?;
        core.incidents.check_available()?;
        let started = Instant::now();

        let lookup = {
            let topology = core.topology.read().await;
            let epoch = topology.migration_epoch();
            match topology.route_shard(key)?.probe(key).await {
                Probe::Hit(value) => Lookup::Hit(value),
                Probe::Expired => Lookup::Miss,
                Probe::Absent if topology.migrations_quiet_since(epoch) => Lookup::Miss,
                // A migration overlapped the read; look again once the key settles
                Probe::Absent => {
                    let _guard = core.locks.lock_key(key).await;
                    match topology.route_shard(key)?.probe(key).await {
                        Probe::Hit(value) => Lookup::Hit(value),
                        Probe::Expired | Probe::Absent => Lookup::Miss,
                    }
                }
            }
        };

        match &lookup {
            Lookup::Hit(_) => core.stats.record_hit(),
            Lookup::Miss => core.stats.record_miss(),
        }
        core.eviction.record_latency(started.elapsed());
        Ok(lookup)
    }

    // == Set ==
    /// Stores `value` under `key`; `ttl` defaults to the configured TTL.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.set_with_timeout(key, value, ttl, self.core.config.op_timeout)
            .await
    }

    pub async fn set_with_timeout(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
        budget: Duration,
    ) -> Result<()> {
        with_budget("set", budget, self.set_inner(key, value.into(), ttl)).await
    }

    async fn set_inner(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let core = &*self.core;
        core.validator.validate_key(key)?;
        core.validator.validate_value(key, &value)?;
        core.validator.validate_ttl(ttl)?;
        core.incidents.check_mutation()?;
        let ttl = ttl.unwrap_or(core.config.default_ttl);
        let started = Instant::now();

        {
            let topology = core.topology.read().await;
            let _guard = core.locks.lock_key(key).await;
            topology
                .route_shard(key)?
                .set(key.to_string(), value, ttl)
                .await?;
            self.check_memory_in(&topology);
        }

        core.stats.record_set();
        core.eviction.record_insert();
        core.eviction.record_latency(started.elapsed());
        Ok(())
    }

    // == Delete ==
    /// Removes `key`; returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_with_timeout(key, self.core.config.op_timeout)
            .await
    }

    pub async fn delete_with_timeout(&self, key: &str, budget: Duration) -> Result<bool> {
        with_budget("delete", budget, self.delete_inner(key)).await
    }

    async fn delete_inner(&self, key: &str) -> Result<bool> {
        let core = &*self.core;
        core.validator.validate_key(key)?;
        core.incidents.check_mutation()?;
        let started = Instant::now();

        let removed = {
            let topology = core.topology.read().await;
            let _guard = core.locks.lock_key(key).await;
            let removed = topology.route_shard(key)?.delete(key).await?;
            topology.clear_override(key);
            removed
        };

        if removed {
            core.stats.record_delete();
        }
        core.eviction.record_latency(started.elapsed());
        Ok(removed)
    }

    // == Invalidate Pattern ==
    /// Deletes every key matching `pattern` and returns how many.
    ///
    /// Patterns containing `*`, `?`, `[` or `{` are globs; anything else is
    /// a key prefix. All shards are locked together, so the removal is
    /// atomic with respect to other operations.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<usize> {
        let core = &*self.core;
        if pattern.is_empty() {
            return Err(CacheError::Validation(
                "invalidation pattern must not be empty".to_string(),
            ));
        }
        core.incidents.check_mutation()?;
        let matches = pattern_matcher(pattern)?;

        let topology = core.topology.read().await;
        let mut removed = Vec::new();
        let mut failure = None;
        {
            let shards = topology.shards();
            let mut guards = lock_shards(shards).await;
            for (shard, guard) in shards.iter().zip(guards.iter_mut()) {
                let (keys, err) = shard.invalidate_locked(guard, &*matches);
                removed.extend(keys);
                if err.is_some() {
                    failure = err;
                    break;
                }
            }
        }
        for key in &removed {
            topology.clear_override(key);
        }
        core.stats.record_deletes(removed.len());

        if let Some(e) = failure {
            warn!(pattern, removed = removed.len(), error = %e, "invalidation stopped early");
            return Err(e);
        }
        info!(pattern, removed = removed.len(), "invalidated keys");
        Ok(removed.len())
    }

    // == Stats ==
    pub async fn stats(&self) -> CacheStats {
        let core = &*self.core;
        let topology = core.topology.read().await;
        let mut stats = core.stats.report();
        stats.shard_loads = topology.shards().iter().map(|s| s.load()).collect();
        stats.key_locks = core.locks.len();
        stats.sweep_interval_ms = core.eviction.current_interval().as_millis() as u64;
        stats.incident_state = core.incidents.state().to_string();
        stats.finalize()
    }

    pub fn incident_state(&self) -> IncidentState {
        self.core.incidents.state()
    }

    pub fn incident_history(&self) -> Vec<IncidentAlert> {
        self.core.incidents.history()
    }

    /// What the latest restore from disk found, if persistence is enabled.
    pub fn last_recovery(&self) -> Option<RecoveryReport> {
        self.core.last_recovery.lock().clone()
    }

    pub async fn shard_count(&self) -> usize {
        self.core.topology.read().await.shard_count()
    }

    // == Snapshot ==
    /// Writes a snapshot. Returns `None` when persistence is disabled.
    pub async fn snapshot(&self) -> Result<Option<PathBuf>> {
        let core = &*self.core;
        let Some(persistence) = &core.persistence else {
            return Ok(None);
        };
        let _serial = persistence.snapshot_lock().lock().await;

        // Everything logged up to here is visible to the capture below
        let floor = persistence.last_seq();
        let mut entries = Vec::new();
        let mut max_seq = floor;
        let relocations = {
            let topology = core.topology.read().await;
            for shard in topology.shards() {
                let (mut captured, seq) = shard.capture().await;
                entries.append(&mut captured);
                max_seq = max_seq.max(seq);
            }
            topology.relocations()
        };

        let image = SnapshotImage::new(floor, max_seq, entries, relocations);
        persistence.persist_snapshot(image).await.map(Some)
    }

    /// Deletes expired snapshots and WAL segments.
    pub async fn collect_garbage(&self) -> Result<Option<GcReport>> {
        let Some(persistence) = self.core.persistence.clone() else {
            return Ok(None);
        };
        tokio::task::spawn_blocking(move || persistence.collect_garbage())
            .await
            .map_err(|e| CacheError::Fatal(format!("garbage collector panicked: {e}")))?
            .map(Some)
    }

    // == Incident Recovery ==
    /// Attempts to bring a degraded cache back to `Normal`.
    ///
    /// Memory overload sheds least recently used entries down to the low
    /// watermark. Other incidents restore the durable state from disk, or,
    /// without persistence, check that every shard lock can be taken.
    pub async fn recover_from_incident(&self) -> Result<IncidentState> {
        let core = &*self.core;
        let Some(kind) = core.incidents.begin_rollback() else {
            core.incidents.check_available()?;
            return Ok(core.incidents.state());
        };
        warn!(incident = ?kind, "rolling back");

        let budget = core.config.rollback_timeout;
        let outcome = match tokio::time::timeout(budget, self.roll_back(kind)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("rollback timed out after {budget:?}")),
        };
        if let Err(reason) = &outcome {
            error!(incident = ?kind, reason = %reason, "rollback attempt failed");
        }

        match core.incidents.finish_rollback(outcome) {
            IncidentState::Failed => {
                core.incidents.check_available()?;
                Ok(IncidentState::Failed)
            }
            state => Ok(state),
        }
    }

    async fn roll_back(&self, kind: IncidentKind) -> Result<()> {
        let core = &*self.core;
        if kind == IncidentKind::MemoryOverload {
            return self.shed_memory().await;
        }
        match &core.persistence {
            Some(persistence) => {
                let _serial = persistence.snapshot_lock().lock().await;
                let topology = core.topology.read().await;
                let report = replay::restore(&topology, persistence, &core.incidents).await?;
                *core.last_recovery.lock() = Some(report);
                Ok(())
            }
            None => {
                let topology = core.topology.read().await;
                drop(lock_shards(topology.shards()).await);
                Ok(())
            }
        }
    }

    /// Evicts LRU entries across shards, proportionally to their size,
    /// until the total is at the low watermark.
    async fn shed_memory(&self) -> Result<()> {
        let core = &*self.core;
        let limit = core.config.memory_hard_limit_bytes;
        let target = (limit as f64 * core.config.memory_low_watermark_ratio) as usize;

        let topology = core.topology.read().await;
        let total = topology.total_bytes();
        if total > target {
            let mut evicted = 0;
            for shard in topology.shards() {
                let share = (shard.bytes() as f64 * target as f64 / total as f64) as usize;
                evicted += shard.evict_to_bytes(share).await;
            }
            info!(evicted, before = total, after = topology.total_bytes(), "shed memory");
        }

        let remaining = topology.total_bytes();
        if remaining > limit {
            return Err(CacheError::Fatal(format!(
                "still {remaining} bytes after shedding, limit {limit}"
            )));
        }
        Ok(())
    }

    // == Maintenance ==
    fn check_memory_in(&self, topology: &Topology) -> usize {
        let bytes = topology.total_bytes();
        self.core
            .incidents
            .report_memory(bytes, self.core.config.memory_hard_limit_bytes);
        bytes
    }

    /// Reports memory overload if estimated usage is above the hard limit.
    pub async fn check_memory(&self) -> usize {
        let topology = self.core.topology.read().await;
        self.check_memory_in(&topology)
    }

    /// One sweep pass plus an interval adjustment.
    pub async fn sweep(&self) -> SweepReport {
        let core = &*self.core;
        let report = {
            let topology = core.topology.read().await;
            let report = core.eviction.sweep(topology.shards()).await;
            self.check_memory_in(&topology);
            report
        };
        core.eviction.adjust();
        if report.expired + report.evicted > 0 {
            debug!(
                expired = report.expired,
                evicted = report.evicted,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "sweep finished"
            );
        }
        report
    }

    /// Current adaptive sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        self.core.eviction.current_interval()
    }

    /// One balance cycle. Waits for any snapshot in progress, so a capture
    /// never sees a key between its old and new shard.
    pub async fn rebalance(&self) -> Result<BalanceReport> {
        let core = &*self.core;
        let _serial = match &core.persistence {
            Some(persistence) => Some(persistence.snapshot_lock().lock().await),
            None => None,
        };
        let topology = core.topology.read().await;
        core.balancer.rebalance(&topology, &core.locks).await
    }

    /// Reclaims idle key locks; reports a leak if the table stays large.
    pub fn reap_locks(&self) -> usize {
        let core = &*self.core;
        let reaped = core.locks.reap_idle(core.config.lock_idle_reclaim);
        let remaining = core.locks.len();
        if remaining > core.config.lock_leak_threshold {
            core.incidents.report_recoverable(
                IncidentKind::LockLeak,
                format!(
                    "{remaining} key locks remain after reaping, threshold {}",
                    core.config.lock_leak_threshold
                ),
            );
        }
        reaped
    }

    // == Topology ==
    /// Adds a shard and moves the keys the ring now assigns to it.
    pub async fn add_shard(&self) -> Result<usize> {
        let mut topology = self.core.topology.write().await;

        let mut keys = Vec::new();
        for shard in topology.shards() {
            keys.extend(
                shard
                    .keys()
                    .await
                    .into_iter()
                    .filter(|key| !topology.has_override(key)),
            );
        }
        let (index, moves) = topology.push_shard(keys.iter().map(String::as_str));

        let mut moved = 0;
        if let Some(dst) = topology.shard(index) {
            for (key, from) in &moves {
                if let Some(src) = topology.shard(*from) {
                    if src.transfer_to(dst, key).await {
                        moved += 1;
                    }
                }
            }
            dst.enforce_bounds().await;
        }
        info!(shard = index, moved, "shard added");
        Ok(index)
    }

    /// Removes the highest-numbered shard, moving its keys to their new
    /// owners. The last remaining shard cannot be removed.
    pub async fn remove_shard(&self) -> Result<usize> {
        let mut topology = self.core.topology.write().await;
        if topology.shard_count() <= 1 {
            return Err(CacheError::InvalidConfig(
                "cannot remove the last shard".to_string(),
            ));
        }
        let removed = topology.pop_shard()?;

        let mut moved = 0;
        for key in removed.keys().await {
            let dst = topology.route_shard(&key)?;
            if removed.transfer_to(dst, &key).await {
                moved += 1;
            }
        }
        for shard in topology.shards() {
            shard.enforce_bounds().await;
        }
        info!(shard = removed.index(), moved, "shard removed");
        Ok(removed.index())
    }
}

impl std::fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFacade")
            .field("incident_state", &self.core.incidents.state())
            .field("persistent", &self.core.persistence.is_some())
            .finish()
    }
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

fn pattern_matcher(pattern: &str) -> Result<Matcher> {
    if pattern.contains(['*', '?', '[', '{']) {
        let glob = Glob::new(pattern)
            .map_err(|e| CacheError::Validation(format!("bad pattern '{pattern}': {e}")))?
            .compile_matcher();
        Ok(Box::new(move |key| glob.is_match(key)))
    } else {
        let prefix = pattern.to_string();
        Ok(Box::new(move |key| key.starts_with(&prefix)))
    }
}
