//! Load Balancer
//!
//! Compares shard load and migrates keys from the hottest shard to the
//! coldest when the ratio crosses the imbalance threshold. A migrated key
//! keeps its new home through a topology override.

use tracing::{debug, info, warn};

use crate::cache::{CacheShard, ShardLockManager, Topology};
use crate::config::{CacheConfig, LoadMetric};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub hot: Option<usize>,
    pub cold: Option<usize>,
    pub migrated: usize,
    /// Keys left in place: busy, rerouted meanwhile, gone, or no room
    pub skipped: usize,
    /// Overrides dropped because their key no longer exists
    pub pruned_overrides: usize,
}

// == Load Balancer ==
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    metric: LoadMetric,
    threshold: f64,
    min_load: u64,
    batch_size: usize,
}

impl LoadBalancer {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            metric: config.load_metric,
            threshold: config.imbalance_threshold,
            min_load: config.balance_min_load,
            batch_size: config.migration_batch_size,
        }
    }

    /// Reads each shard's load. For `Operations` this resets the window.
    pub fn measure(&self, shards: &[std::sync::Arc<CacheShard>]) -> Vec<u64> {
        shards
            .iter()
            .map(|shard| match self.metric {
                LoadMetric::Operations => shard.take_window_ops(),
                LoadMetric::Bytes => shard.bytes() as u64,
            })
            .collect()
    }

    // == Plan ==
    /// Returns `(hot, cold)` when the hottest shard is loaded enough and
    /// outweighs the coldest by more than the threshold.
    pub fn plan(&self, loads: &[u64]) -> Option<(usize, usize)> {
        if loads.len() < 2 {
            return None;
        }
        let (hot, hot_load) = loads.iter().copied().enumerate().max_by_key(|(_, l)| *l)?;
        let (cold, cold_load) = loads.iter().copied().enumerate().min_by_key(|(_, l)| *l)?;
        if hot == cold || hot_load < self.min_load {
            return None;
        }
        let ratio = hot_load as f64 / cold_load.max(1) as f64;
        (ratio > self.threshold).then_some((hot, cold))
    }

    // == Rebalance ==
    /// Runs one balance cycle under the caller's topology read lock.
    pub async fn rebalance(
        &self,
        topology: &Topology,
        locks: &ShardLockManager,
    ) -> Result<BalanceReport> {
        let mut report = BalanceReport {
            pruned_overrides: prune_overrides(topology, locks).await,
            ..Default::default()
        };

        let loads = self.measure(topology.shards());
        let Some((hot, cold)) = self.plan(&loads) else {
            return Ok(report);
        };
        report.hot = Some(hot);
        report.cold = Some(cold);
        let (Some(src), Some(dst)) = (topology.shard(hot), topology.shard(cold)) else {
            return Ok(report);
        };

        for key in src.lru_keys(self.batch_size).await {
            let Some(_guard) = locks.try_lock_key(&key) else {
                report.skipped += 1;
                continue;
            };
            if topology.route(&key)? != hot {
                report.skipped += 1;
                continue;
            }
            let _moving = topology.begin_migration();
            match src.migrate_to(dst, &key).await {
                Ok(true) => {
                    // Set before the key lock drops so waiting readers reroute
                    topology.set_override(&key, cold);
                    report.migrated += 1;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "migration stopped");
                    break;
                }
            }
        }

        if report.migrated > 0 {
            info!(
                hot,
                cold,
                hot_load = loads[hot],
                cold_load = loads[cold],
                migrated = report.migrated,
                "rebalanced shards"
            );
        } else {
            debug!(hot, cold, "imbalance found but nothing migrated");
        }
        Ok(report)
    }
}

/// Drops overrides for keys that no longer exist where they point.
async fn prune_overrides(topology: &Topology, locks: &ShardLockManager) -> usize {
    let mut pruned = 0;
    for key in topology.override_keys() {
        let Some(_guard) = locks.try_lock_key(&key) else {
            continue;
        };
        let present = match topology.route_shard(&key) {
            Ok(shard) => shard.contains(&key).await,
            Err(_) => false,
        };
        if !present {
            topology.clear_override(&key);
            pruned += 1;
        }
    }
    pruned
}
