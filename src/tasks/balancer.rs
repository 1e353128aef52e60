//! Balancer Task

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::tasks::wait_or_shutdown;

/// Spawns the periodic shard balancer.
pub fn spawn_balancer_task(cache: CacheFacade, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = cache.config().balance_interval;

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting shard balancer");

        while wait_or_shutdown(interval, &mut shutdown).await {
            match cache.rebalance().await {
                Ok(report) if report.migrated > 0 => {
                    debug!(migrated = report.migrated, skipped = report.skipped, "balance cycle done");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "balance cycle failed"),
            }
        }
        debug!("balancer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::ConsistentHashRing;
    use crate::config::{CacheConfig, LoadMetric};

    #[tokio::test]
    async fn test_balancer_spreads_hot_shard() {
        let config = CacheConfig {
            shard_count: 2,
            balance_interval: Duration::from_millis(20),
            balance_min_load: 1,
            load_metric: LoadMetric::Bytes,
            migration_batch_size: 16,
            ..Default::default()
        };
        // Same ring the cache builds, used to aim every write at shard 0
        let ring = ConsistentHashRing::new(config.shard_count, config.virtual_nodes);
        let keys: Vec<String> = (0..)
            .map(|i| format!("k{i}"))
            .filter(|k| ring.assign(k).unwrap() == 0)
            .take(32)
            .collect();

        let cache = CacheFacade::open(config).await.unwrap();
        for key in &keys {
            cache.set(key, vec![0u8; 256], None).await.unwrap();
        }
        assert_eq!(cache.stats().await.shard_loads[1].entries, 0);

        let (tx, rx) = watch::channel(false);
        let handle = spawn_balancer_task(cache.clone(), rx);
        tokio::time::sleep(Duration::from_millis(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.total_entries, 32);
        assert!(stats.shard_loads[1].entries > 0);
        assert!(stats.migrations > 0);
        for key in &keys {
            assert!(cache.get(key).await.unwrap().is_hit(), "{key} lost");
        }
    }
}
