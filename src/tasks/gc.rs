//! Garbage Collection Task

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::tasks::wait_or_shutdown;

/// Spawns the snapshot and WAL garbage collector.
pub fn spawn_gc_task(cache: CacheFacade, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = cache.config().gc_interval;

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting persistence GC");

        while wait_or_shutdown(interval, &mut shutdown).await {
            match cache.collect_garbage().await {
                Ok(Some(report)) if report.bytes_freed > 0 => {
                    info!(bytes_freed = report.bytes_freed, "GC reclaimed disk space");
                }
                Ok(_) => debug!("GC: nothing to delete"),
                Err(e) => warn!(error = %e, "GC run failed"),
            }
        }
        debug!("GC task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::CacheConfig;
    use crate::persistence::list_snapshots;

    #[tokio::test]
    async fn test_gc_keeps_only_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFacade::open(CacheConfig {
            shard_count: 2,
            data_dir: Some(dir.path().to_path_buf()),
            snapshot_retention: Duration::ZERO,
            wal_retention: Duration::ZERO,
            gc_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .await
        .unwrap();
        for i in 0..3 {
            cache.set(&format!("k{i}"), "v", None).await.unwrap();
            cache.snapshot().await.unwrap();
        }
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 3);

        let (tx, rx) = watch::channel(false);
        let handle = spawn_gc_task(cache, rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 1);
    }
}
