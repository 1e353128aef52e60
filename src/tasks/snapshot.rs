//! Snapshot Task
//!
//! Writes a snapshot every `snapshot_interval`. Each snapshot also rotates
//! the WAL, which is what lets the GC task reclaim old segments.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheFacade;
use crate::tasks::wait_or_shutdown;

pub fn spawn_snapshot_task(cache: CacheFacade, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let interval = cache.config().snapshot_interval;

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting snapshot task");

        while wait_or_shutdown(interval, &mut shutdown).await {
            match cache.snapshot().await {
                Ok(Some(path)) => debug!(path = %path.display(), "periodic snapshot written"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "periodic snapshot failed"),
            }
        }
        debug!("snapshot task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::CacheConfig;
    use crate::persistence::list_snapshots;

    #[tokio::test]
    async fn test_snapshots_are_written_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFacade::open(CacheConfig {
            shard_count: 2,
            data_dir: Some(dir.path().to_path_buf()),
            snapshot_interval: Duration::from_millis(30),
            ..Default::default()
        })
        .await
        .unwrap();
        cache.set("a", "1", None).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = spawn_snapshot_task(cache, rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!list_snapshots(dir.path()).unwrap().is_empty());
    }
}
