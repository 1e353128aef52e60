//! Adaptive Sweeper Task
//!
//! Removes expired entries and enforces shard bounds, sleeping for
//! whatever interval the eviction controller last chose.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheFacade;
use crate::tasks::wait_or_shutdown;

/// Spawns the sweeper. It exits when `shutdown` flips to true.
pub fn spawn_sweeper_task(cache: CacheFacade, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = cache.sweep_interval().as_millis() as u64,
            "Starting adaptive sweeper"
        );

        while wait_or_shutdown(cache.sweep_interval(), &mut shutdown).await {
            let report = cache.sweep().await;
            if report.expired > 0 || report.evicted > 0 {
                info!(
                    expired = report.expired,
                    evicted = report.evicted,
                    next_ms = cache.sweep_interval().as_millis() as u64,
                    "Sweep removed entries"
                );
            } else {
                debug!("Sweep: no expired entries found");
            }
        }
        debug!("sweeper stopped");
    })
}
