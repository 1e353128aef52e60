//! Lock Reaper Task
//!
//! Key locks are created on demand; this task drops the ones nobody has
//! touched for `lock_idle_reclaim`.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::CacheFacade;
use crate::tasks::wait_or_shutdown;

pub fn spawn_lock_reaper_task(
    cache: CacheFacade,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = cache.config().lock_reap_interval;

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Starting lock reaper");

        while wait_or_shutdown(interval, &mut shutdown).await {
            let reaped = cache.reap_locks();
            if reaped > 0 {
                debug!(reaped, "reaped idle key locks");
            }
        }
        debug!("lock reaper stopped");
    })
}
