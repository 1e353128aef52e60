//! Background Tasks Module
//!
//! Periodic maintenance that runs while the cache is started.
//!
//! # Tasks
//! - Sweeper: removes expired entries on the adaptive interval
//! - Balancer: migrates keys off overloaded shards
//! - Snapshot: writes periodic snapshots (persistence only)
//! - GC: deletes expired snapshots and WAL segments (persistence only)
//! - Lock reaper: reclaims idle key locks
//! - Incident monitor: checks memory and drives rollback

mod balancer;
mod gc;
mod incident;
mod lock_reaper;
mod snapshot;
mod sweeper;

pub use balancer::spawn_balancer_task;
pub use gc::spawn_gc_task;
pub use incident::spawn_incident_monitor;
pub use lock_reaper::spawn_lock_reaper_task;
pub use snapshot::spawn_snapshot_task;
pub use sweeper::spawn_sweeper_task;

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::CacheFacade;

/// Sleeps for `interval` unless shutdown is signalled first.
///
/// Returns false once the task should exit.
pub(crate) async fn wait_or_shutdown(
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        _ = shutdown.changed() => false,
    }
}

// == Background Tasks ==
/// Handles of the running maintenance tasks.
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(cache: &CacheFacade) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let mut handles = vec![
            spawn_sweeper_task(cache.clone(), rx.clone()),
            spawn_balancer_task(cache.clone(), rx.clone()),
            spawn_lock_reaper_task(cache.clone(), rx.clone()),
            spawn_incident_monitor(cache.clone(), rx.clone()),
        ];
        if cache.config().data_dir.is_some() {
            handles.push(spawn_snapshot_task(cache.clone(), rx.clone()));
            handles.push(spawn_gc_task(cache.clone(), rx));
        }
        info!(tasks = handles.len(), "background tasks started");
        Self { shutdown, handles }
    }

    /// Signals every task and waits for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("tasks", &self.handles.len())
            .finish()
    }
}
