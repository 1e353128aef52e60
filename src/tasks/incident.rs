//! Incident Monitor Task
//!
//! Checks memory pressure and, while the cache is degraded, keeps
//! attempting a rollback until it succeeds or the responder gives up.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::CacheFacade;
use crate::incident::IncidentState;
use crate::tasks::wait_or_shutdown;

pub fn spawn_incident_monitor(
    cache: CacheFacade,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = cache.config().incident_check_interval;

    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Starting incident monitor");

        while wait_or_shutdown(interval, &mut shutdown).await {
            cache.check_memory().await;
            if cache.incident_state() != IncidentState::Degraded {
                continue;
            }
            match cache.recover_from_incident().await {
                Ok(IncidentState::Normal) => info!("incident resolved"),
                Ok(state) => warn!(%state, "rollback attempt did not resolve the incident"),
                Err(e) => {
                    error!(error = %e, "cache failed; incident monitor stopping");
                    break;
                }
            }
        }
        debug!("incident monitor stopped");
    })
}
