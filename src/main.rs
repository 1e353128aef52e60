//! Shard Cache daemon
//!
//! Opens the cache from environment configuration, runs its background
//! maintenance and shuts down cleanly on SIGINT/SIGTERM.

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shard_cache::{CacheConfig, CacheFacade};

/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the cache, restoring from the data directory if one is set
/// 4. Start background tasks
/// 5. Wait for a shutdown signal, then stop and write a final snapshot
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shard_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting shard cache");

    let config = CacheConfig::from_env();
    info!(
        shards = config.shard_count,
        default_ttl_secs = config.default_ttl.as_secs(),
        data_dir = ?config.data_dir,
        durability = ?config.durability,
        "Configuration loaded"
    );

    let cache = CacheFacade::open(config)
        .await
        .context("failed to open cache")?;
    if let Some(report) = cache.last_recovery() {
        info!(
            snapshot = ?report.snapshot_path,
            replayed = report.replayed_records,
            lost_data = report.lost_data(),
            "Recovered from disk"
        );
    }

    cache.start();
    info!("Background tasks started");

    shutdown_signal().await;

    cache.stop().await.context("failed to stop cache cleanly")?;
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
