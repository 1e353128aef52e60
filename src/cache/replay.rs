//! Recovery Replay
//!
//! Rebuilds shard contents from a recovered snapshot and WAL suffix. All
//! shard write locks are held for the whole rebuild, so no reader sees a
//! half-restored cache.

use tracing::{info, warn};

use crate::cache::entry::{current_timestamp_ms, CacheEntry};
use crate::cache::locks::lock_shards;
use crate::cache::topology::Topology;
use crate::error::Result;
use crate::incident::{IncidentKind, IncidentResponder};
use crate::persistence::{PersistenceManager, RecoveredState, RecoveryReport, WalOp};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub entries_restored: usize,
    pub records_applied: usize,
    /// Snapshot entries and WAL sets that were already past their TTL
    pub expired_skipped: usize,
    /// Relocations to shards the current topology does not have
    pub relocations_skipped: usize,
}

// == Apply ==
/// Replaces the cache contents with `recovered`.
pub(crate) async fn apply(topology: &Topology, recovered: &RecoveredState) -> ReplaySummary {
    let shards = topology.shards();
    let shard_count = shards.len();
    let mut guards = lock_shards(shards).await;
    for guard in guards.iter_mut() {
        guard.clear();
    }
    topology.clear_overrides();

    let now = current_timestamp_ms();
    let mut summary = ReplaySummary::default();

    if let Some(image) = &recovered.snapshot {
        for (key, shard) in &image.relocations {
            if *shard < shard_count {
                topology.set_override(key, *shard);
            } else {
                summary.relocations_skipped += 1;
            }
        }

        // Insert oldest access first so LRU order survives the restart
        let mut entries: Vec<_> = image.entries.iter().collect();
        entries.sort_by_key(|e| e.last_access);
        for entry in entries {
            if now >= entry.expires_at {
                summary.expired_skipped += 1;
                continue;
            }
            let Ok(index) = topology.route(&entry.key) else {
                continue;
            };
            let state = &mut guards[index];
            let tick = state.tick();
            state.insert(
                entry.key.clone(),
                CacheEntry::restore(
                    &entry.key,
                    entry.value.clone(),
                    entry.created_at,
                    entry.expires_at,
                    tick,
                ),
            );
            summary.entries_restored += 1;
        }
    }

    for record in &recovered.records {
        let Ok(index) = topology.route(record.op.key()) else {
            continue;
        };
        match &record.op {
            WalOp::Set {
                key,
                value,
                created_at,
                expires_at,
            } => {
                let state = &mut guards[index];
                if now >= *expires_at {
                    state.remove(key);
                    summary.expired_skipped += 1;
                    continue;
                }
                let tick = state.tick();
                state.insert(
                    key.clone(),
                    CacheEntry::restore(key, value.clone(), *created_at, *expires_at, tick),
                );
            }
            WalOp::Delete { key } => {
                guards[index].remove(key);
                topology.clear_override(key);
            }
            WalOp::Relocate { key, shard } => {
                if *shard >= shard_count {
                    summary.relocations_skipped += 1;
                    continue;
                }
                if index != *shard {
                    if let Some(entry) = guards[index].remove(key) {
                        let dst = &mut guards[*shard];
                        let tick = dst.tick();
                        dst.insert(
                            key.clone(),
                            CacheEntry::restore(
                                key,
                                entry.value,
                                entry.created_at,
                                entry.expires_at,
                                tick,
                            ),
                        );
                    }
                }
                if guards[*shard].contains(key) {
                    topology.set_override(key, *shard);
                }
            }
        }
        summary.records_applied += 1;
    }

    for (shard, guard) in shards.iter().zip(guards.iter_mut()) {
        guard.last_seq = recovered.report.last_seq;
        shard.sync_counters(guard);
    }
    summary
}

// == Restore ==
/// Loads the latest durable state from disk into the shards and resumes
/// the WAL after the highest sequence found.
pub(crate) async fn restore(
    topology: &Topology,
    persistence: &PersistenceManager,
    incidents: &IncidentResponder,
) -> Result<RecoveryReport> {
    let recovered = persistence.recover()?;
    let report = recovered.report.clone();

    for (path, reason) in &report.corrupt_snapshots {
        incidents.report_recoverable(
            IncidentKind::SnapshotCorrupt,
            format!("skipped snapshot {}: {reason}", path.display()),
        );
    }
    if report.wal_missing {
        incidents.report_recoverable(
            IncidentKind::WalLoss,
            "snapshot found but no WAL segments; mutations after it are lost".to_string(),
        );
    }
    if let Some((expected, found)) = report.sequence_gap {
        incidents.report_recoverable(
            IncidentKind::WalLoss,
            format!("WAL sequence gap: expected {expected}, found {found}"),
        );
    }

    let summary = apply(topology, &recovered).await;
    persistence.resume_from(report.last_seq + 1)?;

    let mut evicted = 0;
    for shard in topology.shards() {
        let (_, n) = shard.enforce_bounds().await;
        evicted += n;
    }
    if evicted > 0 {
        warn!(evicted, "recovered state exceeded shard bounds");
    }

    info!(
        snapshot_seq = report.snapshot_seq,
        entries = summary.entries_restored,
        records = summary.records_applied,
        last_seq = report.last_seq,
        "cache state restored"
    );
    Ok(report)
}
