//! Snapshot Garbage Collector
//!
//! Deletes expired snapshots and WAL segments while keeping the newest
//! loadable snapshot and every segment needed to replay past it.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::persistence::snapshot::{list_snapshots, load_snapshot};
use crate::persistence::wal::list_segments;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub snapshots_deleted: usize,
    pub segments_deleted: usize,
    pub bytes_freed: u64,
    /// Snapshot every later replay starts from
    pub retained_snapshot: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SnapshotGarbageCollector {
    dir: PathBuf,
    snapshot_retention: Duration,
    wal_retention: Duration,
}

impl SnapshotGarbageCollector {
    pub fn new(dir: impl Into<PathBuf>, snapshot_retention: Duration, wal_retention: Duration) -> Self {
        Self {
            dir: dir.into(),
            snapshot_retention,
            wal_retention,
        }
    }

    pub fn run(&self) -> Result<GcReport> {
        self.run_at(SystemTime::now())
    }

    /// Collects against the clock reading `now`.
    pub fn run_at(&self, now: SystemTime) -> Result<GcReport> {
        let mut report = GcReport::default();
        let age = |t: SystemTime| now.duration_since(t).unwrap_or_default();

        let snapshots = list_snapshots(&self.dir)?;
        let Some(keep) = snapshots.iter().find(|s| load_snapshot(&s.path).is_ok()) else {
            debug!("no loadable snapshot, keeping every file");
            return Ok(report);
        };
        let floor = keep.wal_seq;
        report.retained_snapshot = Some(keep.path.clone());

        for snapshot in &snapshots {
            if snapshot.path == keep.path || age(snapshot.modified) < self.snapshot_retention {
                continue;
            }
            report.bytes_freed += remove(&snapshot.path);
            report.snapshots_deleted += 1;
        }

        for segment in list_segments(&self.dir)? {
            let Some(last) = segment.last_seq else {
                continue;
            };
            if last > floor || age(segment.modified) < self.wal_retention {
                continue;
            }
            report.bytes_freed += remove(&segment.path);
            report.segments_deleted += 1;
        }

        if report.snapshots_deleted + report.segments_deleted > 0 {
            info!(
                snapshots = report.snapshots_deleted,
                segments = report.segments_deleted,
                bytes = report.bytes_freed,
                "persistence garbage collected"
            );
        }
        Ok(report)
    }
}

fn remove(path: &std::path::Path) -> u64 {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    match fs::remove_file(path) {
        Ok(()) => size,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete expired file");
            0
        }
    }
}
