//! Recovery
//!
//! Finds the newest readable snapshot and the WAL records that follow it.
//! Applying them to the shards is the cache's job; this module only decides
//! what to apply.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::persistence::snapshot::{list_snapshots, load_snapshot, SnapshotImage};
use crate::persistence::wal::{list_segments, read_segment, WalRecord};

// == Recovery Report ==
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub snapshot_path: Option<PathBuf>,
    /// Replay floor of the snapshot used, 0 without one
    pub snapshot_seq: u64,
    /// Snapshots skipped as unreadable, newest first
    pub corrupt_snapshots: Vec<(PathBuf, String)>,
    pub replayed_records: usize,
    /// WAL lines that could not be decoded
    pub skipped_lines: usize,
    /// A snapshot exists but no WAL segment does
    pub wal_missing: bool,
    /// First missing sequence range `(expected, found)`
    pub sequence_gap: Option<(u64, u64)>,
    /// Highest sequence seen anywhere; the writer resumes after it
    pub last_seq: u64,
}

impl RecoveryReport {
    /// True when recovery lost data it could detect.
    pub fn lost_data(&self) -> bool {
        self.wal_missing || self.sequence_gap.is_some()
    }
}

#[derive(Debug, Default)]
pub struct RecoveredState {
    pub snapshot: Option<SnapshotImage>,
    /// Records after the snapshot floor, in sequence order, without duplicates
    pub records: Vec<WalRecord>,
    pub report: RecoveryReport,
}

// == Recover ==
pub fn recover(dir: &Path) -> Result<RecoveredState> {
    let mut report = RecoveryReport::default();

    let mut snapshot = None;
    for info in list_snapshots(dir)? {
        match load_snapshot(&info.path) {
            Ok(image) => {
                report.snapshot_path = Some(info.path);
                snapshot = Some(image);
                break;
            }
            Err(e) => {
                warn!(path = %info.path.display(), error = %e, "snapshot unreadable, trying an older one");
                report.corrupt_snapshots.push((info.path, e.to_string()));
            }
        }
    }

    let floor = snapshot.as_ref().map_or(0, |s| s.wal_seq);
    report.snapshot_seq = floor;
    report.last_seq = snapshot.as_ref().map_or(0, |s| s.max_seq_observed.max(s.wal_seq));

    let segments = list_segments(dir)?;
    if snapshot.is_some() && segments.is_empty() {
        report.wal_missing = true;
    }

    let mut records = Vec::new();
    for segment in &segments {
        if let Some(last) = segment.last_seq {
            report.last_seq = report.last_seq.max(last);
            if last <= floor {
                continue;
            }
        }
        let (mut segment_records, skipped) = read_segment(&segment.path)?;
        report.skipped_lines += skipped;
        records.append(&mut segment_records);
    }

    if let Some(max) = records.iter().map(|r| r.seq).max() {
        report.last_seq = report.last_seq.max(max);
    }
    records.retain(|r| r.seq > floor);
    records.sort_by_key(|r| r.seq);
    records.dedup_by_key(|r| r.seq);

    let mut expected = floor + 1;
    for record in &records {
        if record.seq != expected {
            report.sequence_gap = Some((expected, record.seq));
            break;
        }
        expected += 1;
    }

    report.replayed_records = records.len();
    info!(
        snapshot_seq = floor,
        records = records.len(),
        corrupt_snapshots = report.corrupt_snapshots.len(),
        "recovery plan ready"
    );

    Ok(RecoveredState {
        snapshot,
        records,
        report,
    })
}
