//! Persistence module
//!
//! Owns the WAL writer, snapshot files and their garbage collection. The
//! cache calls [`PersistenceManager::append`] under a shard write lock for
//! every mutation, so WAL order matches the order mutations hit each shard.

pub(crate) mod base64_value;
mod gc;
mod recovery;
mod snapshot;
mod wal;

pub use gc::{GcReport, SnapshotGarbageCollector};
pub use recovery::{recover, RecoveredState, RecoveryReport};
pub use snapshot::{
    list_snapshots, load_snapshot, write_snapshot, SnapshotEntry, SnapshotImage, SnapshotInfo,
    SNAPSHOT_VERSION,
};
pub use wal::{
    list_segments, read_segment, seal_stale_segments, SegmentInfo, SegmentedWal, WalOp, WalRecord,
    WalSink,
};

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::entry::current_timestamp_ms;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

struct WalWriter {
    sink: Box<dyn WalSink>,
    next_seq: u64,
}

// == Persistence Manager ==
pub struct PersistenceManager {
    dir: PathBuf,
    wal: Mutex<WalWriter>,
    retry_attempts: u32,
    snapshot_lock: tokio::sync::Mutex<()>,
    gc: SnapshotGarbageCollector,
}

impl PersistenceManager {
    /// Prepares `dir` and the WAL writer.
    ///
    /// Stale `.open` segments are sealed here, before anything is appended.
    /// Without a custom `sink`, a [`SegmentedWal`] in `dir` is used.
    pub fn open(dir: &Path, config: &CacheConfig, sink: Option<Box<dyn WalSink>>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let sealed = seal_stale_segments(dir)?;
        if sealed > 0 {
            info!(sealed, "sealed WAL segments left by a previous run");
        }

        let sink = sink.unwrap_or_else(|| {
            Box::new(SegmentedWal::new(
                dir,
                config.wal_segment_max_bytes,
                config.sync_on_append,
            ))
        });

        Ok(Self {
            dir: dir.to_path_buf(),
            wal: Mutex::new(WalWriter { sink, next_seq: 1 }),
            retry_attempts: config.wal_retry_attempts,
            snapshot_lock: tokio::sync::Mutex::new(()),
            gc: SnapshotGarbageCollector::new(dir, config.snapshot_retention, config.wal_retention),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // == WAL ==
    /// Appends `op` and returns its sequence number.
    ///
    /// The sequence only advances when the append lands; a failed attempt is
    /// retried up to the configured count before giving up.
    pub fn append(&self, op: WalOp) -> Result<u64> {
        let mut writer = self.wal.lock();
        let seq = writer.next_seq;
        let line = WalRecord::new(seq, current_timestamp_ms(), op).encode()?;

        let mut attempt = 0;
        loop {
            match writer.sink.append(seq, &line) {
                Ok(()) => {
                    writer.next_seq += 1;
                    return Ok(seq);
                }
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    debug!(seq, attempt, error = %e, "retrying WAL append");
                }
                Err(e) => {
                    return Err(CacheError::WalWriteFailure(format!(
                        "append of seq {seq} failed after {} attempts: {e}",
                        attempt + 1
                    )));
                }
            }
        }
    }

    /// Sequence number of the last successful append, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.wal.lock().next_seq.saturating_sub(1)
    }

    /// Continues numbering at `next_seq` in a fresh segment.
    pub fn resume_from(&self, next_seq: u64) -> Result<()> {
        let mut writer = self.wal.lock();
        writer.next_seq = next_seq.max(1);
        let next = writer.next_seq;
        writer.sink.rotate(next)?;
        Ok(())
    }

    /// Seals the active segment.
    pub fn rotate(&self) -> Result<()> {
        let mut writer = self.wal.lock();
        let next = writer.next_seq;
        writer.sink.rotate(next)?;
        Ok(())
    }

    // == Snapshots ==
    /// Serializes snapshot writers against each other and against restores.
    pub fn snapshot_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.snapshot_lock
    }

    /// Writes `image` off the async runtime, then starts a new WAL segment
    /// so older segments become collectable.
    pub async fn persist_snapshot(&self, image: SnapshotImage) -> Result<PathBuf> {
        let dir = self.dir.clone();
        let entries = image.entry_count;
        let path = tokio::task::spawn_blocking(move || {
            let mut image = image;
            write_snapshot(&dir, &mut image)
        })
            .await
            .map_err(|e| CacheError::Fatal(format!("snapshot writer panicked: {e}")))??;

        if let Err(e) = self.rotate() {
            warn!(error = %e, "WAL rotation after snapshot failed");
        }
        info!(path = %path.display(), entries, "snapshot written");
        Ok(path)
    }

    pub fn recover(&self) -> Result<RecoveredState> {
        recover(&self.dir)
    }

    pub fn collect_garbage(&self) -> Result<GcReport> {
        self.gc.run()
    }
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("dir", &self.dir)
            .field("last_seq", &self.last_seq())
            .finish()
    }
}
