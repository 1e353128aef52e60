//! Snapshot files
//!
//! A snapshot is a JSON image of every live entry plus the WAL sequence it
//! was taken at, sealed with a CRC32C of its contents. Files are named `snapshot-<capture time>-<seq>.json` and
//! written through a temporary file and a rename, so a reader never sees a
//! half-written image under the final name.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

// == Snapshot Image ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub version: u32,
    /// Replay floor: every record up to this sequence is reflected
    pub wal_seq: u64,
    /// Highest sequence applied to any shard while capturing
    pub max_seq_observed: u64,
    pub captured_at: DateTime<Utc>,
    pub entry_count: usize,
    pub entries: Vec<SnapshotEntry>,
    /// Balancer overrides: key -> shard
    pub relocations: Vec<(String, usize)>,
    /// CRC32C over every other field, set when written
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    #[serde(with = "crate::persistence::base64_value")]
    pub value: Vec<u8>,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_access: u64,
}

impl SnapshotImage {
    pub fn new(
        wal_seq: u64,
        max_seq_observed: u64,
        entries: Vec<SnapshotEntry>,
        relocations: Vec<(String, usize)>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            wal_seq,
            max_seq_observed: max_seq_observed.max(wal_seq),
            captured_at: Utc::now(),
            entry_count: entries.len(),
            entries,
            relocations,
            checksum: 0,
        }
    }

    fn content_checksum(&self) -> serde_json::Result<u32> {
        let body = serde_json::to_vec(&(
            self.version,
            self.wal_seq,
            self.max_seq_observed,
            &self.captured_at,
            self.entry_count,
            &self.entries,
            &self.relocations,
        ))?;
        Ok(crc32c(&body))
    }

    /// Stamps the checksum over the current contents.
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = self.content_checksum()?;
        Ok(())
    }

    pub fn file_name(&self) -> String {
        format!(
            "{SNAPSHOT_PREFIX}{}-{:020}{SNAPSHOT_SUFFIX}",
            self.captured_at.format("%Y%m%dT%H%M%S%3f"),
            self.wal_seq
        )
    }
}

// == Snapshot Info ==
/// A snapshot file found on disk.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub wal_seq: u64,
    /// Capture time as encoded in the name
    pub captured: String,
    pub modified: SystemTime,
}

fn parse_snapshot_name(name: &str) -> Option<(String, u64)> {
    let body = name
        .strip_prefix(SNAPSHOT_PREFIX)?
        .strip_suffix(SNAPSHOT_SUFFIX)?;
    let (captured, seq) = body.rsplit_once('-')?;
    Some((captured.to_string(), seq.parse().ok()?))
}

/// Lists snapshots in `dir`, newest first.
pub fn list_snapshots(dir: &Path) -> io::Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((captured, wal_seq)) = name.to_str().and_then(parse_snapshot_name) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        snapshots.push(SnapshotInfo {
            path: entry.path(),
            wal_seq,
            captured,
            modified,
        });
    }
    snapshots.sort_by(|a, b| {
        (b.wal_seq, &b.captured).cmp(&(a.wal_seq, &a.captured))
    });
    Ok(snapshots)
}

/// Seals `image`, writes it into `dir` and returns the final path.
pub fn write_snapshot(dir: &Path, image: &mut SnapshotImage) -> Result<PathBuf> {
    image.seal()?;
    let name = image.file_name();
    let final_path = dir.join(&name);
    let tmp_path = dir.join(format!(".{name}.tmp"));

    let bytes = serde_json::to_vec(image)?;
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

/// Loads and checks a snapshot file.
pub fn load_snapshot(path: &Path) -> Result<SnapshotImage> {
    let corrupt = |reason: String| CacheError::SnapshotCorrupt {
        path: path.display().to_string(),
        reason,
    };

    let bytes = fs::read(path)?;
    let image: SnapshotImage =
        serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    if image.version != SNAPSHOT_VERSION {
        return Err(corrupt(format!("unsupported version {}", image.version)));
    }
    if image.entry_count != image.entries.len() {
        return Err(corrupt(format!(
            "entry count {} does not match {} entries",
            image.entry_count,
            image.entries.len()
        )));
    }
    let actual = image
        .content_checksum()
        .map_err(|e| corrupt(e.to_string()))?;
    if actual != image.checksum {
        return Err(corrupt(format!(
            "checksum {:08x} does not match contents {actual:08x}",
            image.checksum
        )));
    }
    Ok(image)
}
