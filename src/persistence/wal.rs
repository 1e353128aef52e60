//! Write-Ahead Log
//!
//! One JSON record per line, each carrying a CRC32C of its contents. The
//! active segment is `wal-<first>.open`; rotation seals it as
//! `wal-<first>-<last>.log`, so sealed segments carry their sequence range
//! in the file name.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const WAL_PREFIX: &str = "wal-";
const OPEN_SUFFIX: &str = ".open";
const SEALED_SUFFIX: &str = ".log";

// == WAL Record ==
/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub seq: u64,
    pub timestamp_ms: u64,
    /// CRC32C over `seq`, `timestamp_ms` and `op`
    pub crc: u32,
    #[serde(flatten)]
    pub op: WalOp,
}

impl WalRecord {
    pub fn new(seq: u64, timestamp_ms: u64, op: WalOp) -> Self {
        Self {
            seq,
            timestamp_ms,
            crc: 0,
            op,
        }
    }

    fn content_checksum(&self) -> serde_json::Result<u32> {
        let body = serde_json::to_vec(&(self.seq, self.timestamp_ms, &self.op))?;
        Ok(crc32c(&body))
    }

    /// Stamps the checksum and returns the encoded line.
    pub fn encode(&mut self) -> serde_json::Result<Vec<u8>> {
        self.crc = self.content_checksum()?;
        serde_json::to_vec(self)
    }

    pub fn checksum_matches(&self) -> bool {
        self.content_checksum().is_ok_and(|crc| crc == self.crc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    Set {
        key: String,
        #[serde(with = "crate::persistence::base64_value")]
        value: Vec<u8>,
        created_at: u64,
        expires_at: u64,
    },
    Delete {
        key: String,
    },
    /// Balancer moved `key` to `shard`
    Relocate {
        key: String,
        shard: usize,
    },
}

impl WalOp {
    pub fn key(&self) -> &str {
        match self {
            WalOp::Set { key, .. } | WalOp::Delete { key } | WalOp::Relocate { key, .. } => key,
        }
    }
}

// == WAL Sink ==
/// Destination for encoded WAL lines.
///
/// Implementations are driven under the persistence manager's lock, so they
/// never see concurrent calls.
pub trait WalSink: Send {
    /// Appends one encoded record carrying sequence number `seq`.
    fn append(&mut self, seq: u64, line: &[u8]) -> io::Result<()>;

    /// Seals the active segment and starts a new one at `next_seq`.
    fn rotate(&mut self, next_seq: u64) -> io::Result<()>;
}

// == Segment Info ==
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub first_seq: u64,
    /// `None` while the segment is still open
    pub last_seq: Option<u64>,
    pub modified: SystemTime,
}

impl SegmentInfo {
    pub fn is_sealed(&self) -> bool {
        self.last_seq.is_some()
    }
}

pub fn open_segment_name(first_seq: u64) -> String {
    format!("{WAL_PREFIX}{first_seq:020}{OPEN_SUFFIX}")
}

pub fn sealed_segment_name(first_seq: u64, last_seq: u64) -> String {
    format!("{WAL_PREFIX}{first_seq:020}-{last_seq:020}{SEALED_SUFFIX}")
}

fn parse_segment_name(name: &str) -> Option<(u64, Option<u64>)> {
    let rest = name.strip_prefix(WAL_PREFIX)?;
    if let Some(first) = rest.strip_suffix(OPEN_SUFFIX) {
        return Some((first.parse().ok()?, None));
    }
    let range = rest.strip_suffix(SEALED_SUFFIX)?;
    let (first, last) = range.split_once('-')?;
    Some((first.parse().ok()?, Some(last.parse().ok()?)))
}

/// Lists WAL segments in `dir`, ordered by first sequence number.
pub fn list_segments(dir: &Path) -> io::Result<Vec<SegmentInfo>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some((first_seq, last_seq)) = name.to_str().and_then(parse_segment_name) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        segments.push(SegmentInfo {
            path: entry.path(),
            first_seq,
            last_seq,
            modified,
        });
    }
    segments.sort_by_key(|s| (s.first_seq, s.last_seq.is_none()));
    Ok(segments)
}

/// Reads every decodable record of a segment.
///
/// Torn or garbled lines (a crash mid-append) and lines whose checksum does
/// not match are skipped and counted.
pub fn read_segment(path: &Path) -> io::Result<(Vec<WalRecord>, usize)> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    let mut skipped = 0;
    for (line_no, line) in reader.split(b'\n').enumerate() {
        let line = line?;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<WalRecord>(&line) {
            Ok(record) if record.checksum_matches() => records.push(record),
            Ok(record) => {
                warn!(path = %path.display(), line = line_no + 1, seq = record.seq, "skipping WAL line with bad checksum");
                skipped += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), line = line_no + 1, error = %e, "skipping unreadable WAL line");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

/// Seals `.open` segments left behind by a previous process.
///
/// Segments holding no readable record are removed. Must only run before
/// the WAL writer is resumed.
pub fn seal_stale_segments(dir: &Path) -> io::Result<usize> {
    let mut sealed = 0;
    for segment in list_segments(dir)? {
        if segment.is_sealed() {
            continue;
        }
        let (records, _) = read_segment(&segment.path)?;
        match records.iter().map(|r| r.seq).max() {
            Some(last) => {
                let target = dir.join(sealed_segment_name(segment.first_seq, last));
                fs::rename(&segment.path, target)?;
            }
            None => fs::remove_file(&segment.path)?,
        }
        sealed += 1;
    }
    Ok(sealed)
}

struct ActiveSegment {
    file: File,
    path: PathBuf,
    first_seq: u64,
    last_seq: Option<u64>,
    bytes: u64,
}

// == Segmented WAL ==
/// File-backed WAL sink rotating into size-bounded segments.
pub struct SegmentedWal {
    dir: PathBuf,
    max_segment_bytes: u64,
    sync_on_append: bool,
    active: Option<ActiveSegment>,
}

impl SegmentedWal {
    pub fn new(dir: impl Into<PathBuf>, max_segment_bytes: u64, sync_on_append: bool) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: max_segment_bytes.max(1),
            sync_on_append,
            active: None,
        }
    }

    fn open(&mut self, first_seq: u64) -> io::Result<()> {
        let path = self.dir.join(open_segment_name(first_seq));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes = file.metadata()?.len();
        debug!(path = %path.display(), "opened WAL segment");
        self.active = Some(ActiveSegment {
            file,
            path,
            first_seq,
            last_seq: None,
            bytes,
        });
        Ok(())
    }

    fn seal(&mut self) -> io::Result<()> {
        let Some(mut segment) = self.active.take() else {
            return Ok(());
        };
        segment.file.flush()?;
        segment.file.sync_all()?;
        match segment.last_seq {
            Some(last) => {
                let target = self.dir.join(sealed_segment_name(segment.first_seq, last));
                fs::rename(&segment.path, &target)?;
                debug!(path = %target.display(), "sealed WAL segment");
            }
            None => fs::remove_file(&segment.path)?,
        }
        Ok(())
    }
}

impl WalSink for SegmentedWal {
    fn append(&mut self, seq: u64, line: &[u8]) -> io::Result<()> {
        let full = self
            .active
            .as_ref()
            .is_some_and(|s| s.last_seq.is_some() && s.bytes >= self.max_segment_bytes);
        if full {
            self.seal()?;
        }
        if self.active.is_none() {
            self.open(seq)?;
        }
        let sync = self.sync_on_append;
        let segment = self
            .active
            .as_mut()
            .ok_or_else(|| io::Error::other("no active WAL segment"))?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        segment.file.write_all(&buf)?;
        if sync {
            segment.file.sync_data()?;
        }
        segment.bytes += buf.len() as u64;
        segment.last_seq = Some(seq);
        Ok(())
    }

    fn rotate(&mut self, next_seq: u64) -> io::Result<()> {
        self.seal()?;
        self.open(next_seq)
    }
}

impl Drop for SegmentedWal {
    fn drop(&mut self) {
        if let Some(segment) = self.active.as_mut() {
            let _ = segment.file.sync_all();
        }
    }
}
