//! Integration Tests for Durability and Incident Handling
//!
//! Each test works in its own temporary data directory. Dropping a cache
//! without calling `stop` stands in for a crash: no final snapshot is
//! written and recovery has to rely on the WAL.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use shard_cache::persistence::{list_snapshots, SegmentedWal};
use shard_cache::{
    AlertSink, CacheConfig, CacheError, CacheFacade, Collaborators, DurabilityMode, IncidentAlert,
    IncidentKind, IncidentState, Lookup, WalSink,
};
use tempfile::TempDir;

// == Helper Functions ==

fn config(dir: &Path) -> CacheConfig {
    CacheConfig {
        shard_count: 4,
        virtual_nodes: 64,
        data_dir: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

async fn open(dir: &Path) -> CacheFacade {
    CacheFacade::open(config(dir)).await.unwrap()
}

fn config_two_shards(dir: &Path) -> CacheConfig {
    CacheConfig {
        shard_count: 2,
        balance_min_load: 10,
        ..config(dir)
    }
}

async fn open_two_shards(dir: &Path) -> CacheFacade {
    CacheFacade::open(config_two_shards(dir)).await.unwrap()
}

async fn read_all(cache: &CacheFacade, keys: &[String]) -> Vec<Lookup> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        out.push(cache.get(key).await.unwrap());
    }
    out
}

/// WAL sink that fails every append while `failing` is set.
struct SwitchableSink {
    inner: SegmentedWal,
    failing: Arc<AtomicBool>,
}

impl WalSink for SwitchableSink {
    fn append(&mut self, seq: u64, line: &[u8]) -> io::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk unplugged"));
        }
        self.inner.append(seq, line)
    }

    fn rotate(&mut self, next_seq: u64) -> io::Result<()> {
        self.inner.rotate(next_seq)
    }
}

/// WAL sink that accepts `remaining` more appends, then fails.
struct ExhaustibleSink {
    inner: SegmentedWal,
    remaining: Arc<AtomicUsize>,
}

impl WalSink for ExhaustibleSink {
    fn append(&mut self, seq: u64, line: &[u8]) -> io::Result<()> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left == 0 {
            return Err(io::Error::other("disk full"));
        }
        self.remaining.store(left - 1, Ordering::SeqCst);
        self.inner.append(seq, line)
    }

    fn rotate(&mut self, next_seq: u64) -> io::Result<()> {
        self.inner.rotate(next_seq)
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<IncidentAlert>>,
}

impl AlertSink for RecordingAlerts {
    fn notify(&self, alert: &IncidentAlert) {
        self.alerts.lock().push(alert.clone());
    }
}

impl RecordingAlerts {
    fn kinds(&self) -> Vec<IncidentKind> {
        self.alerts.lock().iter().map(|a| a.incident_type).collect()
    }
}

// == Crash Recovery ==

#[tokio::test]
async fn test_crash_after_snapshot_replays_wal_suffix() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        for i in 0..10 {
            cache.set(&format!("k{i}"), format!("v{i}"), None).await.unwrap();
        }
        cache.snapshot().await.unwrap().unwrap();
        for i in 10..15 {
            cache.set(&format!("k{i}"), format!("v{i}"), None).await.unwrap();
        }
        cache.delete("k0").await.unwrap();
    }

    let cache = open(dir.path()).await;
    let report = cache.last_recovery().unwrap();
    assert!(report.snapshot_path.is_some());
    assert_eq!(report.replayed_records, 6);
    assert!(!report.lost_data());

    assert_eq!(cache.get("k0").await.unwrap(), Lookup::Miss);
    for i in 1..15 {
        assert_eq!(
            cache.get(&format!("k{i}")).await.unwrap(),
            Lookup::Hit(format!("v{i}").into_bytes())
        );
    }
    assert_eq!(cache.stats().await.total_entries, 14);
}

#[tokio::test]
async fn test_crash_without_snapshot_replays_whole_wal() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        for i in 0..25 {
            cache.set(&format!("k{i}"), "v", None).await.unwrap();
        }
        cache.invalidate_pattern("k1").await.unwrap();
    }

    let cache = open(dir.path()).await;
    let report = cache.last_recovery().unwrap();
    assert!(report.snapshot_path.is_none());
    // k1 and k10..k19
    assert_eq!(cache.stats().await.total_entries, 25 - 11);
    assert!(!cache.get("k15").await.unwrap().is_hit());
    assert!(cache.get("k2").await.unwrap().is_hit());
}

#[tokio::test]
async fn test_recovery_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let keys: Vec<String> = (0..60).map(|i| format!("k{i}")).collect();
    {
        let cache = open_two_shards(dir.path()).await;
        for key in &keys {
            cache.set(key, key.as_str(), None).await.unwrap();
        }
        cache.snapshot().await.unwrap();
        for key in keys.iter().step_by(3) {
            cache.delete(key).await.unwrap();
        }
        cache.rebalance().await.unwrap();
    }

    let first = {
        let cache = open_two_shards(dir.path()).await;
        let values = read_all(&cache, &keys).await;
        let stats = cache.stats().await;
        (values, stats.total_entries, stats.shard_loads)
    };
    let second = {
        let cache = open_two_shards(dir.path()).await;
        let values = read_all(&cache, &keys).await;
        let stats = cache.stats().await;
        (values, stats.total_entries, stats.shard_loads)
    };

    assert_eq!(first.0, second.0);
    assert_eq!(first.1, 40);
    assert_eq!(first.1, second.1);
    let entries = |loads: &[shard_cache::cache::ShardLoad]| {
        loads.iter().map(|l| l.entries).collect::<Vec<_>>()
    };
    assert_eq!(entries(&first.2[..]), entries(&second.2[..]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_snapshot_alongside_rebalance_keeps_every_key() {
    let dir = TempDir::new().unwrap();
    let ring = shard_cache::cache::ConsistentHashRing::new(2, 64);
    let keys: Vec<String> = (0..)
        .map(|i| format!("hot:{i}"))
        .filter(|k| ring.assign(k).unwrap() == 1)
        .take(300)
        .collect();
    {
        let cache = CacheFacade::open(CacheConfig {
            migration_batch_size: 100,
            ..config_two_shards(dir.path())
        })
        .await
        .unwrap();
        for key in &keys {
            cache.set(key, key.as_str(), None).await.unwrap();
        }
        for _ in 0..3 {
            let snapshotter = cache.clone();
            let snapshot = tokio::spawn(async move { snapshotter.snapshot().await });
            cache.rebalance().await.unwrap();
            snapshot.await.unwrap().unwrap();
        }
        assert!(cache.stats().await.migrations > 0);
    }

    let cache = open_two_shards(dir.path()).await;
    for key in &keys {
        assert_eq!(
            cache.get(key).await.unwrap(),
            Lookup::Hit(key.clone().into_bytes()),
            "{key} lost"
        );
    }
    assert_eq!(cache.stats().await.total_entries, keys.len());
}

#[tokio::test]
async fn test_expired_entries_are_not_restored() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        cache
            .set("short", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        cache.set("long", "v", None).await.unwrap();
        cache.snapshot().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(60)).await;

    let cache = open(dir.path()).await;
    assert!(!cache.get("short").await.unwrap().is_hit());
    assert!(cache.get("long").await.unwrap().is_hit());
    assert_eq!(cache.stats().await.total_entries, 1);
}

#[tokio::test]
async fn test_clean_stop_writes_final_snapshot() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        cache.start();
        cache.set("a", "1", None).await.unwrap();
        cache.stop().await.unwrap();
    }
    assert_eq!(list_snapshots(dir.path()).unwrap().len(), 1);

    let cache = open(dir.path()).await;
    let report = cache.last_recovery().unwrap();
    assert_eq!(report.replayed_records, 0);
    assert!(cache.get("a").await.unwrap().is_hit());
}

#[tokio::test]
async fn test_corrupt_snapshot_falls_back_and_alerts() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        for i in 0..10 {
            cache.set(&format!("k{i}"), "v", None).await.unwrap();
        }
        cache.snapshot().await.unwrap();
        for i in 10..15 {
            cache.set(&format!("k{i}"), "v", None).await.unwrap();
        }
    }
    std::fs::write(
        dir.path()
            .join("snapshot-20990101T000000000-00000000000000009999.json"),
        b"{ not json",
    )
    .unwrap();

    let alerts = Arc::new(RecordingAlerts::default());
    let cache = CacheFacade::open_with(
        config(dir.path()),
        Collaborators {
            alerts: alerts.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let report = cache.last_recovery().unwrap();
    assert_eq!(report.corrupt_snapshots.len(), 1);
    assert_eq!(cache.stats().await.total_entries, 15);
    assert!(alerts.kinds().contains(&IncidentKind::SnapshotCorrupt));
    assert_eq!(cache.incident_state(), IncidentState::Normal);
}

#[tokio::test]
async fn test_missing_wal_is_reported() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        cache.set("a", "1", None).await.unwrap();
        cache.snapshot().await.unwrap();
        cache.set("b", "2", None).await.unwrap();
    }
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        if name.starts_with("wal-") {
            std::fs::remove_file(path).unwrap();
        }
    }

    let alerts = Arc::new(RecordingAlerts::default());
    let cache = CacheFacade::open_with(
        config(dir.path()),
        Collaborators {
            alerts: alerts.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(cache.last_recovery().unwrap().lost_data());
    assert!(alerts.kinds().contains(&IncidentKind::WalLoss));
    // What the snapshot held survives
    assert!(cache.get("a").await.unwrap().is_hit());
    assert!(!cache.get("b").await.unwrap().is_hit());
}

#[tokio::test]
async fn test_altered_snapshot_value_is_not_restored() {
    let dir = TempDir::new().unwrap();
    {
        let cache = open(dir.path()).await;
        cache.set("job:42", "RUNNING", None).await.unwrap();
        cache.snapshot().await.unwrap();
        cache.set("job:42", "DONE", None).await.unwrap();
        cache.snapshot().await.unwrap();
    }
    for segment in shard_cache::persistence::list_segments(dir.path()).unwrap() {
        std::fs::remove_file(segment.path).unwrap();
    }
    let newest = list_snapshots(dir.path()).unwrap().remove(0).path;
    let text = std::fs::read_to_string(&newest).unwrap();
    let altered = text.replacen(&STANDARD.encode("DONE"), &STANDARD.encode("GONE"), 1);
    assert_ne!(altered, text);
    std::fs::write(&newest, altered).unwrap();

    let cache = open(dir.path()).await;
    let report = cache.last_recovery().unwrap();
    assert_eq!(report.corrupt_snapshots.len(), 1);
    assert_eq!(report.corrupt_snapshots[0].0, newest);
    // The older, intact snapshot is used instead
    assert_eq!(
        cache.get("job:42").await.unwrap(),
        Lookup::Hit(b"RUNNING".to_vec())
    );
}

// == WAL Failure Handling ==

#[tokio::test]
async fn test_fail_closed_degrades_and_recovers() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(false));
    let alerts = Arc::new(RecordingAlerts::default());
    let cfg = CacheConfig {
        durability: DurabilityMode::FailClosed,
        wal_failure_threshold: 5,
        wal_retry_attempts: 1,
        ..config(dir.path())
    };
    let sink = SwitchableSink {
        inner: SegmentedWal::new(dir.path(), cfg.wal_segment_max_bytes, false),
        failing: failing.clone(),
    };
    let cache = CacheFacade::open_with(
        cfg,
        Collaborators {
            alerts: alerts.clone(),
            wal_sink: Some(Box::new(sink)),
        },
    )
    .await
    .unwrap();

    cache.set("before", "ok", None).await.unwrap();

    // The first five fail at the sink, the rest are refused up front
    failing.store(true, Ordering::SeqCst);
    for i in 0..20 {
        let result = cache.set(&format!("lost:{i}"), "v", None).await;
        assert!(matches!(result, Err(CacheError::WalWriteFailure(_))));
    }
    assert_eq!(cache.incident_state(), IncidentState::Degraded);
    assert!(alerts.kinds().contains(&IncidentKind::WalWriteFailure));

    // Writes are refused up front, reads still work
    assert!(matches!(
        cache.set("refused", "v", None).await,
        Err(CacheError::WalWriteFailure(_))
    ));
    assert!(cache.get("before").await.unwrap().is_hit());
    assert!(!cache.get("lost:0").await.unwrap().is_hit());

    failing.store(false, Ordering::SeqCst);
    assert_eq!(
        cache.recover_from_incident().await.unwrap(),
        IncidentState::Normal
    );
    assert!(alerts.kinds().contains(&IncidentKind::Recovered));

    cache.set("after", "ok", None).await.unwrap();
    assert!(cache.get("before").await.unwrap().is_hit());
    assert!(cache.get("after").await.unwrap().is_hit());
    assert_eq!(cache.stats().await.wal_failures, 5);
}

#[tokio::test]
async fn test_fail_open_keeps_writing() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(true));
    let cfg = CacheConfig {
        durability: DurabilityMode::FailOpen,
        wal_failure_threshold: 100,
        wal_retry_attempts: 0,
        ..config(dir.path())
    };
    let sink = SwitchableSink {
        inner: SegmentedWal::new(dir.path(), cfg.wal_segment_max_bytes, false),
        failing: failing.clone(),
    };
    let cache = CacheFacade::open_with(
        cfg,
        Collaborators {
            wal_sink: Some(Box::new(sink)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    for i in 0..10 {
        cache.set(&format!("k{i}"), "v", None).await.unwrap();
    }
    assert_eq!(cache.incident_state(), IncidentState::Normal);
    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 10);
    assert_eq!(stats.wal_failures, 10);
}

#[tokio::test]
async fn test_interrupted_invalidation_keeps_counts_true() {
    let dir = TempDir::new().unwrap();
    let remaining = Arc::new(AtomicUsize::new(usize::MAX));
    let cfg = CacheConfig {
        shard_count: 1,
        durability: DurabilityMode::FailClosed,
        wal_failure_threshold: 100,
        wal_retry_attempts: 0,
        ..config(dir.path())
    };
    let sink = ExhaustibleSink {
        inner: SegmentedWal::new(dir.path(), cfg.wal_segment_max_bytes, false),
        remaining: remaining.clone(),
    };
    let cache = CacheFacade::open_with(
        cfg,
        Collaborators {
            wal_sink: Some(Box::new(sink)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    for key in &keys {
        cache.set(key, "v", None).await.unwrap();
    }

    remaining.store(3, Ordering::SeqCst);
    assert!(matches!(
        cache.invalidate_pattern("k").await,
        Err(CacheError::WalWriteFailure(_))
    ));

    let live = read_all(&cache, &keys)
        .await
        .iter()
        .filter(|l| l.is_hit())
        .count();
    assert_eq!(live, 7);
    let stats = cache.stats().await;
    assert_eq!(stats.total_entries, 7);
    assert_eq!(stats.shard_loads[0].entries, 7);
    assert_eq!(stats.deletes, 3);

    // The keys that survived are removed once the log accepts writes again
    remaining.store(usize::MAX, Ordering::SeqCst);
    assert_eq!(cache.invalidate_pattern("k").await.unwrap(), 7);
    assert_eq!(cache.stats().await.total_entries, 0);
}

#[tokio::test]
async fn test_rollback_that_keeps_failing_is_fatal() {
    let dir = TempDir::new().unwrap();
    let failing = Arc::new(AtomicBool::new(false));
    let cfg = CacheConfig {
        durability: DurabilityMode::FailClosed,
        wal_failure_threshold: 1,
        wal_retry_attempts: 0,
        max_rollback_attempts: 2,
        ..config(dir.path())
    };
    let sink = SwitchableSink {
        inner: SegmentedWal::new(dir.path(), cfg.wal_segment_max_bytes, false),
        failing: failing.clone(),
    };
    let cache = CacheFacade::open_with(
        cfg,
        Collaborators {
            wal_sink: Some(Box::new(sink)),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    cache.set("a", "1", None).await.unwrap();

    failing.store(true, Ordering::SeqCst);
    assert!(cache.set("b", "2", None).await.is_err());
    assert_eq!(cache.incident_state(), IncidentState::Degraded);

    // Make the restore fail by removing the data directory from under it
    std::fs::remove_dir_all(dir.path()).unwrap();

    let first = cache.recover_from_incident().await.unwrap();
    assert_eq!(first, IncidentState::Degraded);
    assert!(matches!(
        cache.recover_from_incident().await,
        Err(CacheError::Fatal(_))
    ));
    assert_eq!(cache.incident_state(), IncidentState::Failed);
    assert!(matches!(cache.get("a").await, Err(CacheError::Fatal(_))));
}

// == Garbage Collection ==

#[tokio::test]
async fn test_gc_keeps_state_recoverable() {
    let dir = TempDir::new().unwrap();
    let cfg = CacheConfig {
        snapshot_retention: Duration::ZERO,
        wal_retention: Duration::ZERO,
        ..config(dir.path())
    };
    {
        let cache = CacheFacade::open(cfg.clone()).await.unwrap();
        for round in 0..3 {
            for i in 0..10 {
                cache
                    .set(&format!("r{round}:{i}"), "v", None)
                    .await
                    .unwrap();
            }
            cache.snapshot().await.unwrap();
        }
        cache.set("tail", "v", None).await.unwrap();

        let report = cache.collect_garbage().await.unwrap().unwrap();
        assert_eq!(report.snapshots_deleted, 2);
        assert!(report.segments_deleted > 0);
        assert!(report.retained_snapshot.is_some());
    }

    let cache = CacheFacade::open(cfg).await.unwrap();
    assert_eq!(cache.stats().await.total_entries, 31);
    assert!(cache.get("tail").await.unwrap().is_hit());
    assert!(!cache.last_recovery().unwrap().lost_data());
}
