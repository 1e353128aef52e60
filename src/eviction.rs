//! Adaptive Eviction
//!
//! Decides how often expired entries are swept. Heavy insert traffic or
//! slow operations shorten the interval; a quiet cache lets it grow back
//! toward the ceiling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::CacheShard;
use crate::config::CacheConfig;

/// Interval the controller starts from, before clamping.
const INITIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Inputs and bounds for one interval decision.
#[derive(Debug, Clone, Copy)]
pub struct AdjustParams {
    pub floor: Duration,
    pub ceiling: Duration,
    pub insert_rate_threshold: f64,
    pub latency_threshold: Duration,
}

// == Next Interval ==
/// Pure interval policy: halve under pressure, grow by half when calm,
/// otherwise hold. The result always stays within `[floor, ceiling]`.
pub fn next_interval(
    current: Duration,
    insert_rate: f64,
    latency: Duration,
    params: &AdjustParams,
) -> Duration {
    let pressured =
        insert_rate > params.insert_rate_threshold || latency > params.latency_threshold;
    let calm = insert_rate < params.insert_rate_threshold / 4.0
        && latency < params.latency_threshold / 2;

    let next = if pressured {
        current / 2
    } else if calm {
        current.mul_f64(1.5)
    } else {
        current
    };
    next.clamp(params.floor, params.ceiling)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
    pub shards: usize,
    pub elapsed: Duration,
}

// == Eviction Controller ==
#[derive(Debug)]
pub struct EvictionController {
    params: AdjustParams,
    interval_ms: AtomicU64,
    /// Inserts since the last adjustment
    inserts: AtomicU64,
    /// Exponentially weighted operation latency, microseconds
    latency_us: AtomicU64,
    last_adjust: Mutex<Instant>,
}

impl EvictionController {
    pub fn new(config: &CacheConfig) -> Self {
        let params = AdjustParams {
            floor: config.sweep_interval_floor,
            ceiling: config.sweep_interval_ceiling,
            insert_rate_threshold: config.insert_rate_threshold,
            latency_threshold: config.latency_threshold,
        };
        let initial = INITIAL_INTERVAL.clamp(params.floor, params.ceiling);
        Self {
            params,
            interval_ms: AtomicU64::new(initial.as_millis() as u64),
            inserts: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            last_adjust: Mutex::new(Instant::now()),
        }
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        // Lost updates under contention only blur the average
        let old = self.latency_us.load(Ordering::Relaxed);
        let next = if old == 0 { sample } else { (old * 7 + sample) / 8 };
        self.latency_us.store(next, Ordering::Relaxed);
    }

    pub fn average_latency(&self) -> Duration {
        Duration::from_micros(self.latency_us.load(Ordering::Relaxed))
    }

    pub fn current_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// Recomputes the interval from traffic since the previous call.
    pub fn adjust(&self) -> Duration {
        let elapsed = {
            let mut last = self.last_adjust.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let inserts = self.inserts.swap(0, Ordering::Relaxed);
        let rate = inserts as f64 / elapsed.as_secs_f64().max(1e-3);

        let current = self.current_interval();
        let next = next_interval(current, rate, self.average_latency(), &self.params);
        if next != current {
            debug!(
                from_ms = current.as_millis() as u64,
                to_ms = next.as_millis() as u64,
                insert_rate = rate,
                "sweep interval adjusted"
            );
        }
        self.interval_ms.store(next.as_millis() as u64, Ordering::Relaxed);
        next
    }

    // == Sweep ==
    /// Sweeps every shard concurrently: expired entries first, then bounds.
    pub async fn sweep(&self, shards: &[Arc<CacheShard>]) -> SweepReport {
        let started = Instant::now();
        let mut set = JoinSet::new();
        for shard in shards {
            let shard = shard.clone();
            set.spawn(async move {
                let expired = shard.sweep_expired().await;
                let (bound_expired, evicted) = shard.enforce_bounds().await;
                (expired + bound_expired, evicted)
            });
        }

        let mut report = SweepReport {
            shards: shards.len(),
            ..Default::default()
        };
        while let Some(result) = set.join_next().await {
            match result {
                Ok((expired, evicted)) => {
                    report.expired += expired;
                    report.evicted += evicted;
                }
                Err(e) => warn!(error = %e, "shard sweep task failed"),
            }
        }
        report.elapsed = started.elapsed();
        report
    }
}
