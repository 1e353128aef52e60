//! Configuration Module
//!
//! Handles loading, defaulting and validating cache configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

// == Durability Mode ==
/// What a mutation does when its WAL append fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Log the failure, report it, apply the mutation anyway
    FailOpen,
    /// Refuse the mutation with `WalWriteFailure`
    FailClosed,
}

impl FromStr for DurabilityMode {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail-open" | "fail_open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown durability mode '{other}'"
            ))),
        }
    }
}

// == Validation Profile ==
/// Strictness of key/value validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationProfile {
    /// Generous limits, any non-control character in keys
    Relaxed,
    /// Tight limits, restricted key character set
    Strict,
}

impl FromStr for ValidationProfile {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relaxed" | "development" | "dev" => Ok(Self::Relaxed),
            "strict" | "production" | "prod" => Ok(Self::Strict),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown validation profile '{other}'"
            ))),
        }
    }
}

// == Load Metric ==
/// Load measure the balancer compares across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMetric {
    /// Operations served since the previous balance cycle
    Operations,
    /// Estimated bytes held
    Bytes,
}

impl FromStr for LoadMetric {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "operations" | "ops" => Ok(Self::Operations),
            "bytes" => Ok(Self::Bytes),
            other => Err(CacheError::InvalidConfig(format!(
                "unknown load metric '{other}'"
            ))),
        }
    }
}

/// Cache configuration.
///
/// Built once at startup; every option the cache recognises is listed here.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    // -- topology --
    /// Number of shards
    pub shard_count: usize,
    /// Virtual nodes per shard on the hash ring
    pub virtual_nodes: usize,

    // -- entries --
    /// TTL applied when a set has none
    pub default_ttl: Duration,
    /// Entry bound per shard
    pub max_items_per_shard: usize,
    /// Estimated byte bound per shard
    pub max_bytes_per_shard: usize,
    /// Key/value validation strictness
    pub validation: ValidationProfile,

    // -- locking --
    /// Default budget for get/set/delete
    pub op_timeout: Duration,
    /// Key-lock wait after which a deadlock is suspected
    pub deadlock_timeout: Duration,
    /// Idle time after which an unused key lock is reclaimed
    pub lock_idle_reclaim: Duration,
    /// How often the lock reaper runs
    pub lock_reap_interval: Duration,
    /// Lock table size after reaping that is reported as a leak
    pub lock_leak_threshold: usize,

    // -- eviction --
    /// Shortest sweep interval
    pub sweep_interval_floor: Duration,
    /// Longest sweep interval
    pub sweep_interval_ceiling: Duration,
    /// Inserts per second above which sweeps speed up
    pub insert_rate_threshold: f64,
    /// Average operation latency above which sweeps speed up
    pub latency_threshold: Duration,

    // -- balancing --
    /// Hot/cold load ratio that triggers migration
    pub imbalance_threshold: f64,
    /// How often the balancer runs
    pub balance_interval: Duration,
    /// Hot-shard load below which imbalance is ignored
    pub balance_min_load: u64,
    /// Keys migrated per balance cycle at most
    pub migration_batch_size: usize,
    /// What "load" means
    pub load_metric: LoadMetric,

    // -- persistence --
    /// WAL and snapshot directory; `None` keeps the cache memory-only
    pub data_dir: Option<PathBuf>,
    /// WAL failure policy
    pub durability: DurabilityMode,
    /// Extra attempts for a failed WAL append
    pub wal_retry_attempts: u32,
    /// Active segment size that forces rotation
    pub wal_segment_max_bytes: u64,
    /// fsync after every append
    pub sync_on_append: bool,
    /// Periodic snapshot interval
    pub snapshot_interval: Duration,
    /// Take a snapshot during `stop`
    pub snapshot_on_shutdown: bool,
    /// Age after which superseded snapshots are deleted
    pub snapshot_retention: Duration,
    /// Age after which replayed WAL segments are deleted
    pub wal_retention: Duration,
    /// How often the garbage collector runs
    pub gc_interval: Duration,

    // -- incidents --
    /// Consecutive WAL failures that degrade the cache
    pub wal_failure_threshold: u32,
    /// Estimated memory above which the cache degrades
    pub memory_hard_limit_bytes: usize,
    /// Fraction of the hard limit to shed down to
    pub memory_low_watermark_ratio: f64,
    /// Consecutive failed rollbacks before the cache is declared failed
    pub max_rollback_attempts: u32,
    /// Time budget for one rollback attempt
    pub rollback_timeout: Duration,
    /// How often the incident monitor runs
    pub incident_check_interval: Duration,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// Every variable is prefixed with `CACHE_`; durations are given in
    /// seconds unless the name ends in `_MS`. Unset or unparsable values fall
    /// back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            shard_count: env_parse("CACHE_SHARD_COUNT").unwrap_or(d.shard_count),
            virtual_nodes: env_parse("CACHE_VIRTUAL_NODES").unwrap_or(d.virtual_nodes),
            default_ttl: env_secs("CACHE_DEFAULT_TTL").unwrap_or(d.default_ttl),
            max_items_per_shard: env_parse("CACHE_MAX_ITEMS_PER_SHARD")
                .unwrap_or(d.max_items_per_shard),
            max_bytes_per_shard: env_parse("CACHE_MAX_BYTES_PER_SHARD")
                .unwrap_or(d.max_bytes_per_shard),
            validation: env_parse("CACHE_VALIDATION").unwrap_or(d.validation),
            op_timeout: env_millis("CACHE_OP_TIMEOUT_MS").unwrap_or(d.op_timeout),
            deadlock_timeout: env_millis("CACHE_DEADLOCK_TIMEOUT_MS")
                .unwrap_or(d.deadlock_timeout),
            lock_idle_reclaim: env_secs("CACHE_LOCK_IDLE_RECLAIM")
                .unwrap_or(d.lock_idle_reclaim),
            lock_reap_interval: env_secs("CACHE_LOCK_REAP_INTERVAL")
                .unwrap_or(d.lock_reap_interval),
            lock_leak_threshold: env_parse("CACHE_LOCK_LEAK_THRESHOLD")
                .unwrap_or(d.lock_leak_threshold),
            sweep_interval_floor: env_millis("CACHE_SWEEP_FLOOR_MS")
                .unwrap_or(d.sweep_interval_floor),
            sweep_interval_ceiling: env_millis("CACHE_SWEEP_CEILING_MS")
                .unwrap_or(d.sweep_interval_ceiling),
            insert_rate_threshold: env_parse("CACHE_INSERT_RATE_THRESHOLD")
                .unwrap_or(d.insert_rate_threshold),
            latency_threshold: env_millis("CACHE_LATENCY_THRESHOLD_MS")
                .unwrap_or(d.latency_threshold),
            imbalance_threshold: env_parse("CACHE_IMBALANCE_THRESHOLD")
                .unwrap_or(d.imbalance_threshold),
            balance_interval: env_secs("CACHE_BALANCE_INTERVAL").unwrap_or(d.balance_interval),
            balance_min_load: env_parse("CACHE_BALANCE_MIN_LOAD").unwrap_or(d.balance_min_load),
            migration_batch_size: env_parse("CACHE_MIGRATION_BATCH_SIZE")
                .unwrap_or(d.migration_batch_size),
            load_metric: env_parse("CACHE_LOAD_METRIC").unwrap_or(d.load_metric),
            data_dir: env::var("CACHE_DATA_DIR").ok().map(PathBuf::from).or(d.data_dir),
            durability: env_parse("CACHE_DURABILITY").unwrap_or(d.durability),
            wal_retry_attempts: env_parse("CACHE_WAL_RETRY_ATTEMPTS")
                .unwrap_or(d.wal_retry_attempts),
            wal_segment_max_bytes: env_parse("CACHE_WAL_SEGMENT_MAX_BYTES")
                .unwrap_or(d.wal_segment_max_bytes),
            sync_on_append: env_parse("CACHE_SYNC_ON_APPEND").unwrap_or(d.sync_on_append),
            snapshot_interval: env_secs("CACHE_SNAPSHOT_INTERVAL")
                .unwrap_or(d.snapshot_interval),
            snapshot_on_shutdown: env_parse("CACHE_SNAPSHOT_ON_SHUTDOWN")
                .unwrap_or(d.snapshot_on_shutdown),
            snapshot_retention: env_secs("CACHE_SNAPSHOT_RETENTION")
                .unwrap_or(d.snapshot_retention),
            wal_retention: env_secs("CACHE_WAL_RETENTION").unwrap_or(d.wal_retention),
            gc_interval: env_secs("CACHE_GC_INTERVAL").unwrap_or(d.gc_interval),
            wal_failure_threshold: env_parse("CACHE_WAL_FAILURE_THRESHOLD")
                .unwrap_or(d.wal_failure_threshold),
            memory_hard_limit_bytes: env_parse("CACHE_MEMORY_HARD_LIMIT_BYTES")
                .unwrap_or(d.memory_hard_limit_bytes),
            memory_low_watermark_ratio: env_parse("CACHE_MEMORY_LOW_WATERMARK")
                .unwrap_or(d.memory_low_watermark_ratio),
            max_rollback_attempts: env_parse("CACHE_MAX_ROLLBACK_ATTEMPTS")
                .unwrap_or(d.max_rollback_attempts),
            rollback_timeout: env_secs("CACHE_ROLLBACK_TIMEOUT").unwrap_or(d.rollback_timeout),
            incident_check_interval: env_millis("CACHE_INCIDENT_CHECK_MS")
                .unwrap_or(d.incident_check_interval),
        }
    }

    /// Rejects configurations the cache cannot run with.
    ///
    /// A shard count of zero is reported as `NoShardsAvailable`.
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(CacheError::NoShardsAvailable);
        }
        if self.virtual_nodes == 0 {
            return Err(invalid("virtual_nodes must be greater than 0"));
        }
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl must be greater than 0"));
        }
        if self.max_items_per_shard == 0 || self.max_bytes_per_shard == 0 {
            return Err(invalid("per-shard bounds must be greater than 0"));
        }
        if self.sweep_interval_floor.is_zero()
            || self.sweep_interval_floor > self.sweep_interval_ceiling
        {
            return Err(invalid(
                "sweep interval floor must be non-zero and not exceed the ceiling",
            ));
        }
        if self.imbalance_threshold <= 1.0 {
            return Err(invalid("imbalance_threshold must be greater than 1.0"));
        }
        if !(0.0..1.0).contains(&self.memory_low_watermark_ratio) {
            return Err(invalid("memory_low_watermark_ratio must be in [0, 1)"));
        }
        if self.wal_failure_threshold == 0 || self.max_rollback_attempts == 0 {
            return Err(invalid(
                "wal_failure_threshold and max_rollback_attempts must be greater than 0",
            ));
        }
        if self.op_timeout.is_zero() {
            return Err(invalid("op_timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            virtual_nodes: 160,
            default_ttl: Duration::from_secs(300),
            max_items_per_shard: 10_000,
            max_bytes_per_shard: 64 * 1024 * 1024,
            validation: ValidationProfile::Strict,
            op_timeout: Duration::from_secs(5),
            deadlock_timeout: Duration::from_secs(2),
            lock_idle_reclaim: Duration::from_secs(60),
            lock_reap_interval: Duration::from_secs(30),
            lock_leak_threshold: 100_000,
            sweep_interval_floor: Duration::from_millis(100),
            sweep_interval_ceiling: Duration::from_secs(10),
            insert_rate_threshold: 1_000.0,
            latency_threshold: Duration::from_millis(5),
            imbalance_threshold: 2.0,
            balance_interval: Duration::from_secs(30),
            balance_min_load: 100,
            migration_batch_size: 64,
            load_metric: LoadMetric::Operations,
            data_dir: None,
            durability: DurabilityMode::FailOpen,
            wal_retry_attempts: 2,
            wal_segment_max_bytes: 64 * 1024 * 1024,
            sync_on_append: false,
            snapshot_interval: Duration::from_secs(300),
            snapshot_on_shutdown: true,
            snapshot_retention: Duration::from_secs(24 * 3600),
            wal_retention: Duration::from_secs(7 * 24 * 3600),
            gc_interval: Duration::from_secs(24 * 3600),
            wal_failure_threshold: 5,
            memory_hard_limit_bytes: 512 * 1024 * 1024,
            memory_low_watermark_ratio: 0.8,
            max_rollback_attempts: 3,
            rollback_timeout: Duration::from_secs(30),
            incident_check_interval: Duration::from_millis(500),
        }
    }
}

fn invalid(msg: &str) -> CacheError {
    CacheError::InvalidConfig(msg.to_string())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = CacheConfig::default();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.durability, DurabilityMode::FailOpen);
        assert_eq!(config.snapshot_retention, Duration::from_secs(86_400));
        assert_eq!(config.wal_retention, Duration::from_secs(604_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_defaults() {
        env::remove_var("CACHE_SHARD_COUNT");
        env::remove_var("CACHE_DEFAULT_TTL");
        env::remove_var("CACHE_DURABILITY");

        let config = CacheConfig::from_env();
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.durability, DurabilityMode::FailOpen);
    }

    #[test]
    fn test_zero_shards_rejected() {
        let config = CacheConfig {
            shard_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::NoShardsAvailable)
        ));
    }

    #[test]
    fn test_inverted_sweep_bounds_rejected() {
        let config = CacheConfig {
            sweep_interval_floor: Duration::from_secs(10),
            sweep_interval_ceiling: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(
            "fail-closed".parse::<DurabilityMode>().unwrap(),
            DurabilityMode::FailClosed
        );
        assert_eq!(
            "production".parse::<ValidationProfile>().unwrap(),
            ValidationProfile::Strict
        );
        assert_eq!("bytes".parse::<LoadMetric>().unwrap(), LoadMetric::Bytes);
        assert!("sometimes".parse::<DurabilityMode>().is_err());
    }
}
