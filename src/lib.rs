//! Shard Cache - a sharded in-memory key-value cache
//!
//! Keys are spread over shards by a consistent-hash ring. Entries carry a
//! TTL and each shard is bounded by item count and estimated bytes with LRU
//! eviction. Mutations can be logged to a write-ahead log with periodic
//! snapshots, and an incident responder gates writes and drives rollback
//! when the WAL, memory, or locking misbehave.

pub mod balancer;
pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod incident;
pub mod persistence;
pub mod tasks;

pub use cache::{CacheFacade, CacheStats, Collaborators, Lookup};
pub use config::{CacheConfig, DurabilityMode, LoadMetric, ValidationProfile};
pub use error::{CacheError, Result};
pub use incident::{AlertSink, IncidentAlert, IncidentKind, IncidentState};
pub use persistence::WalSink;
