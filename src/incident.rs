//! Incident Responder
//!
//! Tracks critical failure classes and drives the
//! `Normal -> Degraded -> RollingBack -> Normal` state machine. While an
//! incident is open, mutations fail fast; reads keep working until the
//! responder gives up and moves to `Failed`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};

/// Alerts kept for `IncidentResponder::history`.
const HISTORY_LIMIT: usize = 64;

// == Incident State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Normal,
    Degraded,
    RollingBack,
    /// Rollback failed too many times; terminal until restart
    Failed,
}

impl fmt::Display for IncidentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IncidentState::Normal => "normal",
            IncidentState::Degraded => "degraded",
            IncidentState::RollingBack => "rolling_back",
            IncidentState::Failed => "failed",
        };
        f.write_str(name)
    }
}

// == Incident Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    WalWriteFailure,
    MemoryOverload,
    DeadlockSuspected,
    /// WAL segments missing or a sequence gap found during recovery
    WalLoss,
    SnapshotCorrupt,
    LockLeak,
    Recovered,
    RollbackFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

// == Incident Alert ==
/// Payload handed to the external alerting collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentAlert {
    pub incident_type: IncidentKind,
    pub severity: Severity,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

// == Alert Sink ==
/// Outbound alert channel.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &IncidentAlert);
}

/// Default sink: writes the alert as JSON through tracing.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &IncidentAlert) {
        let payload = serde_json::to_string(alert).unwrap_or_else(|_| alert.details.clone());
        match alert.severity {
            Severity::Critical => error!(alert = %payload, "cache incident"),
            Severity::Warning => warn!(alert = %payload, "cache incident"),
            Severity::Info => info!(alert = %payload, "cache incident"),
        }
    }
}

#[derive(Debug)]
struct ResponderInner {
    state: IncidentState,
    active: Option<IncidentKind>,
    cause: String,
    failed_rollbacks: u32,
    history: VecDeque<IncidentAlert>,
}

// == Incident Responder ==
pub struct IncidentResponder {
    inner: Mutex<ResponderInner>,
    wal_failure_streak: AtomicU32,
    wal_failure_threshold: u32,
    max_rollback_attempts: u32,
    sink: Arc<dyn AlertSink>,
}

impl IncidentResponder {
    pub fn new(config: &CacheConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            inner: Mutex::new(ResponderInner {
                state: IncidentState::Normal,
                active: None,
                cause: String::new(),
                failed_rollbacks: 0,
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            wal_failure_streak: AtomicU32::new(0),
            wal_failure_threshold: config.wal_failure_threshold,
            max_rollback_attempts: config.max_rollback_attempts,
            sink,
        }
    }

    pub fn state(&self) -> IncidentState {
        self.inner.lock().state
    }

    /// The incident currently being handled, if any.
    pub fn active_incident(&self) -> Option<IncidentKind> {
        self.inner.lock().active
    }

    /// Recent alerts, oldest first.
    pub fn history(&self) -> Vec<IncidentAlert> {
        self.inner.lock().history.iter().cloned().collect()
    }

    // == Gates ==
    /// Fails fast for mutations while an incident is open.
    pub fn check_mutation(&self) -> Result<()> {
        let inner = self.inner.lock();
        match inner.state {
            IncidentState::Normal => Ok(()),
            IncidentState::Failed => Err(CacheError::Fatal(inner.cause.clone())),
            IncidentState::Degraded | IncidentState::RollingBack => match inner.active {
                Some(IncidentKind::WalWriteFailure) => {
                    Err(CacheError::WalWriteFailure(inner.cause.clone()))
                }
                _ => Err(CacheError::CircuitOpen(inner.cause.clone())),
            },
        }
    }

    /// Fails only once the cache has been declared failed.
    pub fn check_available(&self) -> Result<()> {
        let inner = self.inner.lock();
        match inner.state {
            IncidentState::Failed => Err(CacheError::Fatal(inner.cause.clone())),
            _ => Ok(()),
        }
    }

    // == Reports ==
    pub fn report_wal_failure(&self, err: &CacheError) {
        let streak = self.wal_failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(streak, error = %err, "WAL append failed");
        if streak >= self.wal_failure_threshold {
            self.enter_degraded(
                IncidentKind::WalWriteFailure,
                format!("{streak} consecutive WAL failures, last: {err}"),
            );
        }
    }

    pub fn report_wal_success(&self) {
        self.wal_failure_streak.store(0, Ordering::Relaxed);
    }

    pub fn wal_failure_streak(&self) -> u32 {
        self.wal_failure_streak.load(Ordering::Relaxed)
    }

    /// Degrades when estimated memory is above the hard limit.
    pub fn report_memory(&self, bytes: usize, limit: usize) {
        if bytes > limit {
            self.enter_degraded(
                IncidentKind::MemoryOverload,
                format!("estimated memory {bytes} bytes exceeds hard limit {limit}"),
            );
        }
    }

    pub fn report_deadlock(&self, key: &str, waited: Duration) {
        let err = CacheError::DeadlockSuspected {
            key: key.to_string(),
            waited,
        };
        self.enter_degraded(IncidentKind::DeadlockSuspected, err.to_string());
    }

    /// Alerts on a condition that was handled without leaving `Normal`.
    pub fn report_recoverable(&self, kind: IncidentKind, details: String) {
        self.emit(kind, Severity::Warning, details);
    }

    // == Rollback ==
    /// Moves `Degraded` to `RollingBack` and returns the incident to handle.
    pub fn begin_rollback(&self) -> Option<IncidentKind> {
        let mut inner = self.inner.lock();
        if inner.state != IncidentState::Degraded {
            return None;
        }
        inner.state = IncidentState::RollingBack;
        inner.active
    }

    /// Records the rollback outcome and returns the resulting state.
    pub fn finish_rollback(&self, outcome: std::result::Result<(), String>) -> IncidentState {
        let (state, alert) = {
            let mut inner = self.inner.lock();
            if inner.state != IncidentState::RollingBack {
                return inner.state;
            }
            match outcome {
                Ok(()) => {
                    let details = format!(
                        "recovered from {:?}: {}",
                        inner.active.unwrap_or(IncidentKind::Recovered),
                        inner.cause
                    );
                    inner.state = IncidentState::Normal;
                    inner.active = None;
                    inner.cause.clear();
                    inner.failed_rollbacks = 0;
                    self.wal_failure_streak.store(0, Ordering::Relaxed);
                    (IncidentState::Normal, (IncidentKind::Recovered, Severity::Info, details))
                }
                Err(reason) => {
                    inner.failed_rollbacks += 1;
                    if inner.failed_rollbacks >= self.max_rollback_attempts {
                        inner.state = IncidentState::Failed;
                        inner.cause = format!(
                            "rollback failed {} times, last: {reason}",
                            inner.failed_rollbacks
                        );
                        let details = inner.cause.clone();
                        (
                            IncidentState::Failed,
                            (IncidentKind::RollbackFailed, Severity::Critical, details),
                        )
                    } else {
                        inner.state = IncidentState::Degraded;
                        let details = format!(
                            "rollback attempt {} failed: {reason}",
                            inner.failed_rollbacks
                        );
                        (
                            IncidentState::Degraded,
                            (IncidentKind::RollbackFailed, Severity::Warning, details),
                        )
                    }
                }
            }
        };
        let (kind, severity, details) = alert;
        self.emit(kind, severity, details);
        state
    }

    fn enter_degraded(&self, kind: IncidentKind, details: String) {
        {
            let mut inner = self.inner.lock();
            if inner.state != IncidentState::Normal {
                return;
            }
            inner.state = IncidentState::Degraded;
            inner.active = Some(kind);
            inner.cause = details.clone();
        }
        self.emit(kind, Severity::Critical, details);
    }

    fn emit(&self, kind: IncidentKind, severity: Severity, details: String) {
        let alert = IncidentAlert {
            incident_type: kind,
            severity,
            details,
            timestamp: Utc::now(),
        };
        {
            let mut inner = self.inner.lock();
            if inner.history.len() == HISTORY_LIMIT {
                inner.history.pop_front();
            }
            inner.history.push_back(alert.clone());
        }
        self.sink.notify(&alert);
    }
}

impl fmt::Debug for IncidentResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncidentResponder")
            .field("state", &self.state())
            .field("wal_failure_streak", &self.wal_failure_streak())
            .finish()
    }
}
