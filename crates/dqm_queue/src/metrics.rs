//! Per-tier job counters.
//!
//! Lock-free atomics, one set per tier. Each tier owns its own counters so
//! instances never share state.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

const NEVER_USED: i64 = i64::MIN;

#[derive(Debug)]
pub struct TierMetrics {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub rejected: AtomicU64,
    pub cancelled: AtomicU64,
    pub timeouts: AtomicU64,
    /// Engine executions timed into `execution_micros`, retries included.
    pub executions: AtomicU64,
    pub execution_micros: AtomicU64,
    /// Unix milliseconds of the last execution, `NEVER_USED` before one.
    pub last_used_ms: AtomicI64,
}

impl Default for TierMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TierMetrics {
    pub const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            execution_micros: AtomicU64::new(0),
            last_used_ms: AtomicI64::new(NEVER_USED),
        }
    }

    #[inline]
    pub fn inc_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_cancelled(&self, count: u64) {
        self.cancelled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one engine execution, successful or not.
    pub fn record_execution(&self, elapsed: Duration, at: DateTime<Utc>) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.execution_micros
            .fetch_add(elapsed.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
        self.last_used_ms.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TierMetricsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let micros = self.execution_micros.load(Ordering::Relaxed);
        let avg_execution_ms = if executions == 0 {
            0.0
        } else {
            micros as f64 / executions as f64 / 1000.0
        };
        let last_used = match self.last_used_ms.load(Ordering::Relaxed) {
            NEVER_USED => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        };
        TierMetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            avg_execution_ms,
            last_used,
        }
    }
}

/// Point-in-time copy of a tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TierMetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub rejected: u64,
    pub cancelled: u64,
    /// Executions that hit `query_timeout_ms`.
    pub timeouts: u64,
    pub avg_execution_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}
