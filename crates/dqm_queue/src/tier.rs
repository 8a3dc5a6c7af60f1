//! Tier queues: one bounded FIFO and worker set per priority class.

use crate::cancel::CancellationToken;
use crate::error::{ShutdownTimeout, SubmitError};
use crate::job::{Job, JobHandle};
use crate::metrics::{TierMetrics, TierMetricsSnapshot};
use dqm_db::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Priority/latency class of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Lead,
    Slow,
    Medium,
    Fast,
    Cache,
}

impl TierKind {
    /// Optional tiers in start order.
    pub const OPTIONAL: [TierKind; 4] = [
        TierKind::Slow,
        TierKind::Medium,
        TierKind::Fast,
        TierKind::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierKind::Lead => "lead",
            TierKind::Slow => "slow",
            TierKind::Medium => "medium",
            TierKind::Fast => "fast",
            TierKind::Cache => "cache",
        }
    }

    /// Letter used in queue labels.
    pub fn tag(&self) -> char {
        match self {
            TierKind::Lead => 'L',
            TierKind::Slow => 'S',
            TierKind::Medium => 'M',
            TierKind::Fast => 'F',
            TierKind::Cache => 'C',
        }
    }

    pub fn is_lead(&self) -> bool {
        matches!(self, TierKind::Lead)
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lead" | "l" => Ok(TierKind::Lead),
            "slow" | "s" => Ok(TierKind::Slow),
            "medium" | "m" => Ok(TierKind::Medium),
            "fast" | "f" => Ok(TierKind::Fast),
            "cache" | "c" => Ok(TierKind::Cache),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

/// Tier lifecycle: `Created → Starting → Running → Draining → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierState {
    Created,
    Starting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for TierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TierState::Created => "created",
            TierState::Starting => "starting",
            TierState::Running => "running",
            TierState::Draining => "draining",
            TierState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// `DQM-<name>-<NN>-<tags>`. The Lead's own `L` tag is implied and dropped.
pub fn queue_label(connection: &str, number: usize, tags: &str) -> String {
    let tags: String = if number == 0 {
        tags.chars().filter(|c| *c != 'L').collect()
    } else {
        tags.to_string()
    };
    format!("DQM-{}-{:02}-{}", connection, number, tags)
}

/// State shared between a tier and its workers.
pub(crate) struct TierShared {
    pub(crate) connection: String,
    pub(crate) kind: TierKind,
    pub(crate) metrics: TierMetrics,
    pub(crate) cancel: CancellationToken,
    state: Mutex<TierState>,
    sender: mpsc::Sender<Job>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Job>>,
}

/// Why a retry could not go back on the queue.
pub(crate) enum RequeueRefused {
    Full(Job),
    Closed(Job),
}

impl TierShared {
    pub(crate) fn state(&self) -> TierState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: TierState) {
        *lock(&self.state) = state;
    }

    /// Next queued job. Workers take turns holding the receiver.
    pub(crate) async fn next_job(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }

    /// Put a retried job back on this tier without waiting for space.
    pub(crate) fn requeue(&self, job: Job) -> Result<(), RequeueRefused> {
        if !matches!(self.state(), TierState::Starting | TierState::Running) {
            return Err(RequeueRefused::Closed(job));
        }
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(RequeueRefused::Full(job)),
            Err(TrySendError::Closed(job)) => Err(RequeueRefused::Closed(job)),
        }
    }

    fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// Outcome of stopping one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierShutdown {
    pub tier: TierKind,
    pub clean: bool,
    /// Jobs still queued when the tier stopped; each got `Cancelled`.
    pub cancelled_jobs: usize,
    pub timeout: Option<ShutdownTimeout>,
}

/// Serializable view of one tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStatus {
    pub tier: TierKind,
    pub state: TierState,
    pub workers: usize,
    pub queued: usize,
    pub labels: Vec<String>,
    pub metrics: TierMetricsSnapshot,
}

/// A tier queue with its fixed-size worker pool.
pub struct Tier {
    shared: Arc<TierShared>,
    worker_count: usize,
    labels: Mutex<Vec<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Tier {
    pub(crate) fn new(connection: &str, kind: TierKind, worker_count: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            shared: Arc::new(TierShared {
                connection: connection.to_string(),
                kind,
                metrics: TierMetrics::new(),
                cancel: CancellationToken::new(),
                state: Mutex::new(TierState::Created),
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
            }),
            worker_count,
            labels: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> TierKind {
        self.shared.kind
    }

    pub fn state(&self) -> TierState {
        self.shared.state()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub(crate) fn shared(&self) -> Arc<TierShared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn set_state(&self, state: TierState) {
        self.shared.set_state(state);
    }

    /// Record spawned workers. Called once at tier start.
    pub(crate) fn attach_workers(&self, labels: Vec<String>, handles: Vec<JoinHandle<()>>) {
        *lock(&self.labels) = labels;
        lock(&self.workers).extend(handles);
    }

    /// Public submission path: only legal while `Running`.
    pub async fn submit(&self, operation: Operation, timeout: Duration) -> Result<JobHandle, SubmitError> {
        self.enqueue(operation, timeout, false).await
    }

    /// Lead bootstrap path: also legal while the Lead is `Starting`.
    pub(crate) async fn submit_internal(
        &self,
        operation: Operation,
        timeout: Duration,
    ) -> Result<JobHandle, SubmitError> {
        self.enqueue(operation, timeout, self.kind().is_lead()).await
    }

    async fn enqueue(
        &self,
        operation: Operation,
        timeout: Duration,
        allow_starting: bool,
    ) -> Result<JobHandle, SubmitError> {
        let state = self.state();
        let accepting = state == TierState::Running || (allow_starting && state == TierState::Starting);
        if !accepting {
            self.shared.metrics.inc_rejected();
            return Err(SubmitError::Rejected {
                connection: self.shared.connection.clone(),
                tier: self.kind(),
                state,
            });
        }

        let (job, handle) = Job::new(self.kind(), operation);
        match self.shared.sender.send_timeout(job, timeout).await {
            Ok(()) => {
                self.shared.metrics.inc_submitted();
                Ok(handle)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.shared.metrics.inc_rejected();
                Err(SubmitError::QueueFull {
                    connection: self.shared.connection.clone(),
                    tier: self.kind(),
                })
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.shared.metrics.inc_rejected();
                Err(SubmitError::Rejected {
                    connection: self.shared.connection.clone(),
                    tier: self.kind(),
                    state: self.state(),
                })
            }
        }
    }

    /// Stop accepting work and signal workers to exit after their current job.
    pub(crate) fn begin_shutdown(&self) {
        match self.state() {
            TierState::Stopped | TierState::Draining => {}
            _ => self.set_state(TierState::Draining),
        }
        self.shared.cancel.cancel();
    }

    /// Join workers until `deadline`, abort stragglers, cancel leftover jobs.
    pub(crate) async fn finish_shutdown(&self, deadline: Instant, drain_timeout: Duration) -> TierShutdown {
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();

        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(
                connection = %self.shared.connection,
                tier = %self.kind(),
                aborted,
                "Tier did not drain in time, aborted workers"
            );
        }

        let mut cancelled_jobs = 0;
        {
            let mut receiver = self.shared.receiver.lock().await;
            // Closing wakes submitters still waiting for space (they get
            // `Rejected`); `recv` then yields every job already admitted and
            // returns None once no send is in flight.
            receiver.close();
            while let Some(job) = receiver.recv().await {
                job.complete(Err(crate::error::JobError::Cancelled));
                cancelled_jobs += 1;
            }
        }
        self.shared.metrics.add_cancelled(cancelled_jobs as u64);
        self.set_state(TierState::Stopped);

        debug!(
            connection = %self.shared.connection,
            tier = %self.kind(),
            cancelled_jobs,
            "Tier stopped"
        );

        TierShutdown {
            tier: self.kind(),
            clean: aborted == 0,
            cancelled_jobs,
            timeout: (aborted > 0).then(|| ShutdownTimeout {
                tier: self.kind(),
                timeout_ms: drain_timeout.as_millis() as u64,
                aborted_workers: aborted,
            }),
        }
    }

    pub fn status(&self) -> TierStatus {
        TierStatus {
            tier: self.kind(),
            state: self.state(),
            workers: self.worker_count,
            queued: self.shared.queued(),
            labels: lock(&self.labels).clone(),
            metrics: self.shared.metrics.snapshot(),
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
