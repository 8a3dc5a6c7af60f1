//! Jobs and the submitter-side handle.

use crate::error::JobError;
use crate::tier::TierKind;
use chrono::{DateTime, Utc};
use dqm_db::{Operation, OperationResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub type JobResult = Result<OperationResult, JobError>;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// One queued operation. Bound to a single tier for its whole lifetime.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub tier: TierKind,
    pub operation: Operation,
    pub submitted_at: DateTime<Utc>,
    /// Failed Transient attempts so far.
    pub attempts: u32,
    reply: oneshot::Sender<JobResult>,
}

impl Job {
    pub(crate) fn new(tier: TierKind, operation: Operation) -> (Job, JobHandle) {
        let id = NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            id,
            tier,
            operation,
            submitted_at: Utc::now(),
            attempts: 0,
            reply,
        };
        (job, JobHandle { id, tier, receiver })
    }

    /// Deliver the result. Returns false if the submitter stopped waiting.
    pub(crate) fn complete(self, result: JobResult) -> bool {
        self.reply.send(result).is_ok()
    }
}

/// Resolves to the job's result. A job dropped without a result (worker
/// aborted, tier torn down) resolves to `JobError::Cancelled`.
#[derive(Debug)]
pub struct JobHandle {
    id: u64,
    tier: TierKind,
    receiver: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> TierKind {
        self.tier
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Cancelled)))
    }
}
