//! Tier worker loop.
//!
//! Each worker owns a private engine connection, opened lazily on the first
//! job and dropped after a Transient failure. Loop priorities (biased):
//! cancellation, then the next job, then the idle heartbeat.

use crate::config::DqmSettings;
use crate::error::JobError;
use crate::instance::InstanceFault;
use crate::job::Job;
use crate::tier::{RequeueRefused, TierShared};
use chrono::Utc;
use dqm_db::{Engine, EngineConnection, EngineError, Operation, OperationResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

pub(crate) type ConnectionSlot = Option<Box<dyn EngineConnection>>;

/// Everything a worker needs, cloned per worker.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) tier: Arc<TierShared>,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) dsn: Arc<str>,
    pub(crate) label: String,
    pub(crate) settings: Arc<DqmSettings>,
    pub(crate) fault: Arc<InstanceFault>,
    /// Reconnect on heartbeat when the connection was lost (the Lead).
    pub(crate) persistent: bool,
}

pub(crate) fn spawn(ctx: WorkerContext, conn: ConnectionSlot) -> JoinHandle<()> {
    tokio::spawn(run(ctx, conn))
}

pub(crate) async fn run(ctx: WorkerContext, mut conn: ConnectionSlot) {
    debug!("{} worker started", ctx.label);

    let period = ctx.settings.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = ctx.tier.cancel.cancelled() => break,

            job = ctx.tier.next_job() => match job {
                Some(job) => {
                    process(&ctx, &mut conn, job).await;
                    heartbeat.reset();
                }
                None => break,
            },

            _ = heartbeat.tick() => beat(&ctx, &mut conn).await,
        }
    }

    if let Some(mut connection) = conn.take() {
        if let Err(err) = connection.close().await {
            debug!("{} close failed: {}", ctx.label, err);
        }
    }
    debug!("{} worker exiting", ctx.label);
}

struct Failure {
    error: EngineError,
    during_open: bool,
}

/// Open a connection within `connect_timeout_ms`. Expiry is Transient.
pub(crate) async fn open_bounded(ctx: &WorkerContext) -> Result<Box<dyn EngineConnection>, EngineError> {
    let limit = ctx.settings.connect_timeout();
    match timeout(limit, ctx.engine.open(&ctx.dsn)).await {
        Ok(opened) => opened,
        Err(_) => Err(EngineError::transient(format!(
            "connect timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

async fn attempt(
    ctx: &WorkerContext,
    conn: &mut ConnectionSlot,
    operation: &Operation,
) -> Result<OperationResult, Failure> {
    if conn.is_none() {
        let opened = open_bounded(ctx).await.map_err(|error| Failure {
            error,
            during_open: true,
        })?;
        debug!("{} connection opened", ctx.label);
        *conn = Some(opened);
    }
    let Some(connection) = conn.as_mut() else {
        return Err(Failure {
            error: EngineError::transient("connection unavailable"),
            during_open: true,
        });
    };
    let limit = ctx.settings.query_timeout();
    let started = Instant::now();
    let outcome = timeout(limit, connection.execute(operation)).await;
    let metrics = &ctx.tier.metrics;
    metrics.record_execution(started.elapsed(), Utc::now());
    let result = match outcome {
        Ok(result) => result,
        Err(_) => {
            metrics.inc_timeouts();
            Err(EngineError::transient(format!(
                "{} timed out after {}ms",
                operation.kind_name(),
                limit.as_millis()
            )))
        }
    };
    result.map_err(|error| Failure {
        error,
        during_open: false,
    })
}

async fn process(ctx: &WorkerContext, conn: &mut ConnectionSlot, mut job: Job) {
    let metrics = &ctx.tier.metrics;
    loop {
        match attempt(ctx, conn, &job.operation).await {
            Ok(result) => {
                metrics.inc_completed();
                trace!(job_id = job.id, "{} job completed", ctx.label);
                job.complete(Ok(result));
                return;
            }
            Err(Failure { error, .. }) if error.is_transient() => {
                *conn = None;
                job.attempts += 1;
                if job.attempts > ctx.settings.max_retries {
                    warn!(
                        job_id = job.id,
                        attempts = job.attempts,
                        "{} giving up on job: {}",
                        ctx.label,
                        error
                    );
                    metrics.inc_failed();
                    let attempts = job.attempts;
                    job.complete(Err(JobError::RetriesExhausted {
                        attempts,
                        last: error,
                    }));
                    return;
                }

                metrics.inc_retried();
                debug!(
                    job_id = job.id,
                    attempt = job.attempts,
                    "{} transient failure, retrying: {}",
                    ctx.label,
                    error
                );

                let backoff = ctx.settings.retry_backoff(job.attempts);
                tokio::select! {
                    biased;
                    _ = ctx.tier.cancel.cancelled() => {
                        metrics.add_cancelled(1);
                        job.complete(Err(JobError::Cancelled));
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }

                match ctx.tier.requeue(job) {
                    Ok(()) => return,
                    // Queue is saturated: retry here instead of blocking on space.
                    Err(RequeueRefused::Full(returned)) => job = returned,
                    Err(RequeueRefused::Closed(returned)) => {
                        metrics.add_cancelled(1);
                        returned.complete(Err(JobError::Cancelled));
                        return;
                    }
                }
            }
            Err(Failure { error, during_open }) => {
                if during_open {
                    ctx.fault.record(&ctx.label, &error);
                }
                metrics.inc_failed();
                job.complete(Err(JobError::Engine(error)));
                return;
            }
        }
    }
}

async fn beat(ctx: &WorkerContext, conn: &mut ConnectionSlot) {
    if let Some(connection) = conn.as_mut() {
        let result = match timeout(ctx.settings.query_timeout(), connection.ping()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::transient("ping timed out")),
        };
        match result {
            Ok(()) => trace!("{} heartbeat ok", ctx.label),
            Err(err) => {
                warn!("{} heartbeat failed, dropping connection: {}", ctx.label, err);
                *conn = None;
            }
        }
        return;
    }

    if !ctx.persistent {
        return;
    }
    match open_bounded(ctx).await {
        Ok(connection) => {
            info!("{} reconnected", ctx.label);
            *conn = Some(connection);
        }
        Err(err) => {
            if err.is_fatal() {
                ctx.fault.record(&ctx.label, &err);
            }
            warn!("{} reconnect failed: {}", ctx.label, err);
        }
    }
}
