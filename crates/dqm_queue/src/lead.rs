//! Lead bootstrap: connect, migrate, then hand over to the normal worker loop.

use crate::migrate::{self, Migration, MigrationStatus};
use crate::worker::{self, WorkerContext};
use dqm_db::{mask_dsn, EngineConnection, EngineError, EngineKind};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Readiness of an instance, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

impl Readiness {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Readiness::Pending)
    }
}

pub(crate) struct LeadPlan {
    pub(crate) kind: EngineKind,
    pub(crate) automigrate: bool,
    pub(crate) test_migration: bool,
    pub(crate) migrations: Vec<Migration>,
}

pub(crate) type BootstrapResult = Result<Option<MigrationStatus>, EngineError>;

/// Spawn the Lead worker. The receiver resolves once the Lead has connected
/// and migrated; afterwards the task keeps serving the Lead queue.
pub(crate) fn spawn(ctx: WorkerContext, plan: LeadPlan) -> (JoinHandle<()>, oneshot::Receiver<BootstrapResult>) {
    let (done_tx, done_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        match prepare(&ctx, &plan).await {
            Ok((mut conn, status)) => {
                if done_tx.send(Ok(status)).is_err() {
                    let _ = conn.close().await;
                    return;
                }
                worker::run(ctx, Some(conn)).await;
            }
            Err(err) => {
                let _ = done_tx.send(Err(err));
            }
        }
    });
    (handle, done_rx)
}

async fn prepare(
    ctx: &WorkerContext,
    plan: &LeadPlan,
) -> Result<(Box<dyn EngineConnection>, Option<MigrationStatus>), EngineError> {
    let mut conn = connect(ctx, plan.kind).await?;
    if !plan.automigrate {
        debug!("{} automigration disabled", ctx.label);
        return Ok((conn, None));
    }
    match migrate_and_test(conn.as_mut(), ctx, plan).await {
        Ok(status) => Ok((conn, Some(status))),
        Err(err) => {
            let _ = conn.close().await;
            Err(err)
        }
    }
}

async fn migrate_and_test(
    conn: &mut dyn EngineConnection,
    ctx: &WorkerContext,
    plan: &LeadPlan,
) -> Result<MigrationStatus, EngineError> {
    let mut status = migrate::run(conn, plan.kind, &plan.migrations, &ctx.label).await?;
    if plan.test_migration {
        status.reverted = migrate::revert(conn, plan.kind, &plan.migrations, &ctx.label).await?;
    }
    Ok(status)
}

/// Open the Lead connection, retrying Transient failures.
async fn connect(ctx: &WorkerContext, kind: EngineKind) -> Result<Box<dyn EngineConnection>, EngineError> {
    let attempts = ctx.settings.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        match worker::open_bounded(ctx).await {
            Ok(conn) => {
                info!(engine = %kind, "{} connected to {}", ctx.label, mask_dsn(&ctx.dsn));
                return Ok(conn);
            }
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    "{} connect failed, retrying: {}",
                    ctx.label,
                    err
                );
                tokio::time::sleep(ctx.settings.retry_backoff(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The readiness line operators and tests grep for.
pub(crate) fn announce_ready(label: &str, connection: &str, engine: EngineKind) {
    info!(
        connection = %connection,
        engine = %engine,
        "{} Lead queue worker thread started",
        label
    );
}
