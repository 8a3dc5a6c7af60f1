//! One named connection's full tier set.
//!
//! Startup: the Lead connects and migrates, the bootstrap query runs through
//! the Lead queue, the instance turns Ready, and only then do the optional
//! tiers start (Slow, Medium, Fast, Cache, each iff `start > 0`).
//! Shutdown: optional tiers drain first, the Lead last, all against one
//! deadline.

use crate::config::{ConnectionConfig, DqmSettings};
use crate::error::{ConfigError, StartError, SubmitError};
use crate::job::JobHandle;
use crate::lead::{self, LeadPlan, Readiness};
use crate::migrate::{Migration, MigrationStatus};
use crate::tier::{queue_label, Tier, TierKind, TierShutdown, TierState, TierStatus};
use crate::worker::{self, WorkerContext};
use dqm_db::{mask_dsn, Engine, EngineError, EngineKind, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Tags carried by the Lead's label: it owns every tier until the optional
/// queues spawn.
pub const LEAD_TAGS: &str = "LSMFC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Created,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Created => "created",
            InstanceState::Starting => "starting",
            InstanceState::Ready => "ready",
            InstanceState::Failed => "failed",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// First Fatal connection error seen after Ready. Logged once.
#[derive(Debug, Default)]
pub(crate) struct InstanceFault {
    first: OnceLock<String>,
}

impl InstanceFault {
    pub(crate) fn record(&self, label: &str, error: &EngineError) {
        if self.first.set(error.to_string()).is_ok() {
            error!("{} connection fault: {}", label, error);
        }
    }

    pub(crate) fn get(&self) -> Option<String> {
        self.first.get().cloned()
    }
}

/// Serializable per-instance snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub engine: EngineKind,
    pub dsn: String,
    pub state: InstanceState,
    pub readiness: Readiness,
    pub fault: Option<String>,
    pub migration: Option<MigrationStatus>,
    pub tiers: Vec<TierStatus>,
}

/// Result of shutting an instance down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub connection: String,
    /// False when any tier had to abort workers.
    pub clean: bool,
    pub tiers: Vec<TierShutdown>,
}

pub struct DqmInstance {
    name: String,
    kind: EngineKind,
    config: ConnectionConfig,
    settings: Arc<DqmSettings>,
    engine: Arc<dyn Engine>,
    migrations: Mutex<Vec<Migration>>,
    lead: Tier,
    optional: BTreeMap<TierKind, Tier>,
    state: Mutex<InstanceState>,
    readiness: watch::Sender<Readiness>,
    fault: Arc<InstanceFault>,
    migration_status: Mutex<Option<MigrationStatus>>,
}

impl DqmInstance {
    /// Build an instance. `migrations` is the merged, ordered migration list
    /// applied when `automigrate` is set.
    pub fn new(
        config: ConnectionConfig,
        settings: Arc<DqmSettings>,
        engine: Arc<dyn Engine>,
        migrations: Vec<Migration>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let kind = config.engine_kind()?;
        let name = config.name.clone();

        let lead = Tier::new(&name, TierKind::Lead, 1, settings.queue_capacity);
        let optional = TierKind::OPTIONAL
            .iter()
            .filter_map(|kind| {
                let start = config.queues.start_for(*kind) as usize;
                (start > 0).then(|| (*kind, Tier::new(&name, *kind, start, settings.queue_capacity)))
            })
            .collect();
        let (readiness, _) = watch::channel(Readiness::Pending);

        Ok(Self {
            name,
            kind,
            config,
            settings,
            engine,
            migrations: Mutex::new(migrations),
            lead,
            optional,
            state: Mutex::new(InstanceState::Created),
            readiness,
            fault: Arc::new(InstanceFault::default()),
            migration_status: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.kind
    }

    pub fn state(&self) -> InstanceState {
        *lock(&self.state)
    }

    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    /// Wait until the Lead is Ready or has Failed.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.readiness.subscribe();
        let settled = match rx.wait_for(Readiness::is_settled).await {
            Ok(readiness) => readiness.clone(),
            Err(_) => Readiness::Failed("instance dropped".to_string()),
        };
        settled
    }

    /// The tier serving `kind`, if it is configured.
    pub fn tier(&self, kind: TierKind) -> Option<&Tier> {
        match kind {
            TierKind::Lead => Some(&self.lead),
            other => self.optional.get(&other),
        }
    }

    pub fn lead_label(&self) -> String {
        queue_label(&self.name, 0, LEAD_TAGS)
    }

    fn worker_context(&self, tier: &Tier, label: String, persistent: bool) -> WorkerContext {
        WorkerContext {
            tier: tier.shared(),
            engine: Arc::clone(&self.engine),
            dsn: Arc::from(self.config.dsn.as_str()),
            label,
            settings: Arc::clone(&self.settings),
            fault: Arc::clone(&self.fault),
            persistent,
        }
    }

    /// Bring the instance up. Returns once the Lead is Ready and every
    /// configured optional tier is running, or with the bootstrap failure.
    pub async fn start(&self) -> Result<(), StartError> {
        // Tier transitions happen under the instance state lock so a
        // concurrent `shutdown` sees either no workers or all of them.
        let (label, bootstrap) = {
            let mut state = lock(&self.state);
            if *state != InstanceState::Created {
                return Err(StartError::InvalidState {
                    connection: self.name.clone(),
                    state: *state,
                });
            }
            *state = InstanceState::Starting;

            let label = self.lead_label();
            info!(
                engine = %self.kind,
                dsn = %mask_dsn(&self.config.dsn),
                "{} starting",
                label
            );

            self.lead.set_state(TierState::Starting);
            let plan = LeadPlan {
                kind: self.kind,
                automigrate: self.config.automigrate,
                test_migration: self.config.test_migration,
                migrations: std::mem::take(&mut *lock(&self.migrations)),
            };
            let ctx = self.worker_context(&self.lead, label.clone(), true);
            let (handle, bootstrap) = lead::spawn(ctx, plan);
            self.lead.attach_workers(vec![label.clone()], vec![handle]);
            (label, bootstrap)
        };

        let bootstrap = match bootstrap.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::fatal("Lead worker exited during bootstrap")),
        };
        match bootstrap {
            Ok(status) => *lock(&self.migration_status) = status,
            Err(source) => {
                let err = StartError::Bootstrap {
                    connection: self.name.clone(),
                    source,
                };
                self.fail(&label, &err).await;
                return Err(err);
            }
        }

        if let Some(query) = self.config.bootstrap_query.clone() {
            if let Err(err) = self.run_bootstrap_query(query).await {
                self.fail(&label, &err).await;
                return Err(err);
            }
        }

        let mut state = lock(&self.state);
        if *state != InstanceState::Starting {
            // Shut down while bootstrapping.
            return Err(StartError::InvalidState {
                connection: self.name.clone(),
                state: *state,
            });
        }
        self.lead.set_state(TierState::Running);
        *state = InstanceState::Ready;
        lead::announce_ready(&label, &self.name, self.kind);
        self.readiness.send_replace(Readiness::Ready);

        self.start_optional_tiers();
        Ok(())
    }

    async fn run_bootstrap_query(&self, query: String) -> Result<(), StartError> {
        let wrap = |source| StartError::BootstrapQuery {
            connection: self.name.clone(),
            source,
        };
        let handle = self
            .lead
            .submit_internal(Operation::query(query, Vec::new()), self.settings.submit_timeout())
            .await
            .map_err(|e| wrap(crate::error::JobError::Engine(EngineError::fatal(e.to_string()))))?;
        handle.await.map(|_| ()).map_err(wrap)
    }

    async fn fail(&self, label: &str, err: &StartError) {
        error!("{} bootstrap failed: {}", label, err);
        {
            let mut state = lock(&self.state);
            if *state == InstanceState::Starting {
                *state = InstanceState::Failed;
            }
        }
        self.readiness.send_replace(Readiness::Failed(err.to_string()));
        let deadline = Instant::now() + self.settings.drain_timeout();
        self.lead.begin_shutdown();
        self.lead.finish_shutdown(deadline, self.settings.drain_timeout()).await;
    }

    /// Called with the state lock held, right after the Ready transition.
    fn start_optional_tiers(&self) {
        let mut number = 1;
        for (kind, tier) in &self.optional {
            tier.set_state(TierState::Starting);
            let mut labels = Vec::with_capacity(tier.worker_count());
            let mut handles = Vec::with_capacity(tier.worker_count());
            for _ in 0..tier.worker_count() {
                let label = queue_label(&self.name, number, &kind.tag().to_string());
                number += 1;
                let ctx = self.worker_context(tier, label.clone(), false);
                handles.push(worker::spawn(ctx, None));
                labels.push(label);
            }
            info!(
                connection = %self.name,
                workers = tier.worker_count(),
                "{} {} queue started",
                labels.first().map(String::as_str).unwrap_or_default(),
                kind
            );
            tier.attach_workers(labels, handles);
            tier.set_state(TierState::Running);
        }
    }

    /// Submit an operation to one tier.
    pub async fn submit(&self, tier: TierKind, operation: Operation) -> Result<JobHandle, SubmitError> {
        match self.tier(tier) {
            Some(target) => target.submit(operation, self.settings.submit_timeout()).await,
            None => Err(SubmitError::TierDisabled {
                connection: self.name.clone(),
                tier,
            }),
        }
    }

    pub fn status(&self) -> InstanceStatus {
        let mut tiers = vec![self.lead.status()];
        tiers.extend(self.optional.values().map(Tier::status));
        InstanceStatus {
            name: self.name.clone(),
            engine: self.kind,
            dsn: mask_dsn(&self.config.dsn),
            state: self.state(),
            readiness: self.readiness.borrow().clone(),
            fault: self.fault.get(),
            migration: lock(&self.migration_status).clone(),
            tiers,
        }
    }

    /// Cooperative shutdown within `drain_timeout`. Never blocks past it:
    /// stragglers are aborted and the report is marked unclean.
    pub async fn shutdown(&self) -> ShutdownReport {
        let previous = {
            let mut state = lock(&self.state);
            let previous = *state;
            if !matches!(previous, InstanceState::Stopping | InstanceState::Stopped) {
                *state = InstanceState::Stopping;
            }
            previous
        };
        if matches!(previous, InstanceState::Stopping | InstanceState::Stopped) {
            return ShutdownReport {
                connection: self.name.clone(),
                clean: true,
                tiers: Vec::new(),
            };
        }

        let drain = self.settings.drain_timeout();
        let deadline = Instant::now() + drain;
        info!(connection = %self.name, "{} shutting down", self.lead_label());

        for tier in self.optional.values() {
            tier.begin_shutdown();
        }
        let mut tiers = Vec::with_capacity(self.optional.len() + 1);
        for tier in self.optional.values() {
            tiers.push(tier.finish_shutdown(deadline, drain).await);
        }
        self.lead.begin_shutdown();
        tiers.push(self.lead.finish_shutdown(deadline, drain).await);

        let clean = tiers.iter().all(|t| t.clean);
        *lock(&self.state) = InstanceState::Stopped;
        if !self.readiness.borrow().is_settled() {
            self.readiness
                .send_replace(Readiness::Failed("stopped before ready".to_string()));
        }

        if clean {
            info!(connection = %self.name, "{} stopped", self.lead_label());
        } else {
            warn!(connection = %self.name, "{} stopped with aborted workers", self.lead_label());
        }
        ShutdownReport {
            connection: self.name.clone(),
            clean,
            tiers,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
