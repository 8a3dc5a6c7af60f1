//! Connection registry: name → instance.
//!
//! Lookup by name is the only routing primitive. Instances are started and
//! stopped concurrently and never coordinate with each other.

use crate::config::{validate_connections, ConnectionConfig, DqmSettings};
use crate::error::{ConfigError, StartError, SubmitError};
use crate::instance::{DqmInstance, InstanceStatus, ShutdownReport};
use crate::job::JobHandle;
use crate::migrate::{self, Migration};
use crate::tier::TierKind;
use dqm_db::{engine_for, Engine, EngineKind, Operation};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinSet;
use tracing::{error, info};

/// Picks the engine implementation for a kind.
pub type EngineResolver = Arc<dyn Fn(EngineKind) -> Arc<dyn Engine> + Send + Sync>;

/// Supplies the migrations of a named built-in schema for an engine.
pub type SchemaProvider = Arc<dyn Fn(EngineKind) -> Vec<Migration> + Send + Sync>;

/// Per-connection startup outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub connection: String,
    pub ready: bool,
    pub error: Option<String>,
}

impl StartOutcome {
    fn from_result(connection: String, result: Result<(), StartError>) -> Self {
        match result {
            Ok(()) => Self {
                connection,
                ready: true,
                error: None,
            },
            Err(err) => Self {
                connection,
                ready: false,
                error: Some(err.to_string()),
            },
        }
    }
}

pub struct RegistryBuilder {
    settings: DqmSettings,
    resolver: EngineResolver,
    schemas: HashMap<String, SchemaProvider>,
}

impl RegistryBuilder {
    pub fn new(settings: DqmSettings) -> Self {
        Self {
            settings,
            resolver: Arc::new(engine_for),
            schemas: HashMap::new(),
        }
    }

    /// Replace the engine lookup (tests inject scripted engines here).
    pub fn engine_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(EngineKind) -> Arc<dyn Engine> + Send + Sync + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Register a built-in schema selectable with `schema = "<name>"`.
    pub fn schema<F>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(EngineKind) -> Vec<Migration> + Send + Sync + 'static,
    {
        self.schemas.insert(name.into(), Arc::new(provider));
        self
    }

    pub fn build(self, connections: Vec<ConnectionConfig>) -> Result<Registry, ConfigError> {
        self.settings.validate()?;
        validate_connections(&connections)?;

        let RegistryBuilder {
            settings,
            resolver,
            schemas,
        } = self;
        let settings = Arc::new(settings);
        let mut instances = HashMap::with_capacity(connections.len());
        for config in connections {
            let kind = config.engine_kind()?;
            let migrations = migrations_for(&schemas, &config, kind)?;
            let engine = resolver(kind);
            let name = config.name.clone();
            let instance = DqmInstance::new(config, Arc::clone(&settings), engine, migrations)?;
            instances.insert(name, Arc::new(instance));
        }

        Ok(Registry {
            settings,
            resolver,
            schemas,
            instances: RwLock::new(instances),
        })
    }
}

fn migrations_for(
    schemas: &HashMap<String, SchemaProvider>,
    config: &ConnectionConfig,
    kind: EngineKind,
) -> Result<Vec<Migration>, ConfigError> {
    let mut sources = Vec::new();
    if let Some(schema) = &config.schema {
        let provider = schemas.get(schema).ok_or_else(|| ConfigError::UnknownSchema {
            name: config.name.clone(),
            schema: schema.clone(),
        })?;
        sources.push(provider(kind));
    }
    if let Some(dir) = &config.migrations {
        sources.push(migrate::load_dir(dir)?);
    }
    migrate::merge(sources)
}

pub struct Registry {
    settings: Arc<DqmSettings>,
    resolver: EngineResolver,
    schemas: HashMap<String, SchemaProvider>,
    instances: RwLock<HashMap<String, Arc<DqmInstance>>>,
}

impl Registry {
    /// Registry over the compiled-in engines, no built-in schemas.
    pub fn from_configs(connections: Vec<ConnectionConfig>, settings: DqmSettings) -> Result<Self, ConfigError> {
        RegistryBuilder::new(settings).build(connections)
    }

    pub fn settings(&self) -> &DqmSettings {
        &self.settings
    }

    pub fn get(&self, name: &str) -> Option<Arc<DqmInstance>> {
        self.read().get(name).cloned()
    }

    /// Connection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Add and start a connection at runtime.
    pub async fn add(&self, config: ConnectionConfig) -> Result<StartOutcome, ConfigError> {
        config.validate()?;
        let kind = config.engine_kind()?;
        let migrations = migrations_for(&self.schemas, &config, kind)?;
        let name = config.name.clone();
        let instance = Arc::new(DqmInstance::new(
            config,
            Arc::clone(&self.settings),
            (self.resolver)(kind),
            migrations,
        )?);
        {
            let mut instances = self.write();
            if instances.contains_key(&name) {
                return Err(ConfigError::DuplicateName(name));
            }
            instances.insert(name.clone(), Arc::clone(&instance));
        }
        Ok(StartOutcome::from_result(name, instance.start().await))
    }

    /// Start every instance concurrently. One outcome per connection; a
    /// failed instance never affects the others.
    pub async fn start_all(&self) -> Vec<StartOutcome> {
        let instances: Vec<Arc<DqmInstance>> = self.read().values().cloned().collect();
        let mut set = JoinSet::new();
        for instance in instances {
            set.spawn(async move {
                let result = instance.start().await;
                StartOutcome::from_result(instance.name().to_string(), result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(err) = &outcome.error {
                        error!(connection = %outcome.connection, "Connection failed to start: {}", err);
                    }
                    outcomes.push(outcome);
                }
                Err(err) => error!("Startup task panicked: {}", err),
            }
        }
        outcomes.sort_by(|a, b| a.connection.cmp(&b.connection));
        let ready = outcomes.iter().filter(|o| o.ready).count();
        info!(ready, total = outcomes.len(), "All connections attempted startup");
        outcomes
    }

    pub async fn submit(&self, name: &str, tier: TierKind, operation: Operation) -> Result<JobHandle, SubmitError> {
        let instance = self
            .get(name)
            .ok_or_else(|| SubmitError::UnknownConnection(name.to_string()))?;
        instance.submit(tier, operation).await
    }

    /// Status of every instance, sorted by name.
    pub fn status(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self.read().values().map(|i| i.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Remove a connection and shut its instance down.
    pub async fn remove(&self, name: &str) -> Option<ShutdownReport> {
        let instance = self.write().remove(name)?;
        Some(instance.shutdown().await)
    }

    /// Shut every instance down concurrently.
    pub async fn shutdown_all(&self) -> Vec<ShutdownReport> {
        let instances: Vec<Arc<DqmInstance>> = self.read().values().cloned().collect();
        let mut set = JoinSet::new();
        for instance in instances {
            set.spawn(async move { instance.shutdown().await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!("Shutdown task panicked: {}", err),
            }
        }
        reports.sort_by(|a, b| a.connection.cmp(&b.connection));
        reports
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<DqmInstance>>> {
        self.instances.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<DqmInstance>>> {
        self.instances.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
