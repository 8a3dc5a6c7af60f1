//! Connection and queue configuration.
//!
//! Read once at startup and owned by the registry. The launcher parses TOML
//! into these types; everything else consumes them already validated.

use crate::error::ConfigError;
use crate::tier::TierKind;
use dqm_db::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on workers per optional tier.
pub const MAX_WORKERS_PER_TIER: u32 = 64;

/// Worker count for one optional tier. `0` disables the tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfig {
    pub start: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueuesConfig {
    pub slow: TierConfig,
    pub medium: TierConfig,
    pub fast: TierConfig,
    pub cache: TierConfig,
}

impl QueuesConfig {
    /// Configured worker count. The Lead always has exactly one.
    pub fn start_for(&self, kind: TierKind) -> u32 {
        match kind {
            TierKind::Lead => 1,
            TierKind::Slow => self.slow.start,
            TierKind::Medium => self.medium.start,
            TierKind::Fast => self.fast.start,
            TierKind::Cache => self.cache.start,
        }
    }

    fn slot_mut(&mut self, kind: TierKind) -> Option<&mut TierConfig> {
        match kind {
            TierKind::Lead => None,
            TierKind::Slow => Some(&mut self.slow),
            TierKind::Medium => Some(&mut self.medium),
            TierKind::Fast => Some(&mut self.fast),
            TierKind::Cache => Some(&mut self.cache),
        }
    }
}

/// One named database connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    pub name: String,
    /// Engine name; detected from `dsn` when omitted.
    #[serde(default)]
    pub engine: Option<String>,
    pub dsn: String,
    #[serde(default)]
    pub automigrate: bool,
    /// After migrating, undo installed versions through their reverse
    /// scripts. Only takes effect with `automigrate`.
    #[serde(default)]
    pub test_migration: bool,
    #[serde(default)]
    pub queues: QueuesConfig,
    /// Directory of `NNNN_name.sql` migration files.
    #[serde(default)]
    pub migrations: Option<PathBuf>,
    /// Built-in schema whose migrations the application registers.
    #[serde(default)]
    pub schema: Option<String>,
    /// Query the Lead runs after migration, before reporting ready.
    #[serde(default)]
    pub bootstrap_query: Option<String>,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, dsn: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: None,
            dsn: dsn.into(),
            automigrate: false,
            test_migration: false,
            queues: QueuesConfig::default(),
            migrations: None,
            schema: None,
            bootstrap_query: None,
        }
    }

    /// Builder-style worker count for an optional tier. Ignored for the Lead.
    pub fn with_tier(mut self, kind: TierKind, start: u32) -> Self {
        if let Some(slot) = self.queues.slot_mut(kind) {
            slot.start = start;
        }
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = Some(engine.as_str().to_string());
        self
    }

    pub fn engine_kind(&self) -> Result<EngineKind, ConfigError> {
        match &self.engine {
            Some(engine) => engine.parse().map_err(|message| ConfigError::UnknownEngine {
                name: self.name.clone(),
                message,
            }),
            None => Ok(EngineKind::detect(&self.dsn)),
        }
    }

    /// Tiers to start, in start order: Lead, then each optional tier with
    /// `start > 0` in fixed order.
    pub fn tier_plan(&self) -> Vec<(TierKind, u32)> {
        std::iter::once((TierKind::Lead, 1))
            .chain(
                TierKind::OPTIONAL
                    .iter()
                    .map(|kind| (*kind, self.queues.start_for(*kind)))
                    .filter(|(_, start)| *start > 0),
            )
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.dsn.trim().is_empty() {
            return Err(ConfigError::EmptyDsn(self.name.clone()));
        }
        self.engine_kind()?;
        for kind in TierKind::OPTIONAL {
            let value = self.queues.start_for(kind);
            if value > MAX_WORKERS_PER_TIER {
                return Err(ConfigError::InvalidWorkerCount {
                    name: self.name.clone(),
                    tier: kind,
                    value,
                    max: MAX_WORKERS_PER_TIER,
                });
            }
        }
        Ok(())
    }
}

/// Validate every connection and reject duplicate names.
pub fn validate_connections(connections: &[ConnectionConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for connection in connections {
        connection.validate()?;
        if !seen.insert(connection.name.as_str()) {
            return Err(ConfigError::DuplicateName(connection.name.clone()));
        }
    }
    Ok(())
}

/// Process-wide queue tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DqmSettings {
    /// Bounded queue length per tier.
    pub queue_capacity: usize,
    /// How long `submit` waits for queue space before `QueueFull`.
    pub submit_timeout_ms: u64,
    /// Per-instance drain window on shutdown.
    pub drain_timeout_ms: u64,
    /// Transient retries per job before `RetriesExhausted`.
    pub max_retries: u32,
    /// Linear backoff step between retries.
    pub retry_backoff_ms: u64,
    /// Lead connection attempts on Transient open errors.
    pub connect_attempts: u32,
    /// Idle connection ping interval.
    pub heartbeat_interval_secs: u64,
    /// Bound on a single connection open.
    pub connect_timeout_ms: u64,
    /// Bound on a single job execution or ping. Expiry counts as Transient.
    pub query_timeout_ms: u64,
}

impl Default for DqmSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            submit_timeout_ms: 5_000,
            drain_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 50,
            connect_attempts: 3,
            heartbeat_interval_secs: 30,
            connect_timeout_ms: 10_000,
            query_timeout_ms: 30_000,
        }
    }
}

impl DqmSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "queue_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "connect_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "heartbeat_interval_secs",
                message: "must be at least 1".to_string(),
            });
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "connect_timeout_ms",
                message: "must be at least 1".to_string(),
            });
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "query_timeout_ms",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_plan_skips_disabled_tiers() {
        let config = ConnectionConfig::new("Acuranzo", "sqlite:/tmp/a.db")
            .with_tier(TierKind::Slow, 1)
            .with_tier(TierKind::Fast, 2)
            .with_tier(TierKind::Lead, 9);
        assert_eq!(
            config.tier_plan(),
            vec![(TierKind::Lead, 1), (TierKind::Slow, 1), (TierKind::Fast, 2)]
        );
    }

    #[test]
    fn engine_detected_when_omitted() {
        let config = ConnectionConfig::new("pg", "postgresql://u:p@h/db");
        assert_eq!(config.engine_kind().unwrap(), EngineKind::Postgres);

        let config = ConnectionConfig::new("x", "postgresql://h/db").with_engine(EngineKind::Mysql);
        assert_eq!(config.engine_kind().unwrap(), EngineKind::Mysql);
    }

    #[test]
    fn validate_rejects_bad_connections() {
        assert_eq!(
            ConnectionConfig::new(" ", "sqlite:a.db").validate(),
            Err(ConfigError::EmptyName)
        );
        assert_eq!(
            ConnectionConfig::new("a", "").validate(),
            Err(ConfigError::EmptyDsn("a".into()))
        );

        let mut unknown = ConnectionConfig::new("a", "sqlite:a.db");
        unknown.engine = Some("oracle".into());
        assert!(matches!(unknown.validate(), Err(ConfigError::UnknownEngine { .. })));

        let too_many = ConnectionConfig::new("a", "sqlite:a.db").with_tier(TierKind::Cache, 65);
        assert!(matches!(
            too_many.validate(),
            Err(ConfigError::InvalidWorkerCount { tier: TierKind::Cache, .. })
        ));
    }

    #[test]
    fn duplicate_names_rejected() {
        let configs = vec![
            ConnectionConfig::new("a", "sqlite:a.db"),
            ConnectionConfig::new("b", "sqlite:b.db"),
            ConnectionConfig::new("a", "sqlite:c.db"),
        ];
        assert_eq!(
            validate_connections(&configs),
            Err(ConfigError::DuplicateName("a".into()))
        );
    }

    #[test]
    fn settings_defaults_and_backoff() {
        let settings = DqmSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry_backoff(3), Duration::from_millis(150));

        let bad = DqmSettings {
            queue_capacity: 0,
            ..DqmSettings::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::InvalidSetting { key: "queue_capacity", .. })
        ));

        let unbounded = DqmSettings {
            query_timeout_ms: 0,
            ..DqmSettings::default()
        };
        assert!(matches!(
            unbounded.validate(),
            Err(ConfigError::InvalidSetting { key: "query_timeout_ms", .. })
        ));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn connection_deserializes_with_defaults() {
        let json = serde_json::json!({
            "name": "Acuranzo",
            "dsn": "sqlite:/tmp/a.db",
            "queues": { "fast": { "start": 2 } }
        });
        let config: ConnectionConfig = serde_json::from_value(json).unwrap();
        assert!(!config.automigrate);
        assert!(!config.test_migration);
        assert_eq!(config.queues.start_for(TierKind::Fast), 2);
        assert_eq!(config.queues.start_for(TierKind::Slow), 0);
    }
}
