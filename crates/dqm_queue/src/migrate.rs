//! Migration orchestration.
//!
//! Migrations are opaque SQL scripts with an integer version. The Lead
//! applies every version above the highest one recorded in
//! `dqm_migrations`, in ascending order. Each script and its record row run
//! in one transaction, so a failing script leaves no partial version behind.
//! MySQL commits implicitly on DDL, so there a failing script can leave the
//! statements before the failure in place; the version is still not recorded.

use crate::error::ConfigError;
use chrono::Utc;
use dqm_db::{DbValue, EngineConnection, EngineError, EngineKind, Operation};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const MIGRATIONS_TABLE: &str = "dqm_migrations";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: String,
    /// Reverse script, run by test migration.
    pub down: Option<String>,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
            down: None,
        }
    }

    pub fn with_down(mut self, sql: impl Into<String>) -> Self {
        self.down = Some(sql.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationAction {
    None,
    Apply,
}

impl MigrationAction {
    pub fn describe(&self) -> &'static str {
        match self {
            MigrationAction::None => "Migration Current",
            MigrationAction::Apply => "Migration Updating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub available: i64,
    pub installed: i64,
    pub applied: Vec<i64>,
    pub action: MigrationAction,
    /// Versions undone by test migration, newest first.
    pub reverted: Vec<i64>,
}

/// Load `NNNN_name.sql` files from a directory, with optional
/// `NNNN_name.down.sql` reverse scripts. Other files are ignored.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>, ConfigError> {
    let error = |message: String| ConfigError::Migration {
        path: dir.display().to_string(),
        message,
    };

    let entries = fs::read_dir(dir).map_err(|e| error(e.to_string()))?;
    let mut migrations = Vec::new();
    let mut downs = BTreeMap::new();
    for entry in entries {
        let path = entry.map_err(|e| error(e.to_string()))?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(parsed) = parse_file_name(file_name) else {
            debug!(file = %path.display(), "Skipping non-migration file");
            continue;
        };
        let sql = fs::read_to_string(&path).map_err(|e| error(format!("{}: {}", file_name, e)))?;
        if parsed.down {
            if downs.insert(parsed.version, sql).is_some() {
                return Err(error(format!("duplicate reverse migration {}", parsed.version)));
            }
        } else {
            migrations.push(Migration::new(parsed.version, parsed.name, sql));
        }
    }
    for migration in &mut migrations {
        migration.down = downs.remove(&migration.version);
    }
    if let Some(orphan) = downs.keys().next() {
        return Err(error(format!("reverse migration {} has no forward script", orphan)));
    }
    merge(vec![migrations]).map_err(|e| match e {
        ConfigError::Migration { message, .. } => error(message),
        other => other,
    })
}

#[derive(Debug, PartialEq, Eq)]
struct FileName {
    version: i64,
    name: String,
    down: bool,
}

fn parse_file_name(file_name: &str) -> Option<FileName> {
    let stem = file_name.strip_suffix(".sql")?;
    let (stem, down) = match stem.strip_suffix(".down") {
        Some(stem) => (stem, true),
        None => (stem, false),
    };
    let (digits, name) = stem.split_once('_')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let version = digits.parse().ok()?;
    Some(FileName {
        version,
        name: name.to_string(),
        down,
    })
}

/// Combine migration sources into one ascending list. Versions must be
/// positive and unique across sources.
pub fn merge(sources: Vec<Vec<Migration>>) -> Result<Vec<Migration>, ConfigError> {
    let mut by_version = BTreeMap::new();
    for migration in sources.into_iter().flatten() {
        if migration.version <= 0 {
            return Err(ConfigError::Migration {
                path: migration.name.clone(),
                message: format!("version {} must be positive", migration.version),
            });
        }
        if let Some(existing) = by_version.insert(migration.version, migration) {
            return Err(ConfigError::Migration {
                path: existing.name,
                message: format!("duplicate migration version {}", existing.version),
            });
        }
    }
    Ok(by_version.into_values().collect())
}

/// Migrations newer than `installed`, in the order they must run.
pub fn pending(migrations: &[Migration], installed: i64) -> Vec<&Migration> {
    migrations.iter().filter(|m| m.version > installed).collect()
}

/// `$n` for PostgreSQL, `?` elsewhere.
pub fn placeholder(kind: EngineKind, index: usize) -> String {
    match kind {
        EngineKind::Postgres => format!("${}", index),
        _ => "?".to_string(),
    }
}

pub(crate) async fn run(
    conn: &mut dyn EngineConnection,
    kind: EngineKind,
    migrations: &[Migration],
    label: &str,
) -> Result<MigrationStatus, EngineError> {
    ensure_table(conn, kind).await?;
    let installed = installed_version(conn).await?;
    let available = migrations.iter().map(|m| m.version).max().unwrap_or(0);
    let todo = pending(migrations, installed);
    let action = if todo.is_empty() {
        MigrationAction::None
    } else {
        MigrationAction::Apply
    };
    info!(
        "{} {}: Available = {}, Installed = {}",
        label,
        action.describe(),
        available,
        installed
    );

    let mut applied = Vec::with_capacity(todo.len());
    for migration in todo {
        info!("{} Applying migration {} ({})", label, migration.version, migration.name);
        let steps = [Operation::batch(migration.sql.clone()), record(kind, migration)];
        in_transaction(conn, &steps).await.map_err(|err| {
            warn!("{} Migration {} rolled back: {}", label, migration.version, err);
            err
        })?;
        applied.push(migration.version);
    }

    if !applied.is_empty() {
        info!(
            "{} {}: Available = {}, Installed = {}",
            label,
            MigrationAction::None.describe(),
            available,
            available.max(installed)
        );
    }

    Ok(MigrationStatus {
        available,
        installed,
        applied,
        action,
        reverted: Vec::new(),
    })
}

/// Undo installed migrations newest first, each with its reverse script in
/// its own transaction. Stops at the first version without one.
pub(crate) async fn revert(
    conn: &mut dyn EngineConnection,
    kind: EngineKind,
    migrations: &[Migration],
    label: &str,
) -> Result<Vec<i64>, EngineError> {
    let mut reverted = Vec::new();
    loop {
        let installed = installed_version(conn).await?;
        if installed == 0 {
            break;
        }
        let Some((migration, down)) = migrations
            .iter()
            .find(|m| m.version == installed)
            .and_then(|m| m.down.as_ref().map(|down| (m, down)))
        else {
            info!("{} No reverse migration for {}, test migration complete", label, installed);
            break;
        };
        info!("{} Reverting migration {} ({})", label, migration.version, migration.name);
        let steps = [Operation::batch(down.clone()), unrecord(kind, migration.version)];
        in_transaction(conn, &steps).await.map_err(|err| {
            warn!("{} Reverse migration {} rolled back: {}", label, migration.version, err);
            err
        })?;
        reverted.push(migration.version);
    }
    info!("{} Test migration reverted {} version(s)", label, reverted.len());
    Ok(reverted)
}

/// Run `steps` between BEGIN and COMMIT, rolling back on the first failure.
async fn in_transaction(conn: &mut dyn EngineConnection, steps: &[Operation]) -> Result<(), EngineError> {
    conn.begin().await?;
    for step in steps {
        if let Err(err) = conn.execute(step).await {
            if let Err(rollback) = conn.rollback().await {
                warn!("Rollback failed: {}", rollback);
            }
            return Err(err);
        }
    }
    conn.commit().await
}

async fn ensure_table(conn: &mut dyn EngineConnection, kind: EngineKind) -> Result<(), EngineError> {
    let columns = "version BIGINT NOT NULL PRIMARY KEY, name VARCHAR(255) NOT NULL, applied_at VARCHAR(64) NOT NULL";
    if kind == EngineKind::Db2 {
        let exists = conn
            .execute(&Operation::query(
                "SELECT 1 FROM SYSCAT.TABLES WHERE TABNAME = 'DQM_MIGRATIONS' AND TABSCHEMA = CURRENT SCHEMA",
                Vec::new(),
            ))
            .await?
            .first_row()
            .is_some();
        if !exists {
            conn.execute(&Operation::batch(format!(
                "CREATE TABLE {} ({})",
                MIGRATIONS_TABLE, columns
            )))
            .await?;
        }
        return Ok(());
    }
    conn.execute(&Operation::batch(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        MIGRATIONS_TABLE, columns
    )))
    .await?;
    Ok(())
}

async fn installed_version(conn: &mut dyn EngineConnection) -> Result<i64, EngineError> {
    let row = conn
        .execute(&Operation::query(
            format!("SELECT MAX(version) AS installed FROM {}", MIGRATIONS_TABLE),
            Vec::new(),
        ))
        .await?
        .first_row();
    match row {
        Some(row) => Ok(row.get_by_name::<Option<i64>>("installed")?.unwrap_or(0)),
        None => Ok(0),
    }
}

fn unrecord(kind: EngineKind, version: i64) -> Operation {
    Operation::execute(
        format!("DELETE FROM {} WHERE version = {}", MIGRATIONS_TABLE, placeholder(kind, 1)),
        vec![DbValue::from(version)],
    )
}

fn record(kind: EngineKind, migration: &Migration) -> Operation {
    Operation::execute(
        format!(
            "INSERT INTO {} (version, name, applied_at) VALUES ({}, {}, {})",
            MIGRATIONS_TABLE,
            placeholder(kind, 1),
            placeholder(kind, 2),
            placeholder(kind, 3)
        ),
        vec![
            DbValue::from(migration.version),
            DbValue::from(migration.name.as_str()),
            DbValue::from(Utc::now().to_rfc3339()),
        ],
    )
}
