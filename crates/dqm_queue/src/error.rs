//! Error taxonomy for configuration, submission, jobs, and startup.

use crate::instance::InstanceState;
use crate::tier::{TierKind, TierState};
use dqm_db::EngineError;
use serde::Serialize;
use thiserror::Error;

/// Malformed configuration. Fatal at load.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Connection name must not be empty")]
    EmptyName,

    #[error("Connection '{0}' has an empty dsn")]
    EmptyDsn(String),

    #[error("Duplicate connection name '{0}'")]
    DuplicateName(String),

    #[error("Connection '{name}': {message}")]
    UnknownEngine { name: String, message: String },

    #[error("Connection '{name}': {tier} start = {value} exceeds the limit of {max} workers")]
    InvalidWorkerCount {
        name: String,
        tier: TierKind,
        value: u32,
        max: u32,
    },

    #[error("Connection '{name}': unknown schema '{schema}'")]
    UnknownSchema { name: String, schema: String },

    #[error("Invalid migration source {path}: {message}")]
    Migration { path: String, message: String },

    #[error("Invalid setting {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Submission refused before a job was queued.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("{connection}/{tier} is {state}, not accepting submissions")]
    Rejected {
        connection: String,
        tier: TierKind,
        state: TierState,
    },

    #[error("{connection}/{tier} is not configured (start = 0)")]
    TierDisabled { connection: String, tier: TierKind },

    #[error("{connection}/{tier} queue is full")]
    QueueFull { connection: String, tier: TierKind },

    #[error("Unknown connection '{0}'")]
    UnknownConnection(String),
}

impl SubmitError {
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            SubmitError::Rejected { tier, .. }
            | SubmitError::TierDisabled { tier, .. }
            | SubmitError::QueueFull { tier, .. } => Some(*tier),
            SubmitError::UnknownConnection(_) => None,
        }
    }
}

/// Failure delivered to the submitter of an accepted job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: EngineError },

    #[error("Job cancelled: tier stopped before it ran")]
    Cancelled,
}

/// Instance startup failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("{connection}: Lead bootstrap failed: {source}")]
    Bootstrap {
        connection: String,
        source: EngineError,
    },

    #[error("{connection}: bootstrap query failed: {source}")]
    BootstrapQuery { connection: String, source: JobError },

    #[error("{connection}: cannot start from state {state}")]
    InvalidState {
        connection: String,
        state: InstanceState,
    },
}

/// A tier that did not drain before its deadline. Reported, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("{tier} tier did not drain within {timeout_ms}ms ({aborted_workers} workers aborted)")]
pub struct ShutdownTimeout {
    pub tier: TierKind,
    pub timeout_ms: u64,
    pub aborted_workers: usize,
}
