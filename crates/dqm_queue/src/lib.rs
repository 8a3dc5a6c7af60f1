//! Database queue manager.
//!
//! Every configured connection gets a [`DqmInstance`]: a mandatory Lead
//! tier that connects, migrates and reports readiness, plus up to four
//! optional tiers (Slow, Medium, Fast, Cache) each with a fixed worker pool.
//! The [`Registry`] holds all instances and routes submissions by name.
//!
//! ```text
//! Registry ──name──▶ DqmInstance ──tier──▶ Tier (bounded queue)
//!                                            │
//!                                  worker × N (own connection each)
//!                                            │
//!                                     dqm_db::Engine
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod instance;
pub mod job;
pub mod lead;
pub mod metrics;
pub mod migrate;
pub mod registry;
pub mod tier;
mod worker;

pub use cancel::CancellationToken;
pub use config::{ConnectionConfig, DqmSettings, QueuesConfig, TierConfig};
pub use error::{ConfigError, JobError, ShutdownTimeout, StartError, SubmitError};
pub use instance::{DqmInstance, InstanceState, InstanceStatus, ShutdownReport};
pub use job::{JobHandle, JobResult};
pub use lead::Readiness;
pub use metrics::TierMetricsSnapshot;
pub use migrate::{Migration, MigrationAction, MigrationStatus};
pub use registry::{Registry, RegistryBuilder, StartOutcome};
pub use tier::{TierKind, TierShutdown, TierState, TierStatus};
