//! Engine adapters for the database queue manager.
//!
//! One [`Engine`] implementation per backend, selected once per connection
//! with [`engine_for`]:
//!
//! - `sqlite`   (default) sqlx, file or `sqlite::memory:`
//! - `postgres` (default) sqlx
//! - `mysql`    (default) sqlx, MySQL and MariaDB
//! - `db2`      ODBC through `odbc-api`, needs the IBM driver at runtime
//!
//! Callers above this crate never branch on the engine: they hand an
//! [`Operation`] to an [`EngineConnection`] and get an [`OperationResult`]
//! or an [`EngineError`] classified as Transient or Fatal.

pub mod dsn;
pub mod engine;
pub mod error;
pub mod value;

#[cfg(feature = "db2")]
mod db2;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use dsn::{mask_dsn, EngineKind};
pub use engine::{engine_for, Engine, EngineConnection, Operation, OperationResult};
pub use error::{EngineError, Result};
pub use value::{DbRow, DbValue, FromDbValue};

/// Whether the backend for `kind` was compiled into this build.
pub fn is_compiled(kind: EngineKind) -> bool {
    match kind {
        EngineKind::Sqlite => cfg!(feature = "sqlite"),
        EngineKind::Postgres => cfg!(feature = "postgres"),
        EngineKind::Mysql => cfg!(feature = "mysql"),
        EngineKind::Db2 => cfg!(feature = "db2"),
    }
}
