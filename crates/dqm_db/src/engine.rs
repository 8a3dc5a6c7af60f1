//! Engine traits, operations, and backend selection.

use crate::dsn::EngineKind;
use crate::error::{EngineError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug_span, Instrument};

/// A unit of work handed to an engine connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Single statement, returns affected rows.
    Execute { sql: String, params: Vec<DbValue> },
    /// Single statement, returns rows.
    Query { sql: String, params: Vec<DbValue> },
    /// Multiple statements without parameters (migrations, bootstrap DDL).
    Batch { sql: String },
}

impl Operation {
    pub fn execute(sql: impl Into<String>, params: Vec<DbValue>) -> Self {
        Operation::Execute {
            sql: sql.into(),
            params,
        }
    }

    pub fn query(sql: impl Into<String>, params: Vec<DbValue>) -> Self {
        Operation::Query {
            sql: sql.into(),
            params,
        }
    }

    pub fn batch(sql: impl Into<String>) -> Self {
        Operation::Batch { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        match self {
            Operation::Execute { sql, .. } | Operation::Query { sql, .. } | Operation::Batch { sql } => sql,
        }
    }

    pub fn params(&self) -> &[DbValue] {
        match self {
            Operation::Execute { params, .. } | Operation::Query { params, .. } => params,
            Operation::Batch { .. } => &[],
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Operation::Execute { .. } => "execute",
            Operation::Query { .. } => "query",
            Operation::Batch { .. } => "batch",
        }
    }
}

/// Outcome of a successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Affected {
        rows: u64,
        last_insert_id: Option<i64>,
    },
    Rows(Vec<DbRow>),
    Done,
}

impl OperationResult {
    /// Rows of a query result. Other variants yield no rows.
    pub fn into_rows(self) -> Vec<DbRow> {
        match self {
            OperationResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn first_row(self) -> Option<DbRow> {
        self.into_rows().into_iter().next()
    }

    pub fn rows_affected(&self) -> u64 {
        match self {
            OperationResult::Affected { rows, .. } => *rows,
            OperationResult::Rows(rows) => rows.len() as u64,
            OperationResult::Done => 0,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            OperationResult::Affected {
                rows,
                last_insert_id,
            } => serde_json::json!({ "affected": rows, "last_insert_id": last_insert_id }),
            OperationResult::Rows(rows) => {
                JsonValue::Array(rows.iter().map(DbRow::to_json).collect())
            }
            OperationResult::Done => serde_json::json!({ "done": true }),
        }
    }
}

/// A database engine: turns a DSN into connections.
#[async_trait]
pub trait Engine: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    async fn open(&self, dsn: &str) -> Result<Box<dyn EngineConnection>>;
}

/// One open connection. Owned by exactly one worker at a time.
#[async_trait]
pub trait EngineConnection: Send {
    async fn execute(&mut self, op: &Operation) -> Result<OperationResult>;

    /// Cheap liveness check used by idle workers.
    async fn ping(&mut self) -> Result<()>;

    /// Close the connection. Further calls fail with a Fatal error.
    async fn close(&mut self) -> Result<()>;

    /// Open an explicit transaction. Backends with isolation levels use
    /// READ COMMITTED.
    async fn begin(&mut self) -> Result<()> {
        self.execute(&Operation::batch("BEGIN")).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute(&Operation::batch("COMMIT")).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute(&Operation::batch("ROLLBACK")).await.map(|_| ())
    }
}

/// Boxed, `Send` future borrowed for `'a`.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Select the engine implementation for a kind.
///
/// Kinds whose cargo feature is disabled resolve to an engine that fails
/// every `open` with a Fatal "not compiled in" error.
pub fn engine_for(kind: EngineKind) -> Arc<dyn Engine> {
    match kind {
        #[cfg(feature = "sqlite")]
        EngineKind::Sqlite => Arc::new(crate::sqlite::SqliteEngine),
        #[cfg(feature = "postgres")]
        EngineKind::Postgres => Arc::new(crate::postgres::PostgresEngine),
        #[cfg(feature = "mysql")]
        EngineKind::Mysql => Arc::new(crate::mysql::MysqlEngine),
        #[cfg(feature = "db2")]
        EngineKind::Db2 => Arc::new(crate::db2::Db2Engine),
        #[allow(unreachable_patterns)]
        other => Arc::new(UnavailableEngine { kind: other }),
    }
}

struct UnavailableEngine {
    kind: EngineKind,
}

#[async_trait]
impl Engine for UnavailableEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn open(&self, _dsn: &str) -> Result<Box<dyn EngineConnection>> {
        Err(EngineError::not_compiled(
            self.kind.as_str(),
            self.kind.feature(),
        ))
    }
}

/// Run one backend operation inside a `db.*` span and record its duration.
pub(crate) async fn instrumented<F>(kind: EngineKind, op: &Operation, fut: F) -> Result<OperationResult>
where
    F: Future<Output = Result<OperationResult>>,
{
    let sql = op.sql();
    let sql_hash = hash_sql(sql);
    let span = match op {
        Operation::Query { .. } => debug_span!(
            "db.query",
            engine = kind.as_str(),
            op = sql_op_name(sql),
            sql_hash = %sql_hash,
            duration_ms = tracing::field::Empty
        ),
        Operation::Execute { .. } => debug_span!(
            "db.exec",
            engine = kind.as_str(),
            op = sql_op_name(sql),
            sql_hash = %sql_hash,
            duration_ms = tracing::field::Empty
        ),
        Operation::Batch { .. } => debug_span!(
            "db.exec_batch",
            engine = kind.as_str(),
            op = "BATCH",
            sql_hash = %sql_hash,
            duration_ms = tracing::field::Empty
        ),
    };
    let start = Instant::now();
    let result = fut.instrument(span.clone()).await;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    result
}

pub(crate) fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

pub(crate) fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit: stable and low-cardinality for log correlation.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

/// Split a multi-statement script on `;` terminators, skipping blanks and
/// `--` comment-only fragments. Used by backends without native batch support.
pub(crate) fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|stmt| {
            stmt.lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .map(|stmt| stmt.trim().to_string())
        .filter(|stmt| !stmt.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_name_is_first_keyword() {
        assert_eq!(sql_op_name("  SELECT * FROM t"), "SELECT");
        assert_eq!(sql_op_name(""), "unknown");
    }

    #[test]
    fn sql_hash_is_stable() {
        assert_eq!(hash_sql("SELECT 1"), hash_sql("SELECT 1"));
        assert_ne!(hash_sql("SELECT 1"), hash_sql("SELECT 2"));
        assert_eq!(hash_sql("").len(), 16);
    }

    #[test]
    fn split_statements_drops_comments_and_blanks() {
        let script = "-- header\nCREATE TABLE a (id INT);\n\n;INSERT INTO a VALUES (1);";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE a (id INT)".to_string(), "INSERT INTO a VALUES (1)".to_string()]
        );
    }

    #[test]
    fn operation_accessors() {
        let op = Operation::query("SELECT ?", vec![DbValue::from(1_i64)]);
        assert_eq!(op.sql(), "SELECT ?");
        assert_eq!(op.params().len(), 1);
        assert_eq!(op.kind_name(), "query");
        assert!(Operation::batch("SELECT 1").params().is_empty());
    }

    #[test]
    fn result_helpers() {
        let rows = OperationResult::Rows(vec![DbRow::new(
            vec!["n".into()],
            vec![DbValue::from(1_i64)],
        )]);
        assert_eq!(rows.rows_affected(), 1);
        assert_eq!(rows.to_json()[0]["n"], 1);
        let affected = OperationResult::Affected {
            rows: 2,
            last_insert_id: Some(9),
        };
        assert_eq!(affected.to_json()["last_insert_id"], 9);
        assert!(affected.into_rows().is_empty());
    }

    #[cfg(not(feature = "db2"))]
    #[tokio::test]
    async fn disabled_backend_fails_fatal_at_open() {
        let engine = engine_for(EngineKind::Db2);
        assert_eq!(engine.kind(), EngineKind::Db2);
        let err = match engine.open("DATABASE=SAMPLE;").await {
            Ok(_) => panic!("db2 should not be compiled in"),
            Err(err) => err,
        };
        assert!(err.is_fatal());
        assert!(err.message().contains("not compiled in"));
    }
}
