//! SQLite backend via sqlx.

use crate::dsn::EngineKind;
use crate::engine::{instrumented, BoxFuture, Engine, EngineConnection, Operation, OperationResult};
use crate::error::{classify_sqlx, EngineError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use sqlx::error::DatabaseError;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteEngine;

#[async_trait]
impl Engine for SqliteEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Sqlite
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn EngineConnection>> {
        let conn = connect_options(dsn)?.connect().await.map_err(classify)?;
        Ok(Box::new(SqliteEngineConnection { conn: Some(conn) }))
    }
}

/// Accepts sqlx URLs (`sqlite:path`, `sqlite::memory:`) and bare file paths.
fn connect_options(dsn: &str) -> Result<SqliteConnectOptions> {
    let trimmed = dsn.trim();
    if trimmed.is_empty() {
        return Err(EngineError::fatal("SQLite DSN is empty"));
    }
    let options = if trimmed.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(trimmed)
            .map_err(|e| EngineError::fatal(format!("Invalid SQLite DSN: {}", e)))?
    } else {
        SqliteConnectOptions::new().filename(trimmed)
    };
    Ok(options.create_if_missing(true).busy_timeout(BUSY_TIMEOUT))
}

struct SqliteEngineConnection {
    conn: Option<SqliteConnection>,
}

impl SqliteEngineConnection {
    fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::fatal("SQLite connection is closed"))
    }
}

#[async_trait]
impl EngineConnection for SqliteEngineConnection {
    async fn execute(&mut self, op: &Operation) -> Result<OperationResult> {
        let conn = self.conn()?;
        instrumented(EngineKind::Sqlite, op, run(conn, op)).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.conn()?.ping().await.map_err(classify)
    }

    async fn close(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(classify),
            None => Ok(()),
        }
    }
}

// Boxed so the Send bound is checked against one concrete connection
// lifetime; sqlx executors fail the higher-ranked check otherwise.
fn run<'a>(conn: &'a mut SqliteConnection, op: &'a Operation) -> BoxFuture<'a, Result<OperationResult>> {
    Box::pin(async move {
        match op {
            Operation::Execute { sql, params } => {
                let query = bind(sqlx::query(sql.as_str()), params);
                let result = conn
                    .execute(query)
                    .await
                    .map_err(classify)?;
                let rowid = result.last_insert_rowid();
                Ok(OperationResult::Affected {
                    rows: result.rows_affected(),
                    last_insert_id: (result.rows_affected() > 0 && rowid != 0).then_some(rowid),
                })
            }
            Operation::Query { sql, params } => {
                let query = bind(sqlx::query(sql.as_str()), params);
                let rows = conn
                    .fetch_all(query)
                    .await
                    .map_err(classify)?;
                rows.iter()
                    .map(decode_row)
                    .collect::<Result<Vec<_>>>()
                    .map(OperationResult::Rows)
            }
            Operation::Batch { sql } => {
                conn.execute(sqlx::raw_sql(sql.as_str()))
                    .await
                    .map_err(classify)?;
                Ok(OperationResult::Done)
            }
        }
    })
}

fn bind<'q>(mut query: SqliteQuery<'q>, params: &[DbValue]) -> SqliteQuery<'q> {
    for param in params {
        query = match param {
            DbValue::Null => query.bind(None::<String>),
            DbValue::Integer(v) => query.bind(*v),
            DbValue::Real(v) => query.bind(*v),
            DbValue::Text(v) => query.bind(v.clone()),
            DbValue::Blob(v) => query.bind(v.clone()),
            DbValue::Boolean(v) => query.bind(*v),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<DbRow> {
    let columns: Vec<String> = row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let values = (0..columns.len())
        .map(|index| decode_value(row, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(DbRow::new(columns, values))
}

// SQLite is dynamically typed: dispatch on the storage class of the value,
// not the declared column type.
fn decode_value(row: &SqliteRow, index: usize) -> Result<DbValue> {
    let type_name = {
        let raw = row.try_get_raw(index).map_err(classify)?;
        if raw.is_null() {
            return Ok(DbValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let value = match type_name.as_str() {
        "INTEGER" => DbValue::Integer(row.try_get_unchecked::<i64, _>(index).map_err(classify)?),
        "BOOLEAN" => DbValue::Boolean(row.try_get_unchecked::<bool, _>(index).map_err(classify)?),
        "REAL" => DbValue::Real(row.try_get_unchecked::<f64, _>(index).map_err(classify)?),
        "BLOB" => DbValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index).map_err(classify)?),
        _ => DbValue::Text(row.try_get_unchecked::<String, _>(index).map_err(classify)?),
    };
    Ok(value)
}

fn classify(err: sqlx::Error) -> EngineError {
    classify_sqlx(err, is_transient_db_error)
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn is_transient_db_error(err: &(dyn DatabaseError + 'static)) -> bool {
    err.code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}
