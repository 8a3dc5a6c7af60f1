//! PostgreSQL backend via sqlx.

use crate::dsn::EngineKind;
use crate::engine::{instrumented, BoxFuture, Engine, EngineConnection, Operation, OperationResult};
use crate::error::{classify_sqlx, EngineError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use sqlx::error::DatabaseError;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Postgres, Row, TypeInfo, ValueRef};
use std::str::FromStr;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

pub struct PostgresEngine;

#[async_trait]
impl Engine for PostgresEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgres
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn EngineConnection>> {
        let options = PgConnectOptions::from_str(dsn.trim())
            .map_err(|e| EngineError::fatal(format!("Invalid PostgreSQL DSN: {}", e)))?;
        let conn = options.connect().await.map_err(classify)?;
        Ok(Box::new(PgEngineConnection { conn: Some(conn) }))
    }
}

struct PgEngineConnection {
    conn: Option<PgConnection>,
}

impl PgEngineConnection {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::fatal("PostgreSQL connection is closed"))
    }
}

#[async_trait]
impl EngineConnection for PgEngineConnection {
    async fn execute(&mut self, op: &Operation) -> Result<OperationResult> {
        let conn = self.conn()?;
        instrumented(EngineKind::Postgres, op, run(conn, op)).await
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

    async fn begin(&mut self) -> Result<()> {
        self.execute(&Operation::batch("BEGIN ISOLATION LEVEL READ COMMITTED"))
            .await
            .map(|_| ())
    }
}

// Boxed so the Send bound is checked against one concrete connection
// lifetime; sqlx executors fail the higher-ranked check otherwise.
fn run<'a>(conn: &'a mut PgConnection, op: &'a Operation) -> BoxFuture<'a, Result<OperationResult>> {
    Box::pin(async move {
        match op {
            Operation::Execute { sql, params } => {
                let query = bind(sqlx::query(sql.as_str()), params);
                let result = conn
                    .execute(query)
                    .await
                    .map_err(classify)?;
                // Callers wanting generated keys use `INSERT ... RETURNING` as a query.
                Ok(OperationResult::Affected {
                    rows: result.rows_affected(),
                    last_insert_id: None,
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

fn bind<'q>(mut query: PgQuery<'q>, params: &[DbValue]) -> PgQuery<'q> {
    for param in params {
        query = match param {
            // Untyped NULL is sent as TEXT; cast in SQL when the column differs.
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

fn decode_row(row: &PgRow) -> Result<DbRow> {
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

fn decode_value(row: &PgRow, index: usize) -> Result<DbValue> {
    let type_name = {
        let raw = row.try_get_raw(index).map_err(classify)?;
        if raw.is_null() {
            return Ok(DbValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    let value = match type_name.as_str() {
        "BOOL" => DbValue::Boolean(row.try_get_unchecked::<bool, _>(index).map_err(classify)?),
        "INT2" => DbValue::Integer(row.try_get_unchecked::<i16, _>(index).map_err(classify)? as i64),
        "INT4" => DbValue::Integer(row.try_get_unchecked::<i32, _>(index).map_err(classify)? as i64),
        "INT8" => DbValue::Integer(row.try_get_unchecked::<i64, _>(index).map_err(classify)?),
        "FLOAT4" => DbValue::Real(row.try_get_unchecked::<f32, _>(index).map_err(classify)? as f64),
        "FLOAT8" => DbValue::Real(row.try_get_unchecked::<f64, _>(index).map_err(classify)?),
        "BYTEA" => DbValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index).map_err(classify)?),
        "TIMESTAMPTZ" => DbValue::Text(
            row.try_get_unchecked::<chrono::DateTime<chrono::Utc>, _>(index)
                .map_err(classify)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => DbValue::Text(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)
                .map_err(classify)?
                .to_string(),
        ),
        "DATE" => DbValue::Text(
            row.try_get_unchecked::<chrono::NaiveDate, _>(index)
                .map_err(classify)?
                .to_string(),
        ),
        other => DbValue::Text(row.try_get::<String, _>(index).map_err(|_| {
            EngineError::fatal(format!(
                "Unsupported PostgreSQL column type {} (cast to text in SQL)",
                other
            ))
        })?),
    };
    Ok(value)
}

fn classify(err: sqlx::Error) -> EngineError {
    classify_sqlx(err, is_transient_db_error)
}

/// SQLSTATE classes worth retrying: connection exceptions (08), serialization
/// failure and deadlock (40001, 40P01), operator intervention (57P0x) and
/// insufficient resources (53).
fn is_transient_db_error(err: &(dyn DatabaseError + 'static)) -> bool {
    match err.code() {
        Some(code) => is_transient_sqlstate(&code),
        None => false,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code == "40001"
        || code == "40P01"
        || code.starts_with("57P0")
        || code.starts_with("53")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert!(is_transient_sqlstate("08006"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("57P01"));
        assert!(is_transient_sqlstate("53300"));
        assert!(!is_transient_sqlstate("28P01"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42601"));
    }

    #[tokio::test]
    async fn malformed_dsn_is_fatal() {
        let err = match PostgresEngine.open("postgresql://host:notaport/db").await {
            Ok(_) => panic!("malformed DSN should not connect"),
            Err(err) => err,
        };
        assert!(err.is_fatal());
    }
}
