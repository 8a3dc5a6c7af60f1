//! MySQL / MariaDB backend via sqlx.

use crate::dsn::EngineKind;
use crate::engine::{instrumented, BoxFuture, Engine, EngineConnection, Operation, OperationResult};
use crate::error::{classify_sqlx, EngineError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use sqlx::error::DatabaseError;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, MySql, Row, TypeInfo, ValueRef};
use std::str::FromStr;

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;

pub struct MysqlEngine;

#[async_trait]
impl Engine for MysqlEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Mysql
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn EngineConnection>> {
        let url = normalize_dsn(dsn);
        let options = MySqlConnectOptions::from_str(&url)
            .map_err(|e| EngineError::fatal(format!("Invalid MySQL DSN: {}", e)))?;
        let conn = options.connect().await.map_err(classify)?;
        Ok(Box::new(MySqlEngineConnection { conn: Some(conn) }))
    }
}

fn normalize_dsn(dsn: &str) -> String {
    let trimmed = dsn.trim();
    match trimmed.strip_prefix("mariadb://") {
        Some(rest) => format!("mysql://{}", rest),
        None => trimmed.to_string(),
    }
}

struct MySqlEngineConnection {
    conn: Option<MySqlConnection>,
}

impl MySqlEngineConnection {
    fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| EngineError::fatal("MySQL connection is closed"))
    }
}

#[async_trait]
impl EngineConnection for MySqlEngineConnection {
    async fn execute(&mut self, op: &Operation) -> Result<OperationResult> {
        let conn = self.conn()?;
        instrumented(EngineKind::Mysql, op, run(conn, op)).await
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
        self.execute(&Operation::batch("SET TRANSACTION ISOLATION LEVEL READ COMMITTED; START TRANSACTION"))
            .await
            .map(|_| ())
    }
}

// Boxed so the Send bound is checked against one concrete connection
// lifetime; sqlx executors fail the higher-ranked check otherwise.
fn run<'a>(conn: &'a mut MySqlConnection, op: &'a Operation) -> BoxFuture<'a, Result<OperationResult>> {
    Box::pin(async move {
        match op {
            Operation::Execute { sql, params } => {
                let query = bind(sqlx::query(sql.as_str()), params);
                let result = conn
                    .execute(query)
                    .await
                    .map_err(classify)?;
                let id = result.last_insert_id();
                Ok(OperationResult::Affected {
                    rows: result.rows_affected(),
                    last_insert_id: (id != 0).then_some(id as i64),
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

fn bind<'q>(mut query: MySqlQuery<'q>, params: &[DbValue]) -> MySqlQuery<'q> {
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

fn decode_row(row: &MySqlRow) -> Result<DbRow> {
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

fn decode_value(row: &MySqlRow, index: usize) -> Result<DbValue> {
    let type_name = {
        let raw = row.try_get_raw(index).map_err(classify)?;
        if raw.is_null() {
            return Ok(DbValue::Null);
        }
        raw.type_info().name().to_ascii_uppercase()
    };

    if type_name.ends_with("UNSIGNED") {
        let value = row.try_get_unchecked::<u64, _>(index).map_err(classify)?;
        return Ok(match i64::try_from(value) {
            Ok(v) => DbValue::Integer(v),
            Err(_) => DbValue::Text(value.to_string()),
        });
    }

    let value = match type_name.as_str() {
        "BOOLEAN" => DbValue::Boolean(row.try_get_unchecked::<bool, _>(index).map_err(classify)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            DbValue::Integer(row.try_get_unchecked::<i64, _>(index).map_err(classify)?)
        }
        "FLOAT" => DbValue::Real(row.try_get_unchecked::<f32, _>(index).map_err(classify)? as f64),
        "DOUBLE" => DbValue::Real(row.try_get_unchecked::<f64, _>(index).map_err(classify)?),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BIT"
        | "GEOMETRY" => DbValue::Blob(row.try_get_unchecked::<Vec<u8>, _>(index).map_err(classify)?),
        "TIMESTAMP" => DbValue::Text(
            row.try_get_unchecked::<chrono::DateTime<chrono::Utc>, _>(index)
                .map_err(classify)?
                .to_rfc3339(),
        ),
        "DATETIME" => DbValue::Text(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(index)
                .map_err(classify)?
                .to_string(),
        ),
        "DATE" => DbValue::Text(
            row.try_get_unchecked::<chrono::NaiveDate, _>(index)
                .map_err(classify)?
                .to_string(),
        ),
        // DECIMAL, JSON, ENUM, SET and character types arrive as text.
        _ => DbValue::Text(row.try_get_unchecked::<String, _>(index).map_err(classify)?),
    };
    Ok(value)
}

fn classify(err: sqlx::Error) -> EngineError {
    classify_sqlx(err, is_transient_db_error)
}

fn is_transient_db_error(err: &(dyn DatabaseError + 'static)) -> bool {
    err.try_downcast_ref::<MySqlDatabaseError>()
        .map(|e| is_transient_error_number(e.number()))
        .unwrap_or(false)
}

/// Too many connections (1040), lock wait timeout (1205), deadlock (1213),
/// server gone away (2006), lost connection (2013).
fn is_transient_error_number(number: u16) -> bool {
    matches!(number, 1040 | 1205 | 1213 | 2006 | 2013)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_number_classification() {
        assert!(is_transient_error_number(1213));
        assert!(is_transient_error_number(2013));
        assert!(!is_transient_error_number(1045));
        assert!(!is_transient_error_number(1062));
    }

    #[test]
    fn mariadb_scheme_is_rewritten() {
        assert_eq!(normalize_dsn("mariadb://u:p@h/db"), "mysql://u:p@h/db");
        assert_eq!(normalize_dsn(" mysql://h/db "), "mysql://h/db");
    }
}
