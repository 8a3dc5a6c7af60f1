//! DB2 backend via ODBC.
//!
//! ODBC handles are blocking and not `Send`, so each connection lives on its
//! own thread and the async side talks to it over a channel. Results come
//! back as text; `FromDbValue` parses numeric columns on read.

use crate::dsn::EngineKind;
use crate::engine::{instrumented, split_statements, Engine, EngineConnection, Operation, OperationResult};
use crate::error::{EngineError, Result};
use crate::value::{DbRow, DbValue};
use async_trait::async_trait;
use odbc_api::parameter::VarCharBox;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use std::sync::mpsc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;

const PING_SQL: &str = "SELECT 1 FROM SYSIBM.SYSDUMMY1";

pub struct Db2Engine;

#[async_trait]
impl Engine for Db2Engine {
    fn kind(&self) -> EngineKind {
        EngineKind::Db2
    }

    async fn open(&self, dsn: &str) -> Result<Box<dyn EngineConnection>> {
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let dsn = dsn.trim().to_string();

        let thread = std::thread::Builder::new()
            .name("dqm-db2".to_string())
            .spawn(move || connection_thread(dsn, request_rx, ready_tx))
            .map_err(|e| EngineError::fatal(format!("Failed to spawn DB2 thread: {}", e)))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(Db2Connection {
                requests: Some(request_tx),
                thread: Some(thread),
            })),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::fatal("DB2 connection thread exited during open")),
        }
    }
}

enum Request {
    Run {
        op: Operation,
        reply: oneshot::Sender<Result<OperationResult>>,
    },
    Transaction {
        step: TxStep,
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug, Clone, Copy)]
enum TxStep {
    Begin,
    Commit,
    Rollback,
}

struct Db2Connection {
    requests: Option<mpsc::Sender<Request>>,
    thread: Option<JoinHandle<()>>,
}

impl Db2Connection {
    async fn send(&self, op: Operation) -> Result<OperationResult> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| EngineError::fatal("DB2 connection is closed"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(Request::Run { op, reply: reply_tx })
            .map_err(|_| EngineError::transient("DB2 connection thread is gone"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::transient("DB2 connection thread dropped the request"))?
    }

    async fn transaction(&self, step: TxStep) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| EngineError::fatal("DB2 connection is closed"))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(Request::Transaction { step, reply: reply_tx })
            .map_err(|_| EngineError::transient("DB2 connection thread is gone"))?;
        reply_rx
            .await
            .map_err(|_| EngineError::transient("DB2 connection thread dropped the request"))?
    }
}

#[async_trait]
impl EngineConnection for Db2Connection {
    async fn execute(&mut self, op: &Operation) -> Result<OperationResult> {
        instrumented(EngineKind::Db2, op, self.send(op.clone())).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.send(Operation::query(PING_SQL, Vec::new())).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| EngineError::fatal(format!("DB2 close task failed: {}", e)))?
                .map_err(|_| EngineError::fatal("DB2 connection thread panicked"))?;
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.transaction(TxStep::Begin).await
    }

    async fn commit(&mut self) -> Result<()> {
        self.transaction(TxStep::Commit).await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.transaction(TxStep::Rollback).await
    }
}

fn connection_thread(
    dsn: String,
    requests: mpsc::Receiver<Request>,
    ready: oneshot::Sender<Result<()>>,
) {
    let env = match Environment::new() {
        Ok(env) => env,
        Err(err) => {
            let _ = ready.send(Err(classify(err)));
            return;
        }
    };
    let conn = match env.connect_with_connection_string(&dsn, ConnectionOptions::default()) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(classify(err)));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    // Exits when the async handle drops its sender.
    while let Ok(request) = requests.recv() {
        match request {
            Request::Run { op, reply } => {
                let _ = reply.send(run(&conn, &op));
            }
            Request::Transaction { step, reply } => {
                let _ = reply.send(transaction(&conn, step));
            }
        }
    }
}

fn run(conn: &Connection<'_>, op: &Operation) -> Result<OperationResult> {
    match op {
        Operation::Execute { sql, params } => {
            let params = to_params(params);
            let mut statement = conn.preallocate().map_err(classify)?;
            statement
                .execute(sql, params.as_slice())
                .map_err(classify)?;
            let rows = statement.row_count().map_err(classify)?.unwrap_or(0);
            Ok(OperationResult::Affected {
                rows: rows as u64,
                last_insert_id: None,
            })
        }
        Operation::Query { sql, params } => {
            let params = to_params(params);
            match conn.execute(sql, params.as_slice(), None).map_err(classify)? {
                Some(cursor) => fetch_rows(cursor).map(OperationResult::Rows),
                None => Ok(OperationResult::Rows(Vec::new())),
            }
        }
        Operation::Batch { sql } => {
            for statement in split_statements(sql) {
                conn.execute(&statement, (), None).map_err(classify)?;
            }
            Ok(OperationResult::Done)
        }
    }
}

// ODBC has no BEGIN statement: a transaction is autocommit switched off
// until the next commit or rollback.
fn transaction(conn: &Connection<'_>, step: TxStep) -> Result<()> {
    match step {
        TxStep::Begin => conn.set_autocommit(false).map_err(classify),
        TxStep::Commit => {
            conn.commit().map_err(classify)?;
            conn.set_autocommit(true).map_err(classify)
        }
        TxStep::Rollback => {
            let rolled_back = conn.rollback().map_err(classify);
            conn.set_autocommit(true).map_err(classify)?;
            rolled_back
        }
    }
}

fn to_params(params: &[DbValue]) -> Vec<VarCharBox> {
    params
        .iter()
        .map(|param| match param {
            DbValue::Null => VarCharBox::null(),
            DbValue::Integer(v) => VarCharBox::from_string(v.to_string()),
            DbValue::Real(v) => VarCharBox::from_string(v.to_string()),
            DbValue::Text(v) => VarCharBox::from_string(v.clone()),
            DbValue::Blob(v) => VarCharBox::from_vec(v.clone()),
            DbValue::Boolean(v) => VarCharBox::from_string(if *v { "1" } else { "0" }.to_string()),
        })
        .collect()
}

fn fetch_rows(mut cursor: impl Cursor + ResultSetMetadata) -> Result<Vec<DbRow>> {
    let column_count = cursor.num_result_cols().map_err(classify)?.max(0) as u16;
    let mut columns = Vec::with_capacity(column_count as usize);
    for index in 1..=column_count {
        columns.push(cursor.col_name(index).map_err(classify)?);
    }

    let mut rows = Vec::new();
    let mut buf = Vec::new();
    while let Some(mut row) = cursor.next_row().map_err(classify)? {
        let mut values = Vec::with_capacity(columns.len());
        for index in 1..=column_count {
            buf.clear();
            let present = row.get_text(index, &mut buf).map_err(classify)?;
            values.push(if present {
                DbValue::Text(String::from_utf8_lossy(&buf).into_owned())
            } else {
                DbValue::Null
            });
        }
        rows.push(DbRow::new(columns.clone(), values));
    }
    Ok(rows)
}

fn classify(err: odbc_api::Error) -> EngineError {
    let transient = match &err {
        odbc_api::Error::Diagnostics { record, .. } => is_transient_sqlstate(record.state.as_str()),
        _ => false,
    };
    if transient {
        EngineError::transient(err.to_string())
    } else {
        EngineError::fatal(err.to_string())
    }
}

/// Communication link failures (08xxx), serialization/deadlock rollback
/// (40001) and resource timeouts (57033, HYT00).
fn is_transient_sqlstate(state: &str) -> bool {
    state.starts_with("08") || state == "40001" || state == "57033" || state == "HYT00"
}
