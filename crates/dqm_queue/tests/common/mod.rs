#![allow(dead_code)]

use async_trait::async_trait;
use dqm_db::{DbRow, DbValue, Engine, EngineConnection, EngineError, EngineKind, Operation, OperationResult};
use dqm_queue::DqmSettings;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine whose behaviour is driven by the SQL text:
///
/// - `sleep:<ms>`        waits, then succeeds
/// - `transient`         fails Transient while the budget lasts, then succeeds
/// - `always-transient`  always fails Transient
/// - `fatal`             always fails Fatal
/// - `BEGIN` / `COMMIT` / `ROLLBACK` are logged like any other batch
/// - anything else       succeeds (queries return one row `value = 1`)
#[derive(Clone)]
pub struct ScriptedEngine {
    kind: EngineKind,
    state: Arc<ScriptState>,
}

#[derive(Default)]
pub struct ScriptState {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    open_failures: Mutex<VecDeque<EngineError>>,
    fatal_opens_after: Mutex<Option<usize>>,
    open_delay_ms: AtomicU64,
    transient_budget: AtomicU32,
    pub fail_pings: AtomicBool,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Arc::new(ScriptState::default()),
        }
    }

    /// Fail the next opens with these errors, in order.
    pub fn with_open_failures(self, errors: Vec<EngineError>) -> Self {
        self.state.open_failures.lock().unwrap().extend(errors);
        self
    }

    /// Every open after the first `n` fails Fatal.
    pub fn with_fatal_opens_after(self, n: usize) -> Self {
        *self.state.fatal_opens_after.lock().unwrap() = Some(n);
        self
    }

    /// Every open waits this long before answering.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.state.open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn unreachable(kind: EngineKind) -> Self {
        Self::new(kind).with_fatal_opens_after(0)
    }

    pub fn with_transient_budget(self, n: u32) -> Self {
        self.state.transient_budget.store(n, Ordering::SeqCst);
        self
    }

    pub fn state(&self) -> Arc<ScriptState> {
        Arc::clone(&self.state)
    }

    pub fn arc(&self) -> Arc<dyn Engine> {
        Arc::new(self.clone())
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn open(&self, _dsn: &str) -> dqm_db::Result<Box<dyn EngineConnection>> {
        let count = self.state.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(err) = self.state.open_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(limit) = *self.state.fatal_opens_after.lock().unwrap() {
            if count >= limit {
                return Err(EngineError::fatal("password authentication failed"));
            }
        }
        Ok(Box::new(ScriptedConnection {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

struct ScriptedConnection {
    state: Arc<ScriptState>,
    open: bool,
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    async fn execute(&mut self, op: &Operation) -> dqm_db::Result<OperationResult> {
        if !self.open {
            return Err(EngineError::fatal("connection closed"));
        }
        let sql = op.sql().trim().to_string();
        self.state.executed.lock().unwrap().push(sql.clone());

        if let Some(ms) = sql.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(OperationResult::Done);
        }
        match sql.as_str() {
            "transient" => {
                let took = self
                    .state
                    .transient_budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if took {
                    return Err(EngineError::transient("connection reset by peer"));
                }
                return Ok(OperationResult::Done);
            }
            "always-transient" => return Err(EngineError::transient("deadlock detected")),
            "fatal" => return Err(EngineError::fatal("syntax error at or near \"fatal\"")),
            _ => {}
        }

        Ok(match op {
            Operation::Query { .. } if sql.contains("MAX(version)") => OperationResult::Rows(vec![DbRow::new(
                vec!["installed".to_string()],
                vec![DbValue::Null],
            )]),
            Operation::Query { .. } => OperationResult::Rows(vec![DbRow::new(
                vec!["value".to_string()],
                vec![DbValue::from(1_i64)],
            )]),
            Operation::Execute { .. } => OperationResult::Affected {
                rows: 1,
                last_insert_id: None,
            },
            Operation::Batch { .. } => OperationResult::Done,
        })
    }

    async fn ping(&mut self) -> dqm_db::Result<()> {
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(EngineError::transient("server closed the connection"));
        }
        Ok(())
    }

    async fn close(&mut self) -> dqm_db::Result<()> {
        if self.open {
            self.open = false;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Fast settings for tests.
pub fn settings() -> DqmSettings {
    DqmSettings {
        queue_capacity: 64,
        submit_timeout_ms: 200,
        drain_timeout_ms: 1_000,
        max_retries: 3,
        retry_backoff_ms: 5,
        connect_attempts: 3,
        heartbeat_interval_secs: 30,
        connect_timeout_ms: 1_000,
        query_timeout_ms: 30_000,
    }
}

/// In-memory log sink for asserting on emitted lines.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.contents().lines().filter(|line| line.contains(needle)).count()
    }
}

impl Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture INFO+ logs for the current thread. Use with the current-thread
/// test runtime so spawned workers log into the same subscriber.
pub fn capture_logs() -> (LogCapture, tracing::subscriber::DefaultGuard) {
    let capture = LogCapture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    (capture, tracing::subscriber::set_default(subscriber))
}
