//! Shared logging setup for the DQM launcher and tools.
//!
//! Log lines go to stderr and to `~/.dqm/logs/<app>.log`. Past 10 MiB the
//! file is moved to `<app>.log.old`, so at most two files exist.
//! Operational tooling greps these lines (for example the Lead readiness
//! line and `STARTUP COMPLETE`), so the fmt layer keeps the message text
//! first and appends structured fields after it.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "dqm=info,dqm_queue=info,dqm_db=info,dqm_auth=info";
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
    /// Skip the log file (stderr only). Used by `dqm check`.
    pub console_only: bool,
}

/// Initialize tracing with the capped log file and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose || config.console_only {
        file_filter.clone()
    } else {
        EnvFilter::new("info")
    };

    if config.console_only {
        tracing_subscriber::registry()
            .with(console_layer(console_filter))
            .init();
        return Ok(());
    }

    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let log_file = CappedFile::open(&log_dir, config.app_name, MAX_LOG_FILE_SIZE)
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(console_layer(console_filter))
        .init();

    Ok(())
}

/// Stderr layer, generic over the subscriber it is stacked on.
fn console_layer<S>(filter: EnvFilter) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter)
}

/// DQM home directory: `~/.dqm`, or `$DQM_HOME` when set.
pub fn dqm_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("DQM_HOME") {
        return PathBuf::from(override_path);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".dqm"),
        None => PathBuf::from(".dqm"),
    }
}

/// Logs directory: `~/.dqm/logs`
pub fn logs_dir() -> PathBuf {
    dqm_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log file with one previous generation.
struct CappedFile {
    path: PathBuf,
    previous: PathBuf,
    max_size: u64,
    file: File,
    written: u64,
}

impl CappedFile {
    fn open(dir: &Path, app_name: &str, max_size: u64) -> io::Result<Self> {
        let stem: String = app_name
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect();
        let path = dir.join(format!("{}.log", stem));
        let file = append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            previous: dir.join(format!("{}.log.old", stem)),
            path,
            max_size,
            file,
            written,
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        match fs::remove_file(&self.previous) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        fs::rename(&self.path, &self.previous)?;
        self.file = append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for CappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.roll()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
