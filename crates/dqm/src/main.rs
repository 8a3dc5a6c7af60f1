//! DQM launcher.
//!
//! - `dqm run --config <file>`: start every connection concurrently, log
//!   `STARTUP COMPLETE`, serve until SIGINT/SIGTERM, then drain and report
//!   per connection.
//! - `dqm check --config <file>`: validate the file and print the tier plan.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dqm_auth::{demo_migrations, DEMO_SCHEMA};
use dqm_db::mask_dsn;
use dqm_logging::LogConfig;
use dqm_queue::instance::LEAD_TAGS;
use dqm_queue::tier::queue_label;
use dqm_queue::{Registry, RegistryBuilder, ShutdownReport, StartOutcome, TierKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod config;

use config::DqmFile;

#[derive(Parser, Debug)]
#[command(name = "dqm", about = "Database Queue Manager", version)]
struct Cli {
    /// Mirror debug logging to stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start every configured connection and serve until interrupted
    Run {
        /// Configuration file (TOML)
        #[arg(short, long, env = "DQM_CONFIG")]
        config: PathBuf,
    },

    /// Validate a configuration file and print each connection's tier plan
    Check {
        /// Configuration file (TOML)
        #[arg(short, long, env = "DQM_CONFIG")]
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let console_only = matches!(cli.command, Commands::Check { .. });
    if let Err(err) = dqm_logging::init_logging(LogConfig {
        app_name: "dqm",
        verbose: cli.verbose,
        console_only,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    let result = match cli.command {
        Commands::Run { config } => run(&config),
        Commands::Check { config, json } => check(&config, json),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn build_registry(file: DqmFile) -> Result<Registry> {
    RegistryBuilder::new(file.settings)
        .schema(DEMO_SCHEMA, demo_migrations)
        .build(file.connections)
        .context("Failed to build connection registry")
}

fn run(path: &Path) -> Result<ExitCode> {
    let file = config::load(path)?;
    info!(
        config = %path.display(),
        connections = file.connections.len(),
        "Starting Database Queue Manager"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dqm-runtime")
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(serve(file))
}

async fn serve(file: DqmFile) -> Result<ExitCode> {
    let drain_timeout_ms = file.settings.drain_timeout_ms;
    let registry = Arc::new(build_registry(file)?);
    let mut signals = install_signal_handlers()?;

    match startup(&registry, &mut signals).await? {
        Some(outcomes) => {
            let ready = outcomes.iter().filter(|o| o.ready).count();
            for outcome in outcomes.iter().filter(|o| !o.ready) {
                warn!(connection = %outcome.connection, "Connection not ready");
            }
            info!(ready, total = outcomes.len(), "STARTUP COMPLETE");

            if signals.recv().await.is_none() {
                warn!("Signal handler exited, shutting down");
            }
        }
        None => warn!("Interrupted during startup"),
    }

    // A second signal skips the drain.
    tokio::spawn(async move {
        if signals.recv().await.is_some() {
            warn!("Received second signal, exiting immediately");
            std::process::exit(130);
        }
    });

    info!("Initiating graceful shutdown (drain timeout: {}ms)...", drain_timeout_ms);
    let reports = registry.shutdown_all().await;
    let clean = reports.iter().all(|r| r.clean);
    for report in &reports {
        log_report(report);
    }
    info!("Shutdown complete");

    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Start every connection unless a signal arrives first. `None` means
/// interrupted: connections still bootstrapping are left to the shutdown
/// that follows, which bounds them by the drain timeout.
async fn startup(
    registry: &Arc<Registry>,
    signals: &mut mpsc::UnboundedReceiver<()>,
) -> Result<Option<Vec<StartOutcome>>> {
    let mut starting = {
        let registry = Arc::clone(registry);
        tokio::spawn(async move { registry.start_all().await })
    };
    tokio::select! {
        biased;
        Some(()) = signals.recv() => Ok(None),
        joined = &mut starting => joined.map(Some).context("Startup task failed"),
    }
}

fn log_report(report: &ShutdownReport) {
    if report.clean {
        info!(connection = %report.connection, "Connection stopped cleanly");
        return;
    }
    for tier in &report.tiers {
        if let Some(timeout) = &tier.timeout {
            warn!(connection = %report.connection, "{}", timeout);
        }
    }
}

/// Forward SIGINT/SIGTERM (Ctrl+C on Windows) into the runtime.
fn install_signal_handlers() -> Result<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();

    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        std::thread::Builder::new()
            .name("dqm-signals".to_string())
            .spawn(move || {
                for sig in signals.forever() {
                    info!("Received signal {}, initiating shutdown...", sig);
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            })
            .context("Failed to spawn signal thread")?;
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            let _ = tx.send(());
        })?;
    }

    Ok(rx)
}

#[derive(Debug, Serialize)]
struct TierPlan {
    tier: TierKind,
    workers: u32,
    labels: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ConnectionPlan {
    name: String,
    engine: String,
    dsn: String,
    automigrate: bool,
    tiers: Vec<TierPlan>,
}

/// Worker labels exactly as a started instance assigns them.
fn plan(file: &DqmFile) -> Result<Vec<ConnectionPlan>> {
    let mut plans = Vec::with_capacity(file.connections.len());
    for connection in &file.connections {
        let mut number = 1;
        let tiers = connection
            .tier_plan()
            .into_iter()
            .map(|(tier, workers)| {
                let labels = if tier.is_lead() {
                    vec![queue_label(&connection.name, 0, LEAD_TAGS)]
                } else {
                    (0..workers)
                        .map(|_| {
                            let label = queue_label(&connection.name, number, &tier.tag().to_string());
                            number += 1;
                            label
                        })
                        .collect()
                };
                TierPlan { tier, workers, labels }
            })
            .collect();
        plans.push(ConnectionPlan {
            name: connection.name.clone(),
            engine: connection.engine_kind()?.to_string(),
            dsn: mask_dsn(&connection.dsn),
            automigrate: connection.automigrate,
            tiers,
        });
    }
    Ok(plans)
}

fn check(path: &Path, json: bool) -> Result<ExitCode> {
    let file = config::load(path)?;
    let plans = plan(&file)?;
    // Resolves schemas and reads migration directories without connecting.
    build_registry(file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(ExitCode::SUCCESS);
    }

    for plan in &plans {
        println!("{} ({}) {}", plan.name, plan.engine, plan.dsn);
        if plan.automigrate {
            println!("  automigrate: on");
        }
        for tier in &plan.tiers {
            println!("  {:<6} {:>2}  {}", tier.tier.to_string(), tier.workers, tier.labels.join(", "));
        }
    }
    println!("Configuration OK: {} connection(s)", plans.len());
    Ok(ExitCode::SUCCESS)
}
