use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sluice_core::config::{load_pipeline, QuarantineSpec, WarehouseSpec};
use sluice_core::{Checkpoint, CheckpointStore, Loader, Orchestrator, PartitionKey, PipelineSpec, WarehouseStats};
use sluice_io::{pg, PostgresCheckpointStore, PostgresWarehouse};
use sluice_tx::TransformEngine;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

#[derive(Parser, Debug)]
#[command(
    name = "sluice",
    about = "Resumable batch ETL: extract, transform and load with checkpointed progress",
    version
)]
struct Cli {
    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline until every partition is drained, failed or cancelled.
    ///
    /// Prints the run report as JSON on stdout. Exits 0 on success, 1 when
    /// any partition failed, 130 when interrupted.
    Run {
        /// Pipeline YAML
        pipeline: PathBuf,
    },
    /// Create the warehouse, checkpoint, run and quarantine tables.
    InitDb {
        /// Pipeline YAML
        pipeline: PathBuf,
    },
    /// Show stored checkpoints and warehouse row counts.
    Status {
        /// Pipeline YAML
        pipeline: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

const LOG_FILE_PREFIX: &str = "sluice.log";

fn init_tracing(format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    // stdout carries the run report, so logs go to stderr
    layers.push(match format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    });

    let guard = log_dir.map(|dir| {
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
        layers.push(fmt::layer().json().with_ansi(false).with_writer(writer).boxed());
        guard
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(layers).with(filter).init();
    guard
}

/// Cancel the token on Ctrl-C or SIGTERM.
fn cancel_on_shutdown(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Shutdown requested; finishing in-flight batches");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_pipeline(spec: PipelineSpec) -> Result<i32> {
    let transform = Arc::new(TransformEngine::from_spec(&spec));
    let wiring = sluice_io::build_components(&spec, transform)
        .await
        .context("Failed to set up pipeline components")?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let report = Orchestrator::new(&spec, wiring.components)
        .run(cancel)
        .await
        .context("Run aborted")?;

    if let Some(pool) = &wiring.pool {
        if let Err(e) = pg::record_run(pool, &report).await {
            warn!(error = %format!("{e:#}"), "Run finished but could not be recorded");
        }
    }

    println!("{}", report.to_json_pretty().context("Failed to render run report")?);
    Ok(report.exit_code())
}

async fn init_db(spec: &PipelineSpec) -> Result<()> {
    let WarehouseSpec::Postgres(pg_spec) = &spec.warehouse else {
        info!("Memory warehouse has no tables to create");
        return Ok(());
    };
    let quarantine_table = match &spec.quarantine {
        QuarantineSpec::Postgres { table } => Some(table.as_str()),
        _ => None,
    };
    let pool = pg::connect(pg_spec).await?;
    pg::ensure_schema(&pool, &pg_spec.table, quarantine_table).await?;
    info!(table = %pg_spec.table, "Database schema ready");
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    pipeline: String,
    warehouse: WarehouseStats,
    checkpoints: Vec<CheckpointRow>,
}

#[derive(Serialize)]
struct CheckpointRow {
    #[serde(flatten)]
    partition: PartitionKey,
    #[serde(flatten)]
    checkpoint: Checkpoint,
}

async fn status(spec: &PipelineSpec) -> Result<()> {
    let WarehouseSpec::Postgres(pg_spec) = &spec.warehouse else {
        anyhow::bail!("status needs a postgres warehouse; the memory warehouse keeps nothing between runs");
    };
    let pool = pg::connect(pg_spec).await?;
    let warehouse = PostgresWarehouse::new(pool.clone(), &pg_spec.table)?;
    let checkpoints = PostgresCheckpointStore::new(pool);

    let stats = warehouse.stats().await.context("Failed to read warehouse stats")?;
    let mut rows = checkpoints.list().await.context("Failed to list checkpoints")?;
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    let report = StatusReport {
        pipeline: spec.name.clone(),
        warehouse: stats,
        checkpoints: rows
            .into_iter()
            .map(|(partition, checkpoint)| CheckpointRow { partition, checkpoint })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn execute(command: Command) -> Result<i32> {
    match command {
        Command::Run { pipeline } => {
            let spec = load_pipeline(&pipeline)?;
            run_pipeline(spec).await
        }
        Command::InitDb { pipeline } => {
            init_db(&load_pipeline(&pipeline)?).await?;
            Ok(0)
        }
        Command::Status { pipeline } => {
            status(&load_pipeline(&pipeline)?).await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_format, cli.log_dir.as_deref());

    match execute(cli.command).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!(error = %format!("{e:#}"), "sluice failed");
            ExitCode::from(1)
        }
    }
}
