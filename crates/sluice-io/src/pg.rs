//! PostgreSQL pool, schema and error classification shared by the
//! warehouse loader and the state stores.

use std::time::Duration;

use anyhow::Context;
use sluice_core::config::{check_identifier, PostgresWarehouseSpec};
use sluice_core::{EtlError, RunReport};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

pub const CHECKPOINT_TABLE: &str = "sluice_checkpoints";
pub const RUNS_TABLE: &str = "sluice_runs";

/// Open a connection pool sized by the warehouse settings.
pub async fn connect(spec: &PostgresWarehouseSpec) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(spec.max_connections)
        .min_connections(spec.min_connections)
        .acquire_timeout(Duration::from_secs(spec.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(600))
        .connect(&spec.url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!(
        max_connections = spec.max_connections,
        table = %spec.table,
        "Connected to warehouse"
    );
    Ok(pool)
}

/// DDL for every table a PostgreSQL pipeline touches. Idempotent.
pub fn schema_statements(table: &str, quarantine_table: Option<&str>) -> Vec<String> {
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                natural_key  TEXT PRIMARY KEY,
                source_id    TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                sequence     BIGINT NOT NULL,
                record       JSONB NOT NULL,
                loaded_at    TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_partition ON {table} (source_id, partition_id, sequence)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_loaded_at ON {table} (loaded_at DESC)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {CHECKPOINT_TABLE} (
                source_id    TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                sequence     BIGINT NOT NULL,
                cursor       TEXT,
                updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (source_id, partition_id)
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {RUNS_TABLE} (
                run_id      UUID PRIMARY KEY,
                pipeline    TEXT NOT NULL,
                status      TEXT NOT NULL,
                started_at  TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NOT NULL,
                report      JSONB NOT NULL
            )"
        ),
    ];
    if let Some(q) = quarantine_table {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {q} (
                source_id      TEXT NOT NULL,
                partition_id   TEXT NOT NULL,
                record_offset  TEXT NOT NULL,
                stage          TEXT NOT NULL,
                ordinal        BIGINT NOT NULL,
                sequence       BIGINT NOT NULL,
                run_id         UUID NOT NULL,
                code           TEXT NOT NULL,
                detail         TEXT NOT NULL,
                payload        BYTEA NOT NULL,
                quarantined_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (source_id, partition_id, record_offset, stage)
            )"
        ));
        statements.push(format!("CREATE INDEX IF NOT EXISTS idx_{q}_code ON {q} (code)"));
    }
    statements
}

/// Create the warehouse, checkpoint, run and quarantine tables.
pub async fn ensure_schema(pool: &PgPool, table: &str, quarantine_table: Option<&str>) -> anyhow::Result<()> {
    check_identifier("warehouse table", table)?;
    if let Some(q) = quarantine_table {
        check_identifier("quarantine table", q)?;
    }
    for statement in schema_statements(table, quarantine_table) {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to apply schema: {statement}"))?;
    }
    debug!(table, "Schema ready");
    Ok(())
}

/// Whether the failure is about connectivity rather than the data.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code == "57P01" || code == "40001" || code == "40P01"),
        _ => false,
    }
}

/// Whether the database refused the data itself (classes 22 and 23).
fn is_data_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
        _ => false,
    }
}

/// Map a warehouse write failure onto the error taxonomy.
pub fn load_error(err: sqlx::Error) -> EtlError {
    if is_data_error(&err) {
        EtlError::load_rejected(err)
    } else if is_transient(&err) {
        EtlError::load_unavailable(err)
    } else {
        EtlError::Internal(anyhow::Error::new(err).context("warehouse write failed"))
    }
}

/// Map a checkpoint or quarantine failure onto the error taxonomy.
pub fn state_error(err: sqlx::Error) -> EtlError {
    if is_transient(&err) {
        EtlError::state_unavailable(err)
    } else {
        EtlError::Internal(anyhow::Error::new(err).context("state store query failed"))
    }
}

/// Record a finished run in `sluice_runs`.
pub async fn record_run(pool: &PgPool, report: &RunReport) -> anyhow::Result<()> {
    let body = serde_json::to_value(report).context("Failed to serialize run report")?;
    sqlx::query(&format!(
        "INSERT INTO {RUNS_TABLE} (run_id, pipeline, status, started_at, finished_at, report)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (run_id) DO UPDATE SET
             status = EXCLUDED.status,
             finished_at = EXCLUDED.finished_at,
             report = EXCLUDED.report"
    ))
    .bind(report.run_id)
    .bind(&report.pipeline)
    .bind(report.status.as_str())
    .bind(report.started_at)
    .bind(report.finished_at)
    .bind(body)
    .execute(pool)
    .await
    .context("Failed to record run")?;
    Ok(())
}
