//! # Sluice I/O - Sources, Warehouse and State Stores
//!
//! Concrete implementations of the `sluice-core` component traits.
//!
//! ## Features
//!
//! ### Sources
//! - **JSON-lines files**: one partition per file, byte-offset cursors
//! - **HTTP JSON APIs**: one partition per query-parameter set, paged snapshots
//!
//! ### Warehouse
//! - **PostgreSQL**: natural-key upserts with the checkpoint advanced in the
//!   same transaction
//!
//! ### State
//! - **Checkpoints**: PostgreSQL table with compare-and-advance
//! - **Quarantine**: PostgreSQL table or JSON-lines files
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sluice_core::config::load_pipeline;
//! use sluice_core::{Orchestrator, Transform};
//!
//! # async fn example(transform: Arc<dyn Transform>) -> anyhow::Result<()> {
//! let spec = load_pipeline(std::path::Path::new("pipelines/crypto_markets.yaml"))?;
//! let wiring = sluice_io::build_components(&spec, transform).await?;
//! let _report = Orchestrator::new(&spec, wiring.components)
//!     .run(tokio_util::sync::CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use sluice_core::config::{PipelineSpec, QuarantineSpec, SourceSpec, WarehouseSpec};
use sluice_core::memory::{MemoryQuarantine, MemoryWarehouse};
use sluice_core::{CheckpointStore, Components, Loader, MemoryCheckpointStore, Quarantine, SourceReader, Transform};
use sqlx::postgres::PgPool;
use tracing::info;

/// PostgreSQL checkpoint store
pub mod checkpoint_postgres;

/// Pool, schema and error classification
pub mod pg;

/// JSON-lines dead-letter files
pub mod quarantine_file;

/// PostgreSQL dead-letter table
pub mod quarantine_postgres;

/// PostgreSQL warehouse loader
pub mod sink_postgres;

/// HTTP JSON API source
pub mod source_http;

/// JSON-lines file source
pub mod source_jsonl;

pub use checkpoint_postgres::PostgresCheckpointStore;
pub use quarantine_file::FileQuarantine;
pub use quarantine_postgres::PostgresQuarantine;
pub use sink_postgres::PostgresWarehouse;
pub use source_http::HttpJsonSource;
pub use source_jsonl::JsonlSource;

/// Components for a pipeline, plus the warehouse pool when there is one.
pub struct Wiring {
    pub components: Components,
    pub pool: Option<PgPool>,
}

/// Build the readers for every configured source.
pub fn build_sources(spec: &PipelineSpec) -> anyhow::Result<Vec<Arc<dyn SourceReader>>> {
    spec.sources
        .iter()
        .map(|source| {
            let reader: Arc<dyn SourceReader> = match source {
                SourceSpec::Jsonl(s) => Arc::new(JsonlSource::new(s.clone(), spec.batch)),
                SourceSpec::HttpJson(s) => Arc::new(HttpJsonSource::new(s.clone(), spec.batch)?),
            };
            Ok(reader)
        })
        .collect()
}

/// Connect to the warehouse (if any), create its tables, and wire every
/// component the orchestrator needs.
pub async fn build_components(spec: &PipelineSpec, transform: Arc<dyn Transform>) -> anyhow::Result<Wiring> {
    let sources = build_sources(spec)?;

    let (loader, checkpoints, pool): (Arc<dyn Loader>, Arc<dyn CheckpointStore>, Option<PgPool>) =
        match &spec.warehouse {
            WarehouseSpec::Postgres(pg_spec) => {
                let pool = pg::connect(pg_spec).await?;
                let quarantine_table = match &spec.quarantine {
                    QuarantineSpec::Postgres { table } => Some(table.as_str()),
                    _ => None,
                };
                pg::ensure_schema(&pool, &pg_spec.table, quarantine_table).await?;
                (
                    Arc::new(PostgresWarehouse::new(pool.clone(), &pg_spec.table)?),
                    Arc::new(PostgresCheckpointStore::new(pool.clone())),
                    Some(pool),
                )
            }
            WarehouseSpec::Memory => {
                info!("Using in-memory warehouse and checkpoints; nothing persists after exit");
                (
                    Arc::new(MemoryWarehouse::new()),
                    Arc::new(MemoryCheckpointStore::new()),
                    None,
                )
            }
        };

    let quarantine: Arc<dyn Quarantine> = match (&spec.quarantine, &pool) {
        (QuarantineSpec::Postgres { table }, Some(pool)) => Arc::new(PostgresQuarantine::new(pool.clone(), table)?),
        (QuarantineSpec::Postgres { .. }, None) => {
            anyhow::bail!("postgres quarantine requires a postgres warehouse")
        }
        (QuarantineSpec::File { dir }, _) => Arc::new(FileQuarantine::new(dir.clone())),
        (QuarantineSpec::Memory, _) => Arc::new(MemoryQuarantine::new()),
    };

    Ok(Wiring {
        components: Components {
            sources,
            transform,
            loader,
            checkpoints,
            quarantine,
        },
        pool,
    })
}
