//! # Sluice Core
//!
//! Foundational types, traits and the execution engine for resumable batch
//! ETL pipelines. Concrete sources, loaders and transform steps live in the
//! `sluice-io` and `sluice-tx` crates; this crate defines the seams they
//! plug into and drives them.
//!
//! ## Key Components
//!
//! - **Data model**: staged [`RawRecord`]s, [`Batch`]es and [`Checkpoint`]s
//! - **Component traits**: [`SourceReader`], [`Transform`], [`Loader`],
//!   [`CheckpointStore`] and [`Quarantine`]
//! - **Configuration**: YAML pipeline specification with environment overrides
//! - **Orchestrator**: per-partition state machine with retries and cancellation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice_core::{config, memory, Components, MemoryCheckpointStore, Orchestrator, SourceReader};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(transform: Arc<dyn sluice_core::Transform>) -> anyhow::Result<()> {
//! let spec = config::load_pipeline("pipelines/crypto_markets.yaml".as_ref())?;
//! let source: Arc<dyn SourceReader> = Arc::new(memory::MemorySource::new("demo", spec.batch));
//! let components = Components {
//!     sources: vec![source],
//!     transform,
//!     loader: Arc::new(memory::MemoryWarehouse::new()),
//!     checkpoints: Arc::new(MemoryCheckpointStore::new()),
//!     quarantine: Arc::new(memory::MemoryQuarantine::new()),
//! };
//! let report = Orchestrator::new(&spec, components).run(CancellationToken::new()).await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

use async_trait::async_trait;
use uuid::Uuid;

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod retry;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use config::{BatchLimits, PipelineSpec};
pub use error::{EtlError, RejectCode, Result, TransformRejected};
pub use model::{
    Batch, Checkpoint, LoadReceipt, PartitionKey, QuarantineStage, QuarantinedRecord, RawRecord, ReadOutcome,
    RecordStatus, TransformOutput, TransformedRecord, WarehouseStats,
};
pub use orchestrator::{Components, Orchestrator};
pub use report::{PartitionReport, PartitionStatus, RunReport, RunStatus, SourceCounts};
pub use retry::RetryPolicy;

/// Reads batches of raw records from one upstream source.
///
/// A reader is bound to a single source id and may serve many partitions
/// concurrently, so every method takes `&self`.
///
/// ## Examples
/// - JSON-lines files, one partition per file
/// - HTTP JSON API, one partition per page
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn source_id(&self) -> &str;

    /// Partition ids of this source, in a stable order.
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Read the batch that follows `checkpoint`.
    ///
    /// Resumes at `checkpoint.cursor` and numbers records from
    /// `checkpoint.sequence + 1`. Returns [`ReadOutcome::EndOfSource`]
    /// when nothing is left.
    ///
    /// # Errors
    /// [`EtlError::SourceUnavailable`] for connectivity problems and
    /// [`EtlError::SourceCorrupt`] for payloads that cannot be staged.
    async fn read_next_batch(&self, partition_id: &str, checkpoint: &Checkpoint) -> Result<ReadOutcome>;
}

/// Maps a staged batch into validated and rejected records.
///
/// Never fails as a whole: per-record problems become
/// [`TransformRejected`] reasons on the rejected records.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, batch: &Batch<RawRecord>) -> TransformOutput;
}

/// Writes validated records into the warehouse.
#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &str;

    /// Upsert `batch` by natural key. Within one batch the last record for a
    /// key wins.
    ///
    /// Loaders that share a transaction with the checkpoint store advance
    /// the partition to `next` atomically and report
    /// `checkpoint_committed = true`.
    async fn load(&self, batch: &Batch<TransformedRecord>, next: &Checkpoint) -> Result<LoadReceipt>;

    async fn stats(&self) -> Result<WarehouseStats>;
}

/// Durable dead-letter storage for records that could not be loaded.
#[async_trait]
pub trait Quarantine: Send + Sync {
    /// Store `records`, returning how many were written. Storing the same
    /// record twice keeps one copy.
    async fn quarantine(&self, run_id: Uuid, records: &[QuarantinedRecord]) -> Result<u64>;
}
