//! Pipeline Orchestrator.
//!
//! Every partition of every source runs as its own task through the state
//! machine
//!
//! ```text
//! Idle -> Reading -> Transforming -> Loading -> Committed -> Reading ...
//!            |             |             |
//!            +-------------+-------------+--> Failed | Done | Cancelled
//! ```
//!
//! Partitions are independent: one failing does not stop the others unless
//! `run.tolerate_partial_failure` is off. Stages within a partition are
//! strictly sequential, and the checkpoint only moves after a batch is
//! durably loaded.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::{PipelineSpec, RunSpec};
use crate::error::{EtlError, Result};
use crate::model::{Checkpoint, LoadReceipt, PartitionKey, QuarantinedRecord, ReadOutcome};
use crate::report::{PartitionReport, PartitionStatus, RunReport};
use crate::retry::RetryPolicy;
use crate::{Loader, Quarantine, SourceReader, Transform};

/// The components a run is wired from.
pub struct Components {
    pub sources: Vec<Arc<dyn SourceReader>>,
    pub transform: Arc<dyn Transform>,
    pub loader: Arc<dyn Loader>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub quarantine: Arc<dyn Quarantine>,
}

/// Where a partition is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Reading,
    Transforming,
    Loading,
    Committed,
    Failed,
    Done,
    Cancelled,
}

/// Drives one run of a pipeline.
pub struct Orchestrator {
    pipeline: String,
    run: RunSpec,
    retry: RetryPolicy,
    run_id: Uuid,
    components: Components,
}

impl Orchestrator {
    pub fn new(spec: &PipelineSpec, components: Components) -> Self {
        Self::from_parts(&spec.name, spec.run.clone(), RetryPolicy::from(&spec.retry), components)
    }

    pub fn from_parts(pipeline: &str, run: RunSpec, retry: RetryPolicy, components: Components) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            run,
            retry,
            run_id: Uuid::new_v4(),
            components,
        }
    }

    /// Use a fixed run id, which also fixes the retry jitter schedule.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Process every partition to completion, failure or cancellation.
    ///
    /// # Errors
    ///
    /// Only setup failures (listing partitions) are returned as errors.
    /// Partition failures are recorded in the report.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_cancel = cancel.child_token();

        info!(
            run_id = %self.run_id,
            pipeline = %self.pipeline,
            sources = self.components.sources.len(),
            max_concurrency = self.run.max_concurrency,
            "Starting run"
        );

        let mut planned: Vec<(Arc<dyn SourceReader>, PartitionKey)> = Vec::new();
        for source in &self.components.sources {
            let mut retries = 0;
            let ids = self
                .retry
                .run(
                    "list_partitions",
                    &format!("{}/{}", self.run_id, source.source_id()),
                    &run_cancel,
                    &mut retries,
                    || source.partitions(),
                )
                .await?;
            debug!(source = source.source_id(), partitions = ids.len(), "Discovered partitions");
            for id in ids {
                planned.push((Arc::clone(source), PartitionKey::new(source.source_id(), id)));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.run.max_concurrency));
        let mut join_set = JoinSet::new();
        for (source, key) in &planned {
            let worker = PartitionWorker {
                run_id: self.run_id,
                key: key.clone(),
                jitter_key: format!("{}/{}", self.run_id, key),
                source: Arc::clone(source),
                transform: Arc::clone(&self.components.transform),
                loader: Arc::clone(&self.components.loader),
                checkpoints: Arc::clone(&self.components.checkpoints),
                quarantine: Arc::clone(&self.components.quarantine),
                retry: self.retry.clone(),
                cancel: run_cancel.clone(),
                fail_fast: !self.run.tolerate_partial_failure,
            };
            let semaphore = Arc::clone(&semaphore);
            let span = info_span!(
                "partition",
                run_id = %self.run_id,
                source = %key.source_id,
                partition = %key.partition_id
            );
            join_set.spawn(
                async move {
                    let permit = tokio::select! {
                        permit = semaphore.acquire_owned() => permit.ok(),
                        _ = worker.cancel.cancelled() => None,
                    };
                    match permit {
                        Some(_permit) => worker.execute().await,
                        None => worker.never_started(),
                    }
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::with_capacity(planned.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(join_err) => error!(error = %join_err, "Partition task panicked"),
            }
        }
        for (_, key) in &planned {
            if !reports.iter().any(|r| &r.partition == key) {
                let mut report = PartitionReport::new(key.clone());
                report.fail(&EtlError::Internal(anyhow::anyhow!("partition task panicked")));
                reports.push(report);
            }
        }

        let report = RunReport::finalize(self.run_id, &self.pipeline, started_at, reports);
        report.log();
        Ok(report)
    }
}

struct Progress {
    state: PartitionState,
    report: PartitionReport,
}

impl Progress {
    fn enter(&mut self, next: PartitionState) {
        trace!(from = ?self.state, to = ?next, "Partition state change");
        self.state = next;
    }
}

struct PartitionWorker {
    run_id: Uuid,
    key: PartitionKey,
    jitter_key: String,
    source: Arc<dyn SourceReader>,
    transform: Arc<dyn Transform>,
    loader: Arc<dyn Loader>,
    checkpoints: Arc<dyn CheckpointStore>,
    quarantine: Arc<dyn Quarantine>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    fail_fast: bool,
}

impl PartitionWorker {
    fn never_started(self) -> PartitionReport {
        info!("Partition cancelled before it started");
        let mut report = PartitionReport::new(self.key);
        report.status = PartitionStatus::Cancelled;
        report
    }

    async fn execute(self) -> PartitionReport {
        let mut progress = Progress {
            state: PartitionState::Idle,
            report: PartitionReport::new(self.key.clone()),
        };

        let outcome = self.drive(&mut progress).await;
        match outcome {
            Ok(PartitionStatus::Cancelled) => self.cancelled(&mut progress),
            Ok(_) => {
                progress.enter(PartitionState::Done);
                progress.report.status = PartitionStatus::Done;
                let r = &progress.report;
                info!(
                    read = r.records_read,
                    transformed = r.records_transformed,
                    rejected = r.records_rejected,
                    loaded = r.records_loaded,
                    batches = r.batches,
                    retries = r.retries,
                    checkpoint = r.checkpoint,
                    "Partition done"
                );
            }
            // A backoff sleep interrupted by cancellation is not a failure.
            Err(err) if err.is_retryable() && self.cancel.is_cancelled() => self.cancelled(&mut progress),
            Err(err) => {
                let failed_in = progress.state;
                progress.enter(PartitionState::Failed);
                progress.report.fail(&err);
                error!(
                    state = ?failed_in,
                    kind = err.kind(),
                    error = %err,
                    checkpoint = progress.report.checkpoint,
                    "Partition failed"
                );
                if self.fail_fast {
                    warn!("Partial failure not tolerated, cancelling remaining partitions");
                    self.cancel.cancel();
                }
            }
        }

        progress.report
    }

    fn cancelled(&self, progress: &mut Progress) {
        progress.enter(PartitionState::Cancelled);
        progress.report.status = PartitionStatus::Cancelled;
        info!(checkpoint = progress.report.checkpoint, "Partition cancelled");
    }

    async fn drive(&self, p: &mut Progress) -> Result<PartitionStatus> {
        let source_id = self.key.source_id.as_str();
        let partition_id = self.key.partition_id.as_str();

        let mut checkpoint: Checkpoint = self
            .retry
            .run("checkpoint_get", &self.jitter_key, &self.cancel, &mut p.report.retries, || {
                self.checkpoints.get(source_id, partition_id)
            })
            .await?;
        p.report.checkpoint = checkpoint.sequence;
        if !checkpoint.is_zero() {
            info!(checkpoint = checkpoint.sequence, cursor = ?checkpoint.cursor, "Resuming partition");
        }

        loop {
            if self.cancel.is_cancelled() {
                return Ok(PartitionStatus::Cancelled);
            }

            p.enter(PartitionState::Reading);
            let outcome = self
                .retry
                .run("read", &self.jitter_key, &self.cancel, &mut p.report.retries, || {
                    self.source.read_next_batch(partition_id, &checkpoint)
                })
                .await?;
            let batch = match outcome {
                ReadOutcome::EndOfSource => return Ok(PartitionStatus::Done),
                ReadOutcome::Batch(batch) => batch,
            };
            if batch.sequence <= checkpoint.sequence {
                return Err(EtlError::StaleCheckpoint {
                    source_id: source_id.to_string(),
                    partition_id: partition_id.to_string(),
                    stored: checkpoint.sequence,
                    attempted: batch.sequence,
                });
            }
            p.report.records_read += batch.len() as u64;
            p.report.batches += 1;

            p.enter(PartitionState::Transforming);
            let output = self.transform.transform(&batch).await;
            p.report.records_transformed += output.validated.len() as u64;
            p.report.records_rejected += output.rejected.len() as u64;

            if !output.rejected.is_empty() {
                let entries: Vec<QuarantinedRecord> = output
                    .rejected
                    .iter()
                    .map(|r| QuarantinedRecord::rejected(r, batch.sequence))
                    .collect();
                let stored = self.store_quarantined(&entries, &mut p.report.retries).await?;
                p.report.records_quarantined += stored;
                warn!(
                    sequence = batch.sequence,
                    rejected = entries.len(),
                    "Quarantined rejected records"
                );
            }

            p.enter(PartitionState::Loading);
            let next = batch.next_checkpoint();
            let load_batch = batch.with_records(output.validated);
            let loaded = self
                .retry
                .run("load", &self.jitter_key, &self.cancel, &mut p.report.retries, || {
                    self.loader.load(&load_batch, &next)
                })
                .await;
            let receipt = match loaded {
                Ok(receipt) => receipt,
                Err(EtlError::LoadRejected { message }) => {
                    let entries: Vec<QuarantinedRecord> = load_batch
                        .records
                        .iter()
                        .map(|r| QuarantinedRecord::load_rejected(r, batch.sequence, &message))
                        .collect();
                    p.report.records_quarantined += self.store_quarantined(&entries, &mut p.report.retries).await?;
                    return Err(EtlError::LoadRejected { message });
                }
                Err(EtlError::StaleCheckpoint { stored, attempted, .. }) if stored == attempted => {
                    warn!(sequence = batch.sequence, "Batch already committed by an earlier attempt");
                    LoadReceipt {
                        rows_written: load_batch.len() as u64,
                        checkpoint_committed: true,
                    }
                }
                Err(err) => return Err(err),
            };

            if !receipt.checkpoint_committed {
                let advanced = self
                    .retry
                    .run(
                        "checkpoint_advance",
                        &self.jitter_key,
                        &self.cancel,
                        &mut p.report.retries,
                        || self.checkpoints.advance(source_id, partition_id, &next),
                    )
                    .await;
                match advanced {
                    Ok(()) => {}
                    Err(EtlError::StaleCheckpoint { stored, attempted, .. }) if stored == attempted => {
                        debug!(sequence = next.sequence, "Checkpoint already advanced by an earlier attempt");
                    }
                    Err(err) => return Err(err),
                }
            }

            p.report.records_loaded += receipt.rows_written;
            checkpoint = next;
            p.report.checkpoint = checkpoint.sequence;
            p.enter(PartitionState::Committed);
            debug!(
                sequence = checkpoint.sequence,
                records = batch.len(),
                rows = receipt.rows_written,
                "Batch committed"
            );
        }
    }

    async fn store_quarantined(&self, entries: &[QuarantinedRecord], retries: &mut u32) -> Result<u64> {
        self.retry
            .run("quarantine", &self.jitter_key, &self.cancel, retries, || {
                self.quarantine.quarantine(self.run_id, entries)
            })
            .await
    }
}
