//! Shared fixtures for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use sluice_core::config::{parse_pipeline_str, RunSpec};
use sluice_core::memory::{MemoryQuarantine, MemorySource, MemoryWarehouse};
use sluice_core::{
    BatchLimits, Checkpoint, CheckpointStore, Components, EtlError, MemoryCheckpointStore, Orchestrator, PartitionKey,
    Result, RetryPolicy, SourceReader,
};
use sluice_tx::TransformEngine;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const STEPS: &str = r#"
name: e2e
sources:
  - { type: jsonl, id: placeholder, glob: "*.jsonl" }
transform:
  steps:
    - kind: validate
      required: [id, price]
      non_negative: [price]
    - kind: coerce
      fields:
        price: { to: float, decimals: 2 }
    - kind: dedup_key
      fields: [id]
warehouse: { type: memory }
"#;

pub fn engine() -> Arc<TransformEngine> {
    Arc::new(TransformEngine::from_spec(&parse_pipeline_str(STEPS).expect("fixture pipeline parses")))
}

pub fn source(batch_size: usize, partitions: &[(&str, Vec<String>)]) -> MemorySource {
    let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    partitions.iter().fold(
        MemorySource::new("feed", BatchLimits::records(batch_size)).with_extracted_at(at),
        |src, (id, payloads)| src.with_partition(*id, payloads.clone()),
    )
}

pub fn record(id: &str, price: f64) -> String {
    format!(r#"{{"id":"{id}","price":{price}}}"#)
}

pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
        multiplier: 2.0,
        jitter: 0.2,
        max_elapsed: Duration::from_secs(300),
    }
}

pub struct Pipeline {
    pub source: Arc<MemorySource>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub quarantine: Arc<MemoryQuarantine>,
    pub retry: RetryPolicy,
    pub run: RunSpec,
}

impl Pipeline {
    pub fn new(source: MemorySource) -> Self {
        Self {
            source: Arc::new(source),
            warehouse: Arc::new(MemoryWarehouse::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            quarantine: Arc::new(MemoryQuarantine::new()),
            retry: fast_retry(3),
            run: RunSpec::default(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let source: Arc<dyn SourceReader> = self.source.clone();
        Orchestrator::from_parts(
            "e2e",
            self.run.clone(),
            self.retry.clone(),
            Components {
                sources: vec![source],
                transform: engine(),
                loader: self.warehouse.clone(),
                checkpoints: Arc::clone(&self.checkpoints),
                quarantine: self.quarantine.clone(),
            },
        )
        .with_run_id(Uuid::from_u128(7))
    }

    pub async fn run(&self) -> sluice_core::RunReport {
        self.run_with(CancellationToken::new()).await
    }

    pub async fn run_with(&self, cancel: CancellationToken) -> sluice_core::RunReport {
        self.orchestrator().run(cancel).await.expect("run setup succeeds")
    }
}

/// Wraps a checkpoint store, recording every advance and optionally
/// failing or cancelling at a given advance.
pub struct ObservedCheckpoints {
    inner: MemoryCheckpointStore,
    pub advances: Mutex<Vec<(PartitionKey, u64)>>,
    calls: AtomicU32,
    fail_on_call: Option<u32>,
    cancel_on_call: Option<(u32, CancellationToken)>,
}

impl ObservedCheckpoints {
    pub fn new() -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            advances: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            fail_on_call: None,
            cancel_on_call: None,
        }
    }

    /// Fail the n-th advance (1-based) with a fatal error.
    pub fn failing_on(mut self, call: u32) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// Cancel `token` right after the n-th advance (1-based) succeeds.
    pub fn cancelling_after(mut self, call: u32, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((call, token));
        self
    }
}

#[async_trait]
impl CheckpointStore for ObservedCheckpoints {
    async fn get(&self, source_id: &str, partition_id: &str) -> Result<Checkpoint> {
        self.inner.get(source_id, partition_id).await
    }

    async fn advance(&self, source_id: &str, partition_id: &str, new: &Checkpoint) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(EtlError::Internal(anyhow::anyhow!("simulated crash before checkpoint")));
        }
        self.inner.advance(source_id, partition_id, new).await?;
        self.advances
            .lock()
            .unwrap()
            .push((PartitionKey::new(source_id, partition_id), new.sequence));
        if let Some((at, token)) = &self.cancel_on_call {
            if *at == call {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(PartitionKey, Checkpoint)>> {
        self.inner.list().await
    }
}
