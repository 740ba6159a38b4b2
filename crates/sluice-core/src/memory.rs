//! In-process implementations of the component traits.
//!
//! Used for dry runs (`warehouse: { type: memory }`) and throughout the
//! test suites. The source and warehouse accept scripted failures so retry
//! and failure paths can be exercised without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::BatchLimits;
use crate::error::{EtlError, Result};
use crate::model::{
    Batch, Checkpoint, LoadReceipt, PartitionKey, QuarantineStage, QuarantinedRecord, RawRecord, ReadOutcome,
    TransformedRecord, WarehouseStats,
};
use crate::{Loader, Quarantine, SourceReader};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| EtlError::Internal(anyhow::anyhow!("in-memory component lock poisoned")))
}

/// A source whose partitions are vectors of payloads.
///
/// The cursor is the index of the next record to read.
#[derive(Debug)]
pub struct MemorySource {
    source_id: String,
    limits: BatchLimits,
    extracted_at: DateTime<Utc>,
    partitions: Mutex<BTreeMap<String, Vec<Arc<[u8]>>>>,
    failures: Mutex<HashMap<String, VecDeque<EtlError>>>,
    reads: AtomicU64,
}

impl MemorySource {
    pub fn new(source_id: impl Into<String>, limits: BatchLimits) -> Self {
        Self {
            source_id: source_id.into(),
            limits,
            extracted_at: Utc::now(),
            partitions: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
        }
    }

    /// Pin the extraction timestamp stamped on every record.
    pub fn with_extracted_at(mut self, at: DateTime<Utc>) -> Self {
        self.extracted_at = at;
        self
    }

    /// Add a partition holding `payloads`, which may be empty.
    pub fn with_partition<I, P>(mut self, partition_id: impl Into<String>, payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let parts = self.partitions.get_mut().unwrap_or_else(PoisonError::into_inner);
        parts
            .entry(partition_id.into())
            .or_default()
            .extend(payloads.into_iter().map(|p| Arc::from(p.into())));
        self
    }

    /// Append one record to a partition, creating it if needed.
    pub fn append(&self, partition_id: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let bytes: Vec<u8> = payload.into();
        lock(&self.partitions)?
            .entry(partition_id.to_string())
            .or_default()
            .push(Arc::from(bytes));
        Ok(())
    }

    /// Make the next read of `partition_id` fail with `err`. Failures queue up.
    pub fn fail_next_read(&self, partition_id: &str, err: EtlError) -> Result<()> {
        lock(&self.failures)?
            .entry(partition_id.to_string())
            .or_default()
            .push_back(err);
        Ok(())
    }

    /// Number of `read_next_batch` calls so far, failed ones included.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn start_index(&self, checkpoint: &Checkpoint, len: usize) -> Result<usize> {
        let Some(cursor) = checkpoint.cursor.as_deref() else {
            return Ok(0);
        };
        let index: usize = cursor
            .parse()
            .map_err(|_| EtlError::source_corrupt(&self.source_id, format!("invalid cursor '{cursor}'")))?;
        if index > len {
            return Err(EtlError::source_corrupt(
                &self.source_id,
                format!("cursor {index} is past the end of the partition ({len} records)"),
            ));
        }
        Ok(index)
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        Ok(lock(&self.partitions)?.keys().cloned().collect())
    }

    async fn read_next_batch(&self, partition_id: &str, checkpoint: &Checkpoint) -> Result<ReadOutcome> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failures)?
            .get_mut(partition_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let parts = lock(&self.partitions)?;
        let records = parts.get(partition_id).ok_or_else(|| {
            EtlError::Internal(anyhow::anyhow!(
                "unknown partition '{}' of source '{}'",
                partition_id,
                self.source_id
            ))
        })?;

        let start = self.start_index(checkpoint, records.len())?;
        if start == records.len() {
            return Ok(ReadOutcome::EndOfSource);
        }

        let key = PartitionKey::new(&self.source_id, partition_id);
        let mut batch = Vec::new();
        let mut bytes = 0;
        for (index, payload) in records.iter().enumerate().skip(start) {
            if !self.limits.admits(batch.len(), bytes, payload.len()) {
                break;
            }
            bytes += payload.len();
            let ordinal = checkpoint.sequence + batch.len() as u64 + 1;
            batch.push(RawRecord::new(
                key.clone(),
                index.to_string(),
                ordinal,
                self.extracted_at,
                Arc::clone(payload),
            ));
        }

        let end = start + batch.len();
        let sequence = checkpoint.sequence + batch.len() as u64;
        Ok(ReadOutcome::Batch(Batch::new(key, sequence, end.to_string(), batch)))
    }
}

/// A row held by [`MemoryWarehouse`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub partition: PartitionKey,
    pub sequence: u64,
    pub fields: Map<String, Value>,
    pub loaded_at: DateTime<Utc>,
}

/// Warehouse keyed by natural key. Does not own checkpoints.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    rows: Mutex<BTreeMap<String, StoredRow>>,
    failures: Mutex<VecDeque<EtlError>>,
    loads: AtomicU64,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `load` fail with `err`. Failures queue up.
    pub fn fail_next_load(&self, err: EtlError) -> Result<()> {
        lock(&self.failures)?.push_back(err);
        Ok(())
    }

    /// Snapshot of every row, ordered by natural key.
    pub fn rows(&self) -> Result<BTreeMap<String, StoredRow>> {
        Ok(lock(&self.rows)?.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.rows)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock(&self.rows)?.is_empty())
    }

    /// Number of `load` calls so far, failed ones included.
    pub fn load_calls(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for MemoryWarehouse {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, batch: &Batch<TransformedRecord>, _next: &Checkpoint) -> Result<LoadReceipt> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.failures)?.pop_front() {
            return Err(err);
        }

        let mut latest: BTreeMap<&str, &TransformedRecord> = BTreeMap::new();
        for record in &batch.records {
            latest.insert(record.natural_key.as_str(), record);
        }

        let now = Utc::now();
        let mut rows = lock(&self.rows)?;
        for (key, record) in &latest {
            rows.insert(
                (*key).to_string(),
                StoredRow {
                    partition: batch.partition.clone(),
                    sequence: batch.sequence,
                    fields: record.fields.clone(),
                    loaded_at: now,
                },
            );
        }
        debug!(
            partition = %batch.partition,
            sequence = batch.sequence,
            rows = latest.len(),
            "Loaded batch into memory warehouse"
        );

        Ok(LoadReceipt {
            rows_written: latest.len() as u64,
            checkpoint_committed: false,
        })
    }

    async fn stats(&self) -> Result<WarehouseStats> {
        let rows = lock(&self.rows)?;
        Ok(WarehouseStats {
            row_count: rows.len() as u64,
            latest_loaded_at: rows.values().map(|r| r.loaded_at).max(),
        })
    }
}

/// Dead-letter area kept in memory, keyed by record identity and stage.
#[derive(Debug, Default)]
pub struct MemoryQuarantine {
    records: Mutex<HashMap<(PartitionKey, String, QuarantineStage), (Uuid, QuarantinedRecord)>>,
}

impl MemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, ordered by partition and ordinal.
    pub fn records(&self) -> Result<Vec<QuarantinedRecord>> {
        let mut all: Vec<QuarantinedRecord> = lock(&self.records)?.values().map(|(_, r)| r.clone()).collect();
        all.sort_by(|a, b| (&a.partition, a.ordinal).cmp(&(&b.partition, b.ordinal)));
        Ok(all)
    }
}

#[async_trait]
impl Quarantine for MemoryQuarantine {
    async fn quarantine(&self, run_id: Uuid, records: &[QuarantinedRecord]) -> Result<u64> {
        let mut stored = lock(&self.records)?;
        for record in records {
            stored.insert(
                (record.partition.clone(), record.offset.clone(), record.stage),
                (run_id, record.clone()),
            );
        }
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RejectCode, TransformRejected};

    fn source(max_records: usize) -> MemorySource {
        MemorySource::new("mem", BatchLimits::records(max_records)).with_partition(
            "p0",
            vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}", "{\"n\":4}", "{\"n\":5}"],
        )
    }

    async fn expect_batch(src: &MemorySource, cp: &Checkpoint) -> Batch<RawRecord> {
        match src.read_next_batch("p0", cp).await.unwrap() {
            ReadOutcome::Batch(b) => b,
            ReadOutcome::EndOfSource => panic!("unexpected end of source"),
        }
    }

    #[tokio::test]
    async fn reads_in_bounded_batches_until_end() {
        let src = source(2);
        let mut cp = Checkpoint::zero();
        let mut sequences = Vec::new();
        loop {
            match src.read_next_batch("p0", &cp).await.unwrap() {
                ReadOutcome::Batch(b) => {
                    assert!(b.len() <= 2);
                    sequences.push(b.sequence);
                    cp = b.next_checkpoint();
                }
                ReadOutcome::EndOfSource => break,
            }
        }
        assert_eq!(sequences, vec![2, 4, 5]);
        assert_eq!(cp.cursor.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn builder_keeps_empty_partitions_and_appends_to_existing_ones() {
        let src = MemorySource::new("mem", BatchLimits::records(10))
            .with_partition("empty", Vec::<Vec<u8>>::new())
            .with_partition("p0", vec!["{\"n\":1}"])
            .with_partition("p0", vec!["{\"n\":2}"]);
        assert_eq!(src.partitions().await.unwrap(), vec!["empty", "p0"]);

        let batch = expect_batch(&src, &Checkpoint::zero()).await;
        let payloads: Vec<&[u8]> = batch.records.iter().map(|r| r.payload()).collect();
        assert_eq!(payloads, vec![&b"{\"n\":1}"[..], &b"{\"n\":2}"[..]]);

        let outcome = src.read_next_batch("empty", &Checkpoint::zero()).await.unwrap();
        assert!(matches!(outcome, ReadOutcome::EndOfSource));
    }

    #[tokio::test]
    async fn resumes_from_cursor_with_continuing_ordinals() {
        let src = source(2);
        let first = expect_batch(&src, &Checkpoint::zero()).await;
        let second = expect_batch(&src, &first.next_checkpoint()).await;
        assert_eq!(second.records[0].ordinal(), 3);
        assert_eq!(second.records[0].offset(), "2");
        assert_eq!(second.records[0].payload(), b"{\"n\":3}");
    }

    #[tokio::test]
    async fn byte_limit_splits_batches() {
        let src = MemorySource::new(
            "mem",
            BatchLimits {
                max_records: 100,
                max_bytes: 10,
            },
        )
        .with_partition("p0", vec!["aaaaaa", "bbbbbb", "cc"]);
        let batch = expect_batch(&src, &Checkpoint::zero()).await;
        assert_eq!(batch.len(), 1);
        let batch = expect_batch(&src, &batch.next_checkpoint()).await;
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let src = source(10);
        src.fail_next_read("p0", EtlError::source_unavailable("mem", "flaky")).unwrap();
        assert!(src.read_next_batch("p0", &Checkpoint::zero()).await.is_err());
        assert!(src.read_next_batch("p0", &Checkpoint::zero()).await.is_ok());
        assert_eq!(src.reads(), 2);
    }

    #[tokio::test]
    async fn bad_cursor_is_corrupt() {
        let src = source(10);
        let cp = Checkpoint {
            sequence: 9,
            cursor: Some("99".into()),
            updated_at: None,
        };
        let err = src.read_next_batch("p0", &cp).await.unwrap_err();
        assert!(matches!(err, EtlError::SourceCorrupt { .. }));
    }

    fn transformed(key: &str, n: i64) -> TransformedRecord {
        let raw = RawRecord::new(PartitionKey::new("mem", "p0"), n.to_string(), n as u64, Utc::now(), b"{}".to_vec());
        let mut t = TransformedRecord::from_raw(&raw);
        t.natural_key = key.to_string();
        t.fields.insert("n".into(), Value::from(n));
        t
    }

    #[tokio::test]
    async fn warehouse_upserts_by_natural_key_last_wins() {
        let wh = MemoryWarehouse::new();
        let batch = Batch::new(
            PartitionKey::new("mem", "p0"),
            3,
            "3",
            vec![transformed("a", 1), transformed("b", 2), transformed("a", 3)],
        );
        let receipt = wh.load(&batch, &batch.next_checkpoint()).await.unwrap();
        assert_eq!(receipt.rows_written, 2);
        assert!(!receipt.checkpoint_committed);

        wh.load(&batch, &batch.next_checkpoint()).await.unwrap();
        let rows = wh.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows["a"].fields["n"], 3);
        assert_eq!(wh.stats().await.unwrap().row_count, 2);
    }

    #[tokio::test]
    async fn quarantine_is_idempotent() {
        let q = MemoryQuarantine::new();
        let rec = transformed("a", 1).reject(TransformRejected::new(RejectCode::MissingField, "validate", "x"));
        let entry = QuarantinedRecord::rejected(&rec, 1);
        q.quarantine(Uuid::new_v4(), &[entry.clone()]).await.unwrap();
        q.quarantine(Uuid::new_v4(), &[entry]).await.unwrap();
        assert_eq!(q.records().unwrap().len(), 1);
    }
}
