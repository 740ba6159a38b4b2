//! Records, batches and checkpoints flowing through a pipeline.
//!
//! A [`RawRecord`] is staged by a source reader and never changes after
//! that. The transform engine derives a [`TransformedRecord`] from it, and
//! records travel between stages grouped in a [`Batch`], which is also the
//! unit of loading and checkpointing.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::TransformRejected;

/// Identifies one source partition, the unit of independent progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub source_id: String,
    pub partition_id: String,
}

impl PartitionKey {
    pub fn new(source_id: impl Into<String>, partition_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            partition_id: partition_id.into(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.partition_id)
    }
}

/// An extracted record as it arrived from the source.
///
/// Fields are only reachable through accessors and the payload is shared,
/// so a staged record cannot be modified by later stages.
#[derive(Debug, Clone)]
pub struct RawRecord {
    partition: PartitionKey,
    offset: String,
    ordinal: u64,
    extracted_at: DateTime<Utc>,
    payload: Arc<[u8]>,
}

impl RawRecord {
    /// Stage a record.
    ///
    /// `offset` is the source-native position of the record (byte offset,
    /// array index, ...). `ordinal` is its 1-based position in the
    /// partition stream and keeps counting across runs.
    pub fn new(
        partition: PartitionKey,
        offset: impl Into<String>,
        ordinal: u64,
        extracted_at: DateTime<Utc>,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            partition,
            offset: offset.into(),
            ordinal,
            extracted_at,
            payload: payload.into(),
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn source_id(&self) -> &str {
        &self.partition.source_id
    }

    pub fn partition_id(&self) -> &str {
        &self.partition.partition_id
    }

    pub fn offset(&self) -> &str {
        &self.offset
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Shared handle to the payload, used to keep rejected bytes for quarantine.
    pub fn payload_handle(&self) -> Arc<[u8]> {
        Arc::clone(&self.payload)
    }
}

/// An ordered group of records from one partition.
///
/// `sequence` is the ordinal of the last record in the batch, so sequences
/// strictly increase within a partition and a checkpoint at sequence `n`
/// means every record up to ordinal `n` is loaded. `cursor` is the source
/// position right after the last record.
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub partition: PartitionKey,
    pub sequence: u64,
    pub cursor: String,
    pub records: Vec<T>,
}

impl<T> Batch<T> {
    pub fn new(partition: PartitionKey, sequence: u64, cursor: impl Into<String>, records: Vec<T>) -> Self {
        Self {
            partition,
            sequence,
            cursor: cursor.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Same partition, sequence and cursor, different records.
    pub fn with_records<U>(&self, records: Vec<U>) -> Batch<U> {
        Batch {
            partition: self.partition.clone(),
            sequence: self.sequence,
            cursor: self.cursor.clone(),
            records,
        }
    }

    /// The checkpoint that becomes current once this batch is loaded.
    pub fn next_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            sequence: self.sequence,
            cursor: Some(self.cursor.clone()),
            updated_at: None,
        }
    }
}

impl Batch<RawRecord> {
    /// Total payload size in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(|r| r.payload().len()).sum()
    }
}

/// Result of a source read.
#[derive(Debug)]
pub enum ReadOutcome {
    Batch(Batch<RawRecord>),
    EndOfSource,
}

/// Whether a record survived the transform pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Valid,
    Rejected(TransformRejected),
}

/// A raw record mapped through the transform pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct TransformedRecord {
    pub partition: PartitionKey,
    pub offset: String,
    pub ordinal: u64,
    pub extracted_at: DateTime<Utc>,
    /// Natural key used by the loader to collapse duplicates.
    pub natural_key: String,
    pub fields: Map<String, Value>,
    #[serde(flatten)]
    pub status: RecordStatus,
    #[serde(skip)]
    payload: Arc<[u8]>,
}

impl TransformedRecord {
    /// Start a transformed record from its raw source.
    ///
    /// The natural key defaults to `<source>/<partition>/<offset>`, which is
    /// stable across redeliveries of the same record.
    pub fn from_raw(raw: &RawRecord) -> Self {
        Self {
            partition: raw.partition().clone(),
            offset: raw.offset().to_string(),
            ordinal: raw.ordinal(),
            extracted_at: raw.extracted_at(),
            natural_key: format!("{}/{}", raw.partition(), raw.offset()),
            fields: Map::new(),
            status: RecordStatus::Valid,
            payload: raw.payload_handle(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.status, RecordStatus::Valid)
    }

    pub fn rejection(&self) -> Option<&TransformRejected> {
        match &self.status {
            RecordStatus::Rejected(r) => Some(r),
            RecordStatus::Valid => None,
        }
    }

    pub fn reject(mut self, reason: TransformRejected) -> Self {
        self.status = RecordStatus::Rejected(reason);
        self
    }

    /// The original payload bytes of the raw record.
    pub fn raw_payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Output of the transform engine for one batch.
#[derive(Debug, Default)]
pub struct TransformOutput {
    pub validated: Vec<TransformedRecord>,
    pub rejected: Vec<TransformedRecord>,
}

/// Durable progress marker of a partition.
///
/// The zero checkpoint (sequence 0, no cursor) means nothing has been
/// committed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub cursor: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.sequence == 0 && self.cursor.is_none()
    }
}

/// What a loader reports after committing a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReceipt {
    /// Distinct rows upserted (in-batch duplicates collapse to one row).
    pub rows_written: u64,
    /// True when the loader advanced the checkpoint inside its own
    /// transaction; otherwise the orchestrator advances it afterwards.
    pub checkpoint_committed: bool,
}

/// Summary of the warehouse contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarehouseStats {
    pub row_count: u64,
    pub latest_loaded_at: Option<DateTime<Utc>>,
}

/// Which stage sent a record to quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStage {
    Transform,
    Load,
}

impl QuarantineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transform => "transform",
            Self::Load => "load",
        }
    }
}

/// A record preserved in the dead-letter area.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedRecord {
    pub partition: PartitionKey,
    pub offset: String,
    pub ordinal: u64,
    pub sequence: u64,
    pub stage: QuarantineStage,
    pub code: String,
    pub detail: String,
    /// The payload exactly as the source delivered it; base64 when serialized.
    #[serde(serialize_with = "serialize_base64")]
    pub payload: Arc<[u8]>,
    pub quarantined_at: DateTime<Utc>,
}

fn serialize_base64<S: Serializer>(bytes: &Arc<[u8]>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

impl QuarantinedRecord {
    /// Quarantine entry for a record the transform engine rejected.
    pub fn rejected(record: &TransformedRecord, sequence: u64) -> Self {
        let (code, detail) = match record.rejection() {
            Some(r) => (r.code.as_str().to_string(), r.to_string()),
            None => ("unknown".to_string(), String::new()),
        };
        Self::build(record, sequence, QuarantineStage::Transform, code, detail)
    }

    /// Quarantine entry for a record of a batch the warehouse refused.
    pub fn load_rejected(record: &TransformedRecord, sequence: u64, detail: &str) -> Self {
        Self::build(
            record,
            sequence,
            QuarantineStage::Load,
            "load_rejected".to_string(),
            detail.to_string(),
        )
    }

    fn build(
        record: &TransformedRecord,
        sequence: u64,
        stage: QuarantineStage,
        code: String,
        detail: String,
    ) -> Self {
        Self {
            partition: record.partition.clone(),
            offset: record.offset.clone(),
            ordinal: record.ordinal,
            sequence,
            stage,
            code,
            detail,
            payload: Arc::clone(&record.payload),
            quarantined_at: Utc::now(),
        }
    }
}
