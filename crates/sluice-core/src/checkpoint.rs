//! Checkpoint store contract and the in-memory implementation.
//!
//! A checkpoint only moves forward: [`CheckpointStore::advance`] refuses any
//! value that does not strictly succeed the stored sequence, which keeps
//! concurrent or duplicated retries from rewinding a partition.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{EtlError, Result};
use crate::model::{Checkpoint, PartitionKey};

/// Durable per-partition progress.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Current checkpoint, or [`Checkpoint::zero`] if none was ever committed.
    async fn get(&self, source_id: &str, partition_id: &str) -> Result<Checkpoint>;

    /// Compare-and-advance.
    ///
    /// # Errors
    ///
    /// Returns [`EtlError::StaleCheckpoint`] when `new.sequence` is not
    /// greater than the stored sequence.
    async fn advance(&self, source_id: &str, partition_id: &str, new: &Checkpoint) -> Result<()>;

    /// Every stored checkpoint, ordered by partition.
    async fn list(&self) -> Result<Vec<(PartitionKey, Checkpoint)>>;
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<PartitionKey, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PartitionKey, Checkpoint>>> {
        self.entries
            .lock()
            .map_err(|_| EtlError::Internal(anyhow::anyhow!("checkpoint store lock poisoned")))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, source_id: &str, partition_id: &str) -> Result<Checkpoint> {
        let entries = self.lock()?;
        Ok(entries
            .get(&PartitionKey::new(source_id, partition_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn advance(&self, source_id: &str, partition_id: &str, new: &Checkpoint) -> Result<()> {
        let mut entries = self.lock()?;
        let key = PartitionKey::new(source_id, partition_id);
        let stored = entries.get(&key).map(|c| c.sequence).unwrap_or(0);
        if new.sequence <= stored {
            return Err(EtlError::StaleCheckpoint {
                source_id: source_id.to_string(),
                partition_id: partition_id.to_string(),
                stored,
                attempted: new.sequence,
            });
        }
        entries.insert(
            key,
            Checkpoint {
                sequence: new.sequence,
                cursor: new.cursor.clone(),
                updated_at: Some(Utc::now()),
            },
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(PartitionKey, Checkpoint)>> {
        let entries = self.lock()?;
        let mut all: Vec<_> = entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}
