//! HTTP JSON API source.
//!
//! A partition is a set of query parameters merged over the source's base
//! parameters (e.g. `page=2`). The first read of a partition fetches the
//! response once as a snapshot; later reads page through that snapshot.
//! The cursor `<snapshot_id>:<index>` names the snapshot and the next
//! element to read.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use sluice_core::config::HttpSourceSpec;
use sluice_core::{
    Batch, BatchLimits, Checkpoint, EtlError, PartitionKey, RawRecord, ReadOutcome, Result, SourceReader,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Partition name used when the source declares no partitions.
pub const DEFAULT_PARTITION: &str = "default";

/// Used when a 429 response carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Snapshot {
    id: String,
    fetched_at: DateTime<Utc>,
    elements: Vec<Arc<[u8]>>,
}

pub struct HttpJsonSource {
    spec: HttpSourceSpec,
    limits: BatchLimits,
    client: Client,
    snapshots: Mutex<HashMap<String, Arc<Snapshot>>>,
}

impl HttpJsonSource {
    pub fn new(spec: HttpSourceSpec, limits: BatchLimits) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(spec.timeout_secs))
            .user_agent(concat!("sluice/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            spec,
            limits,
            client,
            snapshots: Mutex::new(HashMap::new()),
        })
    }

    fn query_for(&self, partition_id: &str) -> Result<BTreeMap<String, String>> {
        let mut query = self.spec.params.clone();
        if self.spec.partitions.is_empty() && partition_id == DEFAULT_PARTITION {
            return Ok(query);
        }
        let partition = self
            .spec
            .partitions
            .iter()
            .find(|p| p.id == partition_id)
            .ok_or_else(|| {
                EtlError::Internal(anyhow::anyhow!(
                    "unknown partition '{}' of source '{}'",
                    partition_id,
                    self.spec.id
                ))
            })?;
        query.extend(partition.params.clone());
        Ok(query)
    }

    async fn fetch(&self, partition_id: &str) -> Result<Snapshot> {
        let query = self.query_for(partition_id)?;
        info!(source = %self.spec.id, partition = partition_id, url = %self.spec.url, "Fetching snapshot");

        let response = self
            .client
            .get(&self.spec.url)
            .query(&query)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| EtlError::source_unavailable(&self.spec.id, format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(source = %self.spec.id, retry_after_secs = retry_after.as_secs(), "Rate limited");
            return Err(EtlError::SourceUnavailable {
                source_id: self.spec.id.clone(),
                message: "rate limited (429)".to_string(),
                retry_after: Some(retry_after),
            });
        }
        if status.is_server_error() {
            return Err(EtlError::source_unavailable(&self.spec.id, format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(EtlError::Internal(anyhow::anyhow!(
                "source '{}' request failed with status {}",
                self.spec.id,
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| EtlError::source_unavailable(&self.spec.id, format!("reading body failed: {e}")))?;
        let fetched_at = Utc::now();
        let snapshot = Snapshot {
            id: format!("{}-{}", fetched_at.format("%Y%m%dT%H%M%SZ"), &Uuid::new_v4().simple().to_string()[..8]),
            fetched_at,
            elements: self.split_elements(&body)?,
        };
        info!(
            source = %self.spec.id,
            partition = partition_id,
            snapshot = %snapshot.id,
            elements = snapshot.elements.len(),
            "Fetched snapshot"
        );

        if let Some(dir) = &self.spec.staging_dir {
            let path = dir
                .join(&self.spec.id)
                .join(partition_id)
                .join(format!("{}.json", snapshot.id));
            if let Err(e) = stage(&path, &body).await {
                warn!(path = %path.display(), error = %e, "Failed to stage raw response");
            }
        }
        Ok(snapshot)
    }

    /// Check the body is an array of objects carrying the required fields,
    /// and split it into one serialized payload per element.
    fn split_elements(&self, body: &[u8]) -> Result<Vec<Arc<[u8]>>> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| EtlError::source_corrupt(&self.spec.id, format!("response is not JSON: {e}")))?;
        let Value::Array(items) = value else {
            return Err(EtlError::source_corrupt(&self.spec.id, "response is not a JSON array"));
        };

        let mut elements = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let Some(object) = item.as_object() else {
                return Err(EtlError::source_corrupt(
                    &self.spec.id,
                    format!("element {index} is not an object"),
                ));
            };
            if let Some(missing) = self.spec.required_fields.iter().find(|f| !object.contains_key(*f)) {
                let id = object.get("id").and_then(Value::as_str).unwrap_or("unknown");
                return Err(EtlError::source_corrupt(
                    &self.spec.id,
                    format!("element {index} ({id}) is missing required field '{missing}'"),
                ));
            }
            let bytes = serde_json::to_vec(item).context("re-serializing response element")?;
            elements.push(Arc::from(bytes));
        }
        Ok(elements)
    }

    /// Snapshot and start index for a read.
    async fn position(&self, partition_id: &str, checkpoint: &Checkpoint) -> Result<(Arc<Snapshot>, usize)> {
        let cursor = checkpoint
            .cursor
            .as_deref()
            .map(|c| parse_cursor(c).ok_or_else(|| EtlError::source_corrupt(&self.spec.id, format!("invalid cursor '{c}'"))))
            .transpose()?;

        let current = self.snapshots.lock().await.get(partition_id).cloned();
        let (snapshot, index) = match (current, cursor) {
            (Some(snapshot), Some((id, index))) if snapshot.id == id => (snapshot, index),
            (Some(snapshot), None) => (snapshot, 0),
            (_, cursor) => {
                if let Some((id, _)) = cursor {
                    debug!(partition = partition_id, previous = id, "Cursor is from another snapshot, fetching a new one");
                }
                let fresh = Arc::new(self.fetch(partition_id).await?);
                self.snapshots
                    .lock()
                    .await
                    .insert(partition_id.to_string(), Arc::clone(&fresh));
                (fresh, 0)
            }
        };

        if index > snapshot.elements.len() {
            return Err(EtlError::source_corrupt(
                &self.spec.id,
                format!(
                    "cursor index {} is past the end of snapshot {} ({} elements)",
                    index,
                    snapshot.id,
                    snapshot.elements.len()
                ),
            ));
        }
        Ok((snapshot, index))
    }
}

fn parse_cursor(cursor: &str) -> Option<(&str, usize)> {
    let (id, index) = cursor.rsplit_once(':')?;
    if id.is_empty() {
        return None;
    }
    Some((id, index.parse().ok()?))
}

async fn stage(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await
}

#[async_trait]
impl SourceReader for HttpJsonSource {
    fn source_id(&self) -> &str {
        &self.spec.id
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        if self.spec.partitions.is_empty() {
            return Ok(vec![DEFAULT_PARTITION.to_string()]);
        }
        Ok(self.spec.partitions.iter().map(|p| p.id.clone()).collect())
    }

    async fn read_next_batch(&self, partition_id: &str, checkpoint: &Checkpoint) -> Result<ReadOutcome> {
        let (snapshot, start) = self.position(partition_id, checkpoint).await?;
        if start == snapshot.elements.len() {
            return Ok(ReadOutcome::EndOfSource);
        }

        let key = PartitionKey::new(&self.spec.id, partition_id);
        let mut records = Vec::new();
        let mut bytes = 0;
        for (index, payload) in snapshot.elements.iter().enumerate().skip(start) {
            if !self.limits.admits(records.len(), bytes, payload.len()) {
                break;
            }
            bytes += payload.len();
            let ordinal = checkpoint.sequence + records.len() as u64 + 1;
            records.push(RawRecord::new(
                key.clone(),
                format!("{}:{}", snapshot.id, index),
                ordinal,
                snapshot.fetched_at,
                Arc::clone(payload),
            ));
        }

        let end = start + records.len();
        let sequence = checkpoint.sequence + records.len() as u64;
        Ok(ReadOutcome::Batch(Batch::new(
            key,
            sequence,
            format!("{}:{}", snapshot.id, end),
            records,
        )))
    }
}
