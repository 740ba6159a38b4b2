//! Dead-letter area as JSON-lines files, one per source partition:
//! `<dir>/<source>/<partition>.jsonl`. Payloads are base64 so any bytes
//! survive the round trip.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sluice_core::{EtlError, PartitionKey, Quarantine, QuarantinedRecord, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Serialize)]
struct Entry<'a> {
    run_id: Uuid,
    #[serde(flatten)]
    record: &'a QuarantinedRecord,
}

type SeenKeys = HashSet<(String, String)>;

pub struct FileQuarantine {
    dir: PathBuf,
    /// `(offset, stage)` keys per file, loaded from disk on first use.
    seen: Mutex<HashMap<PathBuf, SeenKeys>>,
}

impl FileQuarantine {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, partition: &PartitionKey) -> PathBuf {
        self.dir
            .join(file_safe(&partition.source_id))
            .join(format!("{}.jsonl", file_safe(&partition.partition_id)))
    }
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') || c.is_control() { '_' } else { c })
        .collect()
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> EtlError {
    EtlError::state_unavailable(format!("{}: {}", path.display(), err))
}

/// `(offset, stage)` of every entry already in the file.
async fn existing_keys(path: &Path) -> Result<SeenKeys> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(e) => return Err(unavailable(path, e)),
    };
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|entry| {
            let offset = entry.get("offset")?.as_str()?.to_string();
            let stage = entry.get("stage")?.as_str()?.to_string();
            Some((offset, stage))
        })
        .collect())
}

#[async_trait]
impl Quarantine for FileQuarantine {
    async fn quarantine(&self, run_id: Uuid, records: &[QuarantinedRecord]) -> Result<u64> {
        let mut by_partition: BTreeMap<&PartitionKey, Vec<&QuarantinedRecord>> = BTreeMap::new();
        for record in records {
            by_partition.entry(&record.partition).or_default().push(record);
        }

        let mut seen_by_file = self.seen.lock().await;
        for (partition, entries) in by_partition {
            let path = self.path_for(partition);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| unavailable(parent, e))?;
            }

            if !seen_by_file.contains_key(&path) {
                let keys = existing_keys(&path).await?;
                seen_by_file.insert(path.clone(), keys);
            }
            let Some(seen) = seen_by_file.get_mut(&path) else {
                continue;
            };

            let mut out = String::new();
            let mut added = SeenKeys::new();
            for record in entries {
                let key = (record.offset.clone(), record.stage.as_str().to_string());
                if seen.contains(&key) || !added.insert(key) {
                    continue;
                }
                let line = serde_json::to_string(&Entry { run_id, record })
                    .map_err(|e| EtlError::Internal(anyhow::Error::new(e).context("serializing quarantine entry")))?;
                out.push_str(&line);
                out.push('\n');
            }
            if out.is_empty() {
                continue;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| unavailable(&path, e))?;
            file.write_all(out.as_bytes()).await.map_err(|e| unavailable(&path, e))?;
            file.sync_data().await.map_err(|e| unavailable(&path, e))?;
            // Keys count as seen only once they are on disk.
            seen.extend(added);
            debug!(path = %path.display(), "Appended quarantine entries");
        }
        Ok(records.len() as u64)
    }
}
