//! JSON-lines file source.
//!
//! Each file is one partition. The cursor is the byte offset just past the
//! last consumed line, so a resumed read seeks straight to the first
//! unconsumed record.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use glob::glob;
use sluice_core::config::JsonlSourceSpec;
use sluice_core::{
    BatchLimits, Batch, Checkpoint, EtlError, PartitionKey, RawRecord, ReadOutcome, Result, SourceReader,
};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct JsonlSource {
    spec: JsonlSourceSpec,
    limits: BatchLimits,
    paths: RwLock<BTreeMap<String, PathBuf>>,
}

impl JsonlSource {
    pub fn new(spec: JsonlSourceSpec, limits: BatchLimits) -> Self {
        Self {
            spec,
            limits,
            paths: RwLock::new(BTreeMap::new()),
        }
    }

    /// Explicit partitions plus every glob match, keyed by partition id.
    fn discover(&self) -> Result<BTreeMap<String, PathBuf>> {
        let mut paths: BTreeMap<String, PathBuf> = self
            .spec
            .partitions
            .iter()
            .map(|p| (p.id.clone(), p.path.clone()))
            .collect();

        if let Some(pattern) = &self.spec.glob {
            for entry in glob(pattern).with_context(|| format!("invalid glob '{pattern}'"))? {
                let path = entry.context("glob")?;
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Some(existing) = paths.get(stem) {
                    if existing != &path {
                        return Err(EtlError::Internal(anyhow::anyhow!(
                            "partition '{}' of source '{}' matches both {} and {}",
                            stem,
                            self.spec.id,
                            existing.display(),
                            path.display()
                        )));
                    }
                    continue;
                }
                paths.insert(stem.to_string(), path);
            }
        }
        Ok(paths)
    }

    async fn path_of(&self, partition_id: &str) -> Result<PathBuf> {
        if let Some(path) = self.paths.read().await.get(partition_id) {
            return Ok(path.clone());
        }
        let discovered = self.discover()?;
        let path = discovered.get(partition_id).cloned().ok_or_else(|| {
            EtlError::Internal(anyhow::anyhow!(
                "unknown partition '{}' of source '{}'",
                partition_id,
                self.spec.id
            ))
        })?;
        *self.paths.write().await = discovered;
        Ok(path)
    }

    fn unavailable(&self, path: &Path, err: std::io::Error) -> EtlError {
        EtlError::source_unavailable(&self.spec.id, format!("{}: {}", path.display(), err))
    }

    fn corrupt(&self, path: &Path, message: impl std::fmt::Display) -> EtlError {
        EtlError::source_corrupt(&self.spec.id, format!("{}: {}", path.display(), message))
    }

    /// Validate a stored cursor against the file: it must parse, lie within
    /// the file and sit on a line boundary.
    async fn start_offset(&self, file: &mut File, path: &Path, checkpoint: &Checkpoint, len: u64) -> Result<u64> {
        let Some(cursor) = checkpoint.cursor.as_deref() else {
            return Ok(0);
        };
        let offset: u64 = cursor
            .parse()
            .map_err(|_| self.corrupt(path, format_args!("invalid cursor '{cursor}'")))?;
        if offset > len {
            return Err(self.corrupt(path, format_args!("cursor {offset} is past the end of the file ({len} bytes)")));
        }
        if offset > 0 && offset < len {
            file.seek(SeekFrom::Start(offset - 1))
                .await
                .map_err(|e| self.unavailable(path, e))?;
            let previous = file.read_u8().await.map_err(|e| self.unavailable(path, e))?;
            if previous != b'\n' {
                return Err(self.corrupt(path, format_args!("cursor {offset} is not at a line boundary")));
            }
        }
        Ok(offset)
    }
}

#[async_trait]
impl SourceReader for JsonlSource {
    fn source_id(&self) -> &str {
        &self.spec.id
    }

    async fn partitions(&self) -> Result<Vec<String>> {
        let discovered = self.discover()?;
        info!(source = %self.spec.id, files = discovered.len(), "Discovered JSON-lines partitions");
        let ids = discovered.keys().cloned().collect();
        *self.paths.write().await = discovered;
        Ok(ids)
    }

    async fn read_next_batch(&self, partition_id: &str, checkpoint: &Checkpoint) -> Result<ReadOutcome> {
        let path = self.path_of(partition_id).await?;
        let mut file = File::open(&path).await.map_err(|e| self.unavailable(&path, e))?;
        let len = file.metadata().await.map_err(|e| self.unavailable(&path, e))?.len();

        let start = self.start_offset(&mut file, &path, checkpoint, len).await?;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|e| self.unavailable(&path, e))?;

        let key = PartitionKey::new(&self.spec.id, partition_id);
        let extracted_at = Utc::now();
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut bytes = 0usize;
        let mut position = start;
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|e| self.unavailable(&path, e))?;
            if read == 0 {
                break;
            }
            let line_start = position;

            let mut content = line.as_slice();
            if let Some(stripped) = content.strip_suffix(b"\n") {
                content = stripped;
            }
            if let Some(stripped) = content.strip_suffix(b"\r") {
                content = stripped;
            }
            if content.iter().all(u8::is_ascii_whitespace) {
                position += read as u64;
                continue;
            }
            if std::str::from_utf8(content).is_err() {
                return Err(self.corrupt(&path, format_args!("line at byte {line_start} is not valid UTF-8")));
            }
            if !self.limits.admits(records.len(), bytes, content.len()) {
                break;
            }

            position += read as u64;
            bytes += content.len();
            let ordinal = checkpoint.sequence + records.len() as u64 + 1;
            records.push(RawRecord::new(
                key.clone(),
                line_start.to_string(),
                ordinal,
                extracted_at,
                content.to_vec(),
            ));
        }

        if records.is_empty() {
            debug!(partition = %key, offset = position, "End of file");
            return Ok(ReadOutcome::EndOfSource);
        }
        let sequence = checkpoint.sequence + records.len() as u64;
        Ok(ReadOutcome::Batch(Batch::new(key, sequence, position.to_string(), records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::config::FilePartitionSpec;
    use tempfile::TempDir;

    fn source_for(dir: &TempDir, files: &[(&str, &str)], max_records: usize) -> JsonlSource {
        let partitions = files
            .iter()
            .map(|(name, content)| {
                let path = dir.path().join(format!("{name}.jsonl"));
                std::fs::write(&path, content).unwrap();
                FilePartitionSpec {
                    id: name.to_string(),
                    path,
                }
            })
            .collect();
        JsonlSource::new(
            JsonlSourceSpec {
                id: "files".to_string(),
                partitions,
                glob: None,
            },
            BatchLimits::records(max_records),
        )
    }

    async fn batch(src: &JsonlSource, partition: &str, cp: &Checkpoint) -> Batch<RawRecord> {
        match src.read_next_batch(partition, cp).await.unwrap() {
            ReadOutcome::Batch(b) => b,
            ReadOutcome::EndOfSource => panic!("unexpected end of source"),
        }
    }

    fn payloads(b: &Batch<RawRecord>) -> Vec<String> {
        b.records
            .iter()
            .map(|r| String::from_utf8(r.payload().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn reads_lines_in_batches_and_resumes_from_byte_offset() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("day1", "{\"a\":1}\n{\"a\":2}\n\n{\"a\":3}\n")], 2);

        let first = batch(&src, "day1", &Checkpoint::zero()).await;
        assert_eq!(payloads(&first), vec!["{\"a\":1}", "{\"a\":2}"]);
        assert_eq!(first.sequence, 2);
        // The blank line is consumed along with the batch.
        assert_eq!(first.cursor, "17");
        assert_eq!(first.records[1].offset(), "8");

        let second = batch(&src, "day1", &first.next_checkpoint()).await;
        assert_eq!(payloads(&second), vec!["{\"a\":3}"]);
        assert_eq!(second.records[0].ordinal(), 3);
        assert_eq!(second.records[0].offset(), "17");
        assert_eq!(second.sequence, 3);

        let end = src.read_next_batch("day1", &second.next_checkpoint()).await.unwrap();
        assert!(matches!(end, ReadOutcome::EndOfSource));
    }

    #[tokio::test]
    async fn last_line_without_newline_is_a_record() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "{\"a\":1}\r\n{\"a\":2}")], 10);
        let b = batch(&src, "p", &Checkpoint::zero()).await;
        assert_eq!(payloads(&b), vec!["{\"a\":1}", "{\"a\":2}"]);
        assert_eq!(b.cursor, "16");
    }

    #[tokio::test]
    async fn appended_lines_are_read_after_resume() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "{\"a\":1}\n")], 10);
        let first = batch(&src, "p", &Checkpoint::zero()).await;

        let path = dir.path().join("p.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").unwrap();
        let second = batch(&src, "p", &first.next_checkpoint()).await;
        assert_eq!(payloads(&second), vec!["{\"a\":2}"]);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn invalid_utf8_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "")], 10);
        std::fs::write(dir.path().join("p.jsonl"), b"{\"a\":1}\n\xff\xfe\n").unwrap();
        let err = src.read_next_batch("p", &Checkpoint::zero()).await.unwrap_err();
        assert!(matches!(err, EtlError::SourceCorrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn bad_cursors_are_corrupt() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "{\"a\":1}\n{\"a\":2}\n")], 10);
        for cursor in ["abc", "999", "3"] {
            let cp = Checkpoint {
                sequence: 1,
                cursor: Some(cursor.to_string()),
                updated_at: None,
            };
            let err = src.read_next_batch("p", &cp).await.unwrap_err();
            assert!(matches!(err, EtlError::SourceCorrupt { .. }), "{cursor}: {err}");
            assert!(!err.is_retryable());
        }
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "{}\n")], 10);
        std::fs::remove_file(dir.path().join("p.jsonl")).unwrap();
        let err = src.read_next_batch("p", &Checkpoint::zero()).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn glob_partitions_are_named_by_file_stem() {
        let dir = TempDir::new().unwrap();
        for name in ["2024-03-01", "2024-03-02"] {
            std::fs::write(dir.path().join(format!("{name}.jsonl")), "{}\n").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let src = JsonlSource::new(
            JsonlSourceSpec {
                id: "files".to_string(),
                partitions: Vec::new(),
                glob: Some(format!("{}/*.jsonl", dir.path().display())),
            },
            BatchLimits::default(),
        );
        assert_eq!(src.partitions().await.unwrap(), vec!["2024-03-01", "2024-03-02"]);
        let b = batch(&src, "2024-03-02", &Checkpoint::zero()).await;
        assert_eq!(b.partition, PartitionKey::new("files", "2024-03-02"));
    }

    #[tokio::test]
    async fn byte_limit_bounds_batches_but_admits_one_record() {
        let dir = TempDir::new().unwrap();
        let src = source_for(&dir, &[("p", "{\"long\":\"xxxxxxxxxx\"}\n{\"a\":1}\n")], 100);
        let src = JsonlSource {
            limits: BatchLimits {
                max_records: 100,
                max_bytes: 8,
            },
            ..src
        };
        let first = batch(&src, "p", &Checkpoint::zero()).await;
        assert_eq!(first.len(), 1);
        let second = batch(&src, "p", &first.next_checkpoint()).await;
        assert_eq!(payloads(&second), vec!["{\"a\":1}"]);
    }
}
