//! Run reports and process exit codes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::EtlError;
use crate::model::PartitionKey;

/// Terminal state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Done,
    Failed,
    Cancelled,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// 0 on success, 1 when any partition failed, 130 when cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Cancelled => 130,
        }
    }
}

/// Outcome of one partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    #[serde(flatten)]
    pub partition: PartitionKey,
    pub status: PartitionStatus,
    pub records_read: u64,
    /// Records that passed every transform step.
    pub records_transformed: u64,
    pub records_rejected: u64,
    pub records_loaded: u64,
    pub records_quarantined: u64,
    pub batches: u64,
    pub retries: u32,
    /// Checkpoint sequence when the partition stopped.
    pub checkpoint: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartitionReport {
    pub fn new(partition: PartitionKey) -> Self {
        Self {
            partition,
            status: PartitionStatus::Done,
            records_read: 0,
            records_transformed: 0,
            records_rejected: 0,
            records_loaded: 0,
            records_quarantined: 0,
            batches: 0,
            retries: 0,
            checkpoint: 0,
            error_kind: None,
            error: None,
        }
    }

    pub fn fail(&mut self, err: &EtlError) {
        self.status = PartitionStatus::Failed;
        self.error_kind = Some(err.kind().to_string());
        self.error = Some(err.to_string());
    }
}

/// Counts aggregated over every partition of one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub partitions: u64,
    pub partitions_failed: u64,
    pub records_read: u64,
    pub records_transformed: u64,
    pub records_rejected: u64,
    pub records_loaded: u64,
    pub records_quarantined: u64,
}

impl SourceCounts {
    fn add(&mut self, p: &PartitionReport) {
        self.partitions += 1;
        if p.status == PartitionStatus::Failed {
            self.partitions_failed += 1;
        }
        self.records_read += p.records_read;
        self.records_transformed += p.records_transformed;
        self.records_rejected += p.records_rejected;
        self.records_loaded += p.records_loaded;
        self.records_quarantined += p.records_quarantined;
    }
}

/// The result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub totals: SourceCounts,
    pub sources: BTreeMap<String, SourceCounts>,
    pub partitions: Vec<PartitionReport>,
}

impl RunReport {
    /// Aggregate partition outcomes into a final report.
    ///
    /// The run failed if any partition failed, was cancelled if any
    /// partition was cancelled, and succeeded otherwise.
    pub fn finalize(
        run_id: Uuid,
        pipeline: impl Into<String>,
        started_at: DateTime<Utc>,
        mut partitions: Vec<PartitionReport>,
    ) -> Self {
        partitions.sort_by(|a, b| a.partition.cmp(&b.partition));

        let mut totals = SourceCounts::default();
        let mut sources: BTreeMap<String, SourceCounts> = BTreeMap::new();
        for p in &partitions {
            totals.add(p);
            sources.entry(p.partition.source_id.clone()).or_default().add(p);
        }

        let status = if partitions.iter().any(|p| p.status == PartitionStatus::Failed) {
            RunStatus::Failed
        } else if partitions.iter().any(|p| p.status == PartitionStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Succeeded
        };

        Self {
            run_id,
            pipeline: pipeline.into(),
            status,
            started_at,
            finished_at: Utc::now(),
            totals,
            sources,
            partitions,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn partition(&self, source_id: &str, partition_id: &str) -> Option<&PartitionReport> {
        self.partitions
            .iter()
            .find(|p| p.partition.source_id == source_id && p.partition.partition_id == partition_id)
    }

    /// Emit the report as a structured event.
    pub fn log(&self) {
        let elapsed_ms = (self.finished_at - self.started_at).num_milliseconds();
        info!(
            run_id = %self.run_id,
            pipeline = %self.pipeline,
            status = self.status.as_str(),
            partitions = self.totals.partitions,
            partitions_failed = self.totals.partitions_failed,
            read = self.totals.records_read,
            transformed = self.totals.records_transformed,
            rejected = self.totals.records_rejected,
            loaded = self.totals.records_loaded,
            quarantined = self.totals.records_quarantined,
            elapsed_ms,
            "Run finished"
        );
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(source: &str, partition: &str, status: PartitionStatus, loaded: u64) -> PartitionReport {
        let mut p = PartitionReport::new(PartitionKey::new(source, partition));
        p.status = status;
        p.records_read = loaded + 1;
        p.records_loaded = loaded;
        p
    }

    #[test]
    fn all_done_succeeds() {
        let report = RunReport::finalize(
            Uuid::new_v4(),
            "p",
            Utc::now(),
            vec![
                part("b", "0", PartitionStatus::Done, 3),
                part("a", "1", PartitionStatus::Done, 2),
                part("a", "0", PartitionStatus::Done, 1),
            ],
        );
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.partitions[0].partition, PartitionKey::new("a", "0"));
        assert_eq!(report.sources["a"].records_loaded, 3);
        assert_eq!(report.sources["a"].partitions, 2);
        assert_eq!(report.totals.records_read, 9);
    }

    #[test]
    fn failure_dominates_cancellation() {
        let report = RunReport::finalize(
            Uuid::new_v4(),
            "p",
            Utc::now(),
            vec![
                part("a", "0", PartitionStatus::Cancelled, 0),
                part("a", "1", PartitionStatus::Failed, 0),
            ],
        );
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.sources["a"].partitions_failed, 1);
    }

    #[test]
    fn cancelled_run_exits_130() {
        let report = RunReport::finalize(
            Uuid::new_v4(),
            "p",
            Utc::now(),
            vec![
                part("a", "0", PartitionStatus::Done, 1),
                part("a", "1", PartitionStatus::Cancelled, 0),
            ],
        );
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.exit_code(), 130);
    }

    #[test]
    fn failed_partition_serializes_error() {
        let mut p = PartitionReport::new(PartitionKey::new("api", "page-1"));
        p.fail(&EtlError::source_corrupt("api", "body is not an array"));
        let report = RunReport::finalize(Uuid::nil(), "crypto", Utc::now(), vec![p]);
        let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
        let first = &json["partitions"][0];
        assert_eq!(first["source_id"], "api");
        assert_eq!(first["status"], "failed");
        assert_eq!(first["error_kind"], "source_corrupt");
        assert_eq!(json["status"], "failed");
    }
}
