//! End-to-end runs of the orchestrator with the transform engine and the
//! in-memory source, warehouse and state stores.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use sluice_core::{CheckpointStore, EtlError, PartitionStatus, QuarantineStage, RunStatus};
use tokio_util::sync::CancellationToken;

use common::{record, source, ObservedCheckpoints, Pipeline};

fn five_records_with_third_invalid() -> Vec<String> {
    vec![
        record("r1", 10.0),
        record("r2", 20.5),
        r#"{"id":"r3"}"#.to_string(),
        record("r4", 40.0),
        record("r5", 50.25),
    ]
}

fn loaded_fields(p: &Pipeline) -> BTreeMap<String, (u64, Value)> {
    p.warehouse
        .rows()
        .unwrap()
        .into_iter()
        .map(|(k, row)| (k, (row.sequence, Value::Object(row.fields))))
        .collect()
}

#[tokio::test]
async fn five_records_one_rejected() {
    let p = Pipeline::new(source(2, &[("day1", five_records_with_third_invalid())]));
    let report = p.run().await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.exit_code(), 0);
    let day1 = report.partition("feed", "day1").unwrap();
    assert_eq!(day1.records_read, 5);
    assert_eq!(day1.records_transformed, 4);
    assert_eq!(day1.records_rejected, 1);
    assert_eq!(day1.records_loaded, 4);
    assert_eq!(day1.batches, 3);
    assert_eq!(day1.checkpoint, 5);

    let keys: Vec<String> = p.warehouse.rows().unwrap().into_keys().collect();
    assert_eq!(keys, vec!["r1", "r2", "r4", "r5"]);

    let quarantined = p.quarantine.records().unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].offset, "2");
    assert_eq!(quarantined[0].ordinal, 3);
    assert_eq!(quarantined[0].code, "missing_field");
    assert_eq!(quarantined[0].stage, QuarantineStage::Transform);
    assert_eq!(&*quarantined[0].payload, br#"{"id":"r3"}"#);

    let cp = p.checkpoints.get("feed", "day1").await.unwrap();
    assert_eq!(cp.sequence, 5);
}

#[tokio::test]
async fn one_bad_record_does_not_fail_the_batch() {
    let mut payloads: Vec<String> = (0..9).map(|i| record(&format!("k{i}"), i as f64)).collect();
    payloads.insert(4, record("negative", -1.0));
    let p = Pipeline::new(source(100, &[("only", payloads)]));
    let report = p.run().await;

    let only = report.partition("feed", "only").unwrap();
    assert_eq!(only.status, PartitionStatus::Done);
    assert_eq!(only.batches, 1);
    assert_eq!((only.records_transformed, only.records_rejected), (9, 1));
    assert_eq!(p.quarantine.records().unwrap()[0].code, "constraint_violated");
}

#[tokio::test]
async fn redelivery_after_crash_matches_clean_run() {
    let payloads: Vec<String> = (1..=5).map(|i| record(&format!("r{i}"), i as f64)).collect();

    let clean = Pipeline::new(source(2, &[("day1", payloads.clone())]));
    clean.run().await;

    // The second batch is loaded but its checkpoint is never written.
    let mut crashed = Pipeline::new(source(2, &[("day1", payloads)]));
    let observed = Arc::new(ObservedCheckpoints::new().failing_on(2));
    crashed.checkpoints = observed.clone();

    let first = crashed.run().await;
    let day1 = first.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Failed);
    assert_eq!(day1.checkpoint, 2);
    assert_eq!(crashed.warehouse.len().unwrap(), 4);

    let second = crashed.run().await;
    let day1 = second.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Done);
    assert_eq!(day1.records_read, 3, "batch 2 is redelivered, batch 1 is not");
    assert_eq!(day1.checkpoint, 5);

    assert_eq!(loaded_fields(&crashed), loaded_fields(&clean));
}

#[tokio::test]
async fn clean_resume_loads_nothing_twice() {
    let p = Pipeline::new(source(2, &[("day1", five_records_with_third_invalid())]));
    p.run().await;
    let calls = p.warehouse.load_calls();

    let again = p.run().await;
    assert_eq!(again.status, RunStatus::Succeeded);
    assert_eq!(again.totals.records_read, 0);
    assert_eq!(p.warehouse.load_calls(), calls);
    assert_eq!(p.quarantine.records().unwrap().len(), 1);
}

#[tokio::test]
async fn checkpoints_strictly_increase_per_partition() {
    let mut p = Pipeline::new(source(
        3,
        &[
            ("a", (0..10).map(|i| record(&format!("a{i}"), 1.0)).collect()),
            ("b", (0..7).map(|i| record(&format!("b{i}"), 1.0)).collect()),
            ("c", Vec::new()),
        ],
    ));
    p.run.max_concurrency = 2;
    let observed = Arc::new(ObservedCheckpoints::new());
    p.checkpoints = observed.clone();

    let report = p.run().await;
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.partition("feed", "c").unwrap().checkpoint, 0);

    let advances = observed.advances.lock().unwrap().clone();
    for partition in ["a", "b"] {
        let seqs: Vec<u64> = advances
            .iter()
            .filter(|(k, _)| k.partition_id == partition)
            .map(|(_, s)| *s)
            .collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{partition}: {seqs:?}");
    }
    assert_eq!(p.warehouse.len().unwrap(), 17);
}

#[tokio::test(start_paused = true)]
async fn failures_within_budget_are_absorbed() {
    let p = Pipeline::new(source(10, &[("day1", vec![record("x", 1.0)])]));
    for _ in 0..3 {
        p.source
            .fail_next_read("day1", EtlError::source_unavailable("feed", "503 Service Unavailable"))
            .unwrap();
    }
    let report = p.run().await;
    let day1 = report.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Done);
    assert_eq!(day1.retries, 3);
    assert_eq!(day1.records_loaded, 1);
}

#[tokio::test(start_paused = true)]
async fn failures_beyond_budget_fail_the_partition() {
    let p = Pipeline::new(source(10, &[("day1", vec![record("x", 1.0)]), ("day2", vec![record("y", 2.0)])]));
    for _ in 0..4 {
        p.source
            .fail_next_read("day1", EtlError::source_unavailable("feed", "connection refused"))
            .unwrap();
    }
    let report = p.run().await;

    let day1 = report.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Failed);
    assert_eq!(day1.retries, 3);
    assert_eq!(report.partition("feed", "day2").unwrap().status, PartitionStatus::Done);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn warehouse_outage_is_retried_then_loaded() {
    let p = Pipeline::new(source(10, &[("day1", vec![record("x", 1.0), record("y", 2.0)])]));
    p.warehouse
        .fail_next_load(EtlError::load_unavailable("pool timed out"))
        .unwrap();
    let report = p.run().await;
    let day1 = report.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Done);
    assert_eq!(day1.retries, 1);
    assert_eq!(p.warehouse.len().unwrap(), 2);
}

#[tokio::test]
async fn cancellation_stops_between_batches_and_resumes() {
    let cancel = CancellationToken::new();
    let payloads: Vec<String> = (1..=5).map(|i| record(&format!("r{i}"), i as f64)).collect();
    let mut p = Pipeline::new(source(2, &[("day1", payloads)]));
    p.checkpoints = Arc::new(ObservedCheckpoints::new().cancelling_after(1, cancel.clone()));

    let first = p.run_with(cancel).await;
    assert_eq!(first.status, RunStatus::Cancelled);
    assert_eq!(first.exit_code(), 130);
    let day1 = first.partition("feed", "day1").unwrap();
    assert_eq!(day1.status, PartitionStatus::Cancelled);
    assert_eq!(day1.checkpoint, 2);
    assert_eq!(p.warehouse.len().unwrap(), 2);

    let second = p.run().await;
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(second.partition("feed", "day1").unwrap().records_read, 3);
    assert_eq!(p.warehouse.len().unwrap(), 5);
}
