//! Transform engine for Sluice pipelines.
//!
//! Runs every staged record through the ordered `transform.steps` of a
//! pipeline. A record that fails any step is routed to `rejected` with the
//! reason and the step name; the rest of the batch is unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::config::StepSpec;
use sluice_core::{
    Batch, PipelineSpec, RawRecord, RejectCode, Transform, TransformOutput, TransformRejected, TransformedRecord,
};
use tracing::debug;

pub mod expr;
pub mod lookup;
pub mod steps;

pub use lookup::{LookupError, LookupTable, StaticLookup};

/// Applies a closed list of steps to each record of a batch.
pub struct TransformEngine {
    steps: Vec<StepSpec>,
    lookups: HashMap<String, Arc<dyn LookupTable>>,
}

impl TransformEngine {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            steps,
            lookups: HashMap::new(),
        }
    }

    /// Engine for a pipeline, with its inline `lookups` tables registered.
    pub fn from_spec(spec: &PipelineSpec) -> Self {
        spec.lookups.iter().fold(
            Self::new(spec.transform.steps.clone()),
            |engine, (name, entries)| engine.with_lookup(name, Arc::new(StaticLookup::new(entries.clone()))),
        )
    }

    pub fn with_lookup(mut self, name: impl Into<String>, table: Arc<dyn LookupTable>) -> Self {
        self.lookups.insert(name.into(), table);
        self
    }

    /// Transform a single record. The result carries its own status.
    pub async fn transform_record(&self, raw: &RawRecord) -> TransformedRecord {
        let mut record = TransformedRecord::from_raw(raw);

        let mut fields = match serde_json::from_slice::<Value>(raw.payload()) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                let found = match other {
                    Value::Array(_) => "array",
                    Value::String(_) => "string",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    _ => "null",
                };
                return record.reject(TransformRejected::new(
                    RejectCode::Malformed,
                    "decode",
                    format!("expected a JSON object, got {found}"),
                ));
            }
            Err(e) => {
                return record.reject(TransformRejected::new(RejectCode::Malformed, "decode", e.to_string()));
            }
        };

        for step in &self.steps {
            let name = step.name();
            let applied = match step {
                StepSpec::Map(s) => {
                    steps::apply_map(s, &mut fields, raw.extracted_at());
                    Ok(())
                }
                StepSpec::Coerce(s) => steps::apply_coerce(name, s, &mut fields),
                StepSpec::Validate(s) => steps::apply_validate(name, s, &fields),
                StepSpec::Enrich(s) => steps::apply_enrich(name, s, &mut fields, &self.lookups).await,
                StepSpec::DedupKey(s) => steps::dedup_key(name, s, &fields).map(|key| {
                    record.natural_key = key;
                }),
            };
            if let Err(reason) = applied {
                record.fields = fields;
                return record.reject(reason);
            }
        }

        record.fields = fields;
        record
    }
}

#[async_trait]
impl Transform for TransformEngine {
    async fn transform(&self, batch: &Batch<RawRecord>) -> TransformOutput {
        let mut output = TransformOutput::default();
        for raw in &batch.records {
            let record = self.transform_record(raw).await;
            if record.is_valid() {
                output.validated.push(record);
            } else {
                output.rejected.push(record);
            }
        }
        debug!(
            partition = %batch.partition,
            sequence = batch.sequence,
            validated = output.validated.len(),
            rejected = output.rejected.len(),
            "Transformed batch"
        );
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use sluice_core::config::parse_pipeline_str;
    use sluice_core::PartitionKey;

    const PIPELINE: &str = r#"
name: markets
sources:
  - { type: jsonl, id: api, glob: "*.jsonl" }
lookups:
  sectors:
    bitcoin: { sector: currency }
transform:
  steps:
    - kind: map
      rename: { id: coin_id }
      defaults: { total_volume: 0, price_change_percentage_24h: 0.0 }
      stamp_extracted_at: extracted_at
    - kind: validate
      name: critical
      required: [coin_id, symbol, current_price]
    - kind: coerce
      fields:
        current_price: { to: float, decimals: 8 }
        total_volume: { to: integer, on_error: default }
    - kind: enrich
      lookup: { table: sectors, key_field: coin_id }
      derive:
        - field: volatility_score
          expr: { mul: [ { abs: { field: price_change_percentage_24h } }, { field: total_volume } ] }
    - kind: dedup_key
      fields: [coin_id, extracted_at]
warehouse: { type: memory }
"#;

    fn engine() -> TransformEngine {
        TransformEngine::from_spec(&parse_pipeline_str(PIPELINE).unwrap())
    }

    fn raw(offset: u64, payload: &str) -> RawRecord {
        RawRecord::new(
            PartitionKey::new("api", "page-1"),
            offset.to_string(),
            offset,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            payload.as_bytes().to_vec(),
        )
    }

    #[tokio::test]
    async fn runs_steps_in_order() {
        let record = engine()
            .transform_record(&raw(
                1,
                r#"{"id":"bitcoin","symbol":"btc","current_price":"43250.123456789","total_volume":"n/a","price_change_percentage_24h":-2.0}"#,
            ))
            .await;
        assert!(record.is_valid(), "{:?}", record.rejection());
        assert_eq!(record.natural_key, "bitcoin|2024-03-01T12:00:00Z");
        assert_eq!(record.fields["current_price"], json!(43250.12345679));
        assert_eq!(record.fields["total_volume"], json!(0));
        assert_eq!(record.fields["sector"], json!("currency"));
        assert_eq!(record.fields["volatility_score"], json!(0.0));
        assert!(!record.fields.contains_key("id"));
    }

    #[tokio::test]
    async fn failing_step_names_itself() {
        let record = engine()
            .transform_record(&raw(2, r#"{"id":"eth","symbol":"eth","current_price":null}"#))
            .await;
        let reason = record.rejection().unwrap();
        assert_eq!(reason.code, RejectCode::MissingField);
        assert_eq!(reason.step, "critical");
        assert_eq!(record.natural_key, "api/page-1/2");
    }

    #[tokio::test]
    async fn non_objects_are_malformed() {
        let e = engine();
        for payload in ["[1,2]", "not json", "\"text\"", ""] {
            let record = e.transform_record(&raw(3, payload)).await;
            assert_eq!(record.rejection().map(|r| r.code), Some(RejectCode::Malformed), "{payload}");
        }
    }

    #[tokio::test]
    async fn batch_splits_valid_and_rejected() {
        let batch = Batch::new(
            PartitionKey::new("api", "page-1"),
            3,
            "3",
            vec![
                raw(1, r#"{"id":"a","symbol":"a","current_price":1}"#),
                raw(2, r#"{"id":"b","symbol":"b"}"#),
                raw(3, r#"{"id":"c","symbol":"c","current_price":3}"#),
            ],
        );
        let out = engine().transform(&batch).await;
        assert_eq!(out.validated.len(), 2);
        assert_eq!(out.rejected.len(), 1);
        assert_eq!(out.rejected[0].offset, "2");
    }

    #[tokio::test]
    async fn no_steps_passes_objects_through_with_default_key() {
        let record = TransformEngine::new(Vec::new())
            .transform_record(&raw(9, r#"{"x":1}"#))
            .await;
        assert!(record.is_valid());
        assert_eq!(record.natural_key, "api/page-1/9");
        assert_eq!(record.fields["x"], json!(1));
    }
}
