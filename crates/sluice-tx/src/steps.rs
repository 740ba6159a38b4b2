//! The transform step variants.
//!
//! Each step works on the decoded field map of a single record and either
//! leaves it ready for the next step or rejects it with a reason. Steps
//! never look at other records.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use sluice_core::config::{
    CoerceStep, Coercion, DedupKeyStep, EnrichStep, FieldType, MapStep, OnError, ValidateStep,
};
use sluice_core::{RejectCode, TransformRejected};

use crate::expr;
use crate::lookup::LookupTable;

pub type Fields = Map<String, Value>;
type StepResult<T = ()> = Result<T, TransformRejected>;

pub fn apply_map(step: &MapStep, fields: &mut Fields, extracted_at: DateTime<Utc>) {
    for (from, to) in &step.rename {
        if let Some(value) = fields.remove(from) {
            fields.insert(to.clone(), value);
        }
    }
    for (field, default) in &step.defaults {
        if fields.get(field).map_or(true, Value::is_null) {
            fields.insert(field.clone(), default.clone());
        }
    }
    if let Some(target) = &step.stamp_extracted_at {
        fields.insert(target.clone(), Value::String(format_timestamp(extracted_at)));
    }
    if let Some(keep) = &step.select {
        fields.retain(|k, _| keep.iter().any(|s| s == k));
    }
}

pub fn apply_coerce(name: &str, step: &CoerceStep, fields: &mut Fields) -> StepResult {
    for (field, coercion) in &step.fields {
        let Some(current) = fields.get(field) else {
            continue;
        };
        if current.is_null() {
            continue;
        }
        let coerced = match coerce_value(current, coercion) {
            Some(v) => v,
            None if coercion.on_error == OnError::Default => zero_value(coercion.to),
            None => {
                return Err(TransformRejected::new(
                    RejectCode::TypeMismatch,
                    name,
                    format!("field '{}': cannot coerce {} to {}", field, current, coercion.to.as_str()),
                ))
            }
        };
        fields.insert(field.clone(), coerced);
    }
    Ok(())
}

pub fn apply_validate(name: &str, step: &ValidateStep, fields: &Fields) -> StepResult {
    for field in &step.required {
        if fields.get(field).map_or(true, Value::is_null) {
            return Err(TransformRejected::new(
                RejectCode::MissingField,
                name,
                format!("field '{field}' is missing or null"),
            ));
        }
    }
    for (field, expected) in &step.types {
        match fields.get(field) {
            None | Some(Value::Null) => {}
            Some(value) if conforms(value, *expected) => {}
            Some(value) => {
                return Err(TransformRejected::new(
                    RejectCode::TypeMismatch,
                    name,
                    format!("field '{}' expected {}, got {}", field, expected.as_str(), value),
                ))
            }
        }
    }
    for field in &step.non_negative {
        match fields.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                if n.as_f64().map_or(false, |x| x < 0.0) {
                    return Err(TransformRejected::new(
                        RejectCode::ConstraintViolated,
                        name,
                        format!("field '{field}' must be non-negative, got {n}"),
                    ));
                }
            }
            Some(value) => {
                return Err(TransformRejected::new(
                    RejectCode::TypeMismatch,
                    name,
                    format!("field '{field}' must be numeric, got {value}"),
                ))
            }
        }
    }
    Ok(())
}

/// Lookup first, then derived fields in declaration order.
pub async fn apply_enrich(
    name: &str,
    step: &EnrichStep,
    fields: &mut Fields,
    lookups: &HashMap<String, Arc<dyn LookupTable>>,
) -> StepResult {
    if let Some(spec) = &step.lookup {
        let key = match fields.get(&spec.key_field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(other) => {
                return Err(TransformRejected::new(
                    RejectCode::LookupFailed,
                    name,
                    format!("field '{}' cannot be used as a lookup key: {}", spec.key_field, other),
                ))
            }
        };

        let found = match key {
            None => None,
            Some(key) => {
                let table = lookups.get(&spec.table).ok_or_else(|| {
                    TransformRejected::new(
                        RejectCode::LookupFailed,
                        name,
                        format!("lookup table '{}' is not registered", spec.table),
                    )
                })?;
                table
                    .get(&key)
                    .await
                    .map_err(|e| TransformRejected::new(RejectCode::LookupFailed, name, e.to_string()))?
            }
        };

        match found {
            Some(extra) => {
                let prefix = spec.prefix.as_deref().unwrap_or("");
                for (k, v) in extra {
                    fields.insert(format!("{prefix}{k}"), v);
                }
            }
            None if spec.required => {
                return Err(TransformRejected::new(
                    RejectCode::LookupMiss,
                    name,
                    format!(
                        "no entry in '{}' for {}",
                        spec.table,
                        fields.get(&spec.key_field).cloned().unwrap_or(Value::Null)
                    ),
                ))
            }
            None => {}
        }
    }

    for derived in &step.derive {
        let value = expr::evaluate(&derived.expr, fields).map_err(|detail| {
            TransformRejected::new(
                RejectCode::InvalidExpression,
                name,
                format!("field '{}': {}", derived.field, detail),
            )
        })?;
        let number = Number::from_f64(value).ok_or_else(|| {
            TransformRejected::new(
                RejectCode::InvalidExpression,
                name,
                format!("field '{}': value {} is not representable", derived.field, value),
            )
        })?;
        fields.insert(derived.field.clone(), Value::Number(number));
    }
    Ok(())
}

/// Natural key from the listed fields.
pub fn dedup_key(name: &str, step: &DedupKeyStep, fields: &Fields) -> StepResult<String> {
    let mut parts = Vec::with_capacity(step.fields.len());
    for field in &step.fields {
        match fields.get(field) {
            None | Some(Value::Null) => {
                return Err(TransformRejected::new(
                    RejectCode::MissingKey,
                    name,
                    format!("key field '{field}' is missing or null"),
                ))
            }
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(other) => parts.push(other.to_string()),
        }
    }
    let joined = parts.join("|");
    if step.hash {
        let digest = Sha256::digest(joined.as_bytes());
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    } else {
        Ok(joined)
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn conforms(value: &Value, expected: FieldType) -> bool {
    match expected {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Timestamp => value.as_str().and_then(parse_timestamp).is_some(),
    }
}

fn zero_value(to: FieldType) -> Value {
    match to {
        FieldType::String => Value::String(String::new()),
        FieldType::Integer => Value::from(0i64),
        FieldType::Float => Value::from(0.0f64),
        FieldType::Boolean => Value::Bool(false),
        FieldType::Timestamp => Value::String("1970-01-01T00:00:00Z".to_string()),
    }
}

/// Convert `value`, or `None` when it has no sensible representation.
fn coerce_value(value: &Value, coercion: &Coercion) -> Option<Value> {
    match coercion.to {
        FieldType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        FieldType::Integer => {
            let i = match value {
                Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(truncate))?,
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().and_then(truncate))?
                }
                Value::Bool(b) => i64::from(*b),
                _ => return None,
            };
            Some(Value::from(i))
        }
        FieldType::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64()?,
                Value::String(s) => s.trim().parse::<f64>().ok()?,
                Value::Bool(b) => f64::from(u8::from(*b)),
                _ => return None,
            };
            let f = match coercion.decimals {
                Some(d) => round_to(f, d),
                None => f,
            };
            Number::from_f64(f).map(Value::Number)
        }
        FieldType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(x) if x == 0.0 => Some(Value::Bool(false)),
                Some(x) if x == 1.0 => Some(Value::Bool(true)),
                _ => None,
            },
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(Value::Bool(true)),
                "false" | "no" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        FieldType::Timestamp => match value {
            Value::String(s) => parse_timestamp(s).map(|ts| Value::String(format_timestamp(ts))),
            Value::Number(n) => {
                let secs = n.as_i64()?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .map(|ts| Value::String(format_timestamp(ts)))
            }
            _ => None,
        },
    }
}

fn truncate(f: f64) -> Option<i64> {
    let t = f.trunc();
    if t.is_finite() && t >= i64::MIN as f64 && t <= i64::MAX as f64 {
        Some(t as i64)
    } else {
        None
    }
}

fn round_to(x: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = x * factor;
    if scaled.is_finite() {
        scaled.round() / factor
    } else {
        x
    }
}
