//! Pipeline specification loaded from YAML.
//!
//! A [`PipelineSpec`] is parsed once, validated, and then handed to the
//! orchestrator as an immutable value. Nothing in the core reads process
//! state after that point.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! name: crypto-markets
//! batch:
//!   max_records: 100
//! retry:
//!   max_retries: 3
//! sources:
//!   - type: http_json
//!     id: coingecko
//!     url: https://api.coingecko.com/api/v3/coins/markets
//!     params: { vs_currency: usd, order: market_cap_desc, per_page: "20" }
//!     partitions:
//!       - { id: page-1, params: { page: "1" } }
//! transform:
//!   steps:
//!     - kind: validate
//!       required: [id, symbol, name, current_price]
//!     - kind: dedup_key
//!       fields: [id, extracted_at]
//! warehouse:
//!   type: postgres
//!   url: postgres://etl@localhost/crypto_db
//!   table: crypto_market
//! ```
//!
//! Any scalar can be overridden from the environment with
//! `SLUICE__<SECTION>__<KEY>`, e.g. `SLUICE__WAREHOUSE__URL`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SLUICE";

/// Complete pipeline specification.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline, recorded in run reports.
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    #[validate]
    pub run: RunSpec,

    #[serde(default)]
    #[validate]
    pub batch: BatchLimits,

    #[serde(default)]
    #[validate]
    pub retry: RetrySpec,

    #[validate(length(min = 1))]
    pub sources: Vec<SourceSpec>,

    #[serde(default)]
    pub transform: TransformPipelineSpec,

    /// Named static lookup tables: table -> key -> fields merged on a hit.
    #[serde(default)]
    pub lookups: BTreeMap<String, BTreeMap<String, Map<String, Value>>>,

    pub warehouse: WarehouseSpec,

    #[serde(default)]
    pub quarantine: QuarantineSpec,
}

/// Run-wide execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RunSpec {
    /// Maximum number of partitions processed at the same time.
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1))]
    pub max_concurrency: usize,

    /// When false, the first failed partition cancels the rest of the run.
    #[serde(default = "default_true")]
    pub tolerate_partial_failure: bool,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            tolerate_partial_failure: true,
        }
    }
}

/// Upper bounds on a single batch. A batch always holds at least one record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct BatchLimits {
    #[serde(default = "default_max_records")]
    #[validate(range(min = 1))]
    pub max_records: usize,

    #[serde(default = "default_max_bytes")]
    #[validate(range(min = 1))]
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl BatchLimits {
    pub fn records(max_records: usize) -> Self {
        Self {
            max_records,
            ..Self::default()
        }
    }

    /// Whether a batch already holding `records` records and `bytes` bytes
    /// has room for one more record of `next_bytes`.
    pub fn admits(&self, records: usize, bytes: usize, next_bytes: usize) -> bool {
        if records == 0 {
            return true;
        }
        records < self.max_records && bytes + next_bytes <= self.max_bytes
    }
}

/// Retry budget for retryable failures.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetrySpec {
    /// Retries allowed after the first attempt of one operation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0))]
    pub multiplier: f64,

    /// Fraction of the computed delay added at random, in `[0, 1]`.
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,

    /// Give up once this long has passed since the operation first failed.
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_elapsed_ms: default_max_elapsed_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "jsonl")]
    Jsonl(JsonlSourceSpec),
    #[serde(rename = "http_json")]
    HttpJson(HttpSourceSpec),
}

impl SourceSpec {
    pub fn id(&self) -> &str {
        match self {
            Self::Jsonl(s) => &s.id,
            Self::HttpJson(s) => &s.id,
        }
    }
}

/// JSON-lines files, one partition per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlSourceSpec {
    pub id: String,

    /// Explicit partitions.
    #[serde(default)]
    pub partitions: Vec<FilePartitionSpec>,

    /// Glob whose matches become partitions named after the file stem.
    #[serde(default)]
    pub glob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePartitionSpec {
    pub id: String,
    pub path: PathBuf,
}

/// A JSON API returning an array of objects per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceSpec {
    pub id: String,
    pub url: String,

    /// Query parameters sent with every request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Each partition adds its own parameters (e.g. `page`). No partitions
    /// means one partition called `default`.
    #[serde(default)]
    pub partitions: Vec<HttpPartitionSpec>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Where raw responses are staged, if anywhere.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Fields every element of the response must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpPartitionSpec {
    pub id: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Ordered list of transform steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformPipelineSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// The closed set of transform steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Map(MapStep),
    Coerce(CoerceStep),
    Validate(ValidateStep),
    Enrich(EnrichStep),
    DedupKey(DedupKeyStep),
}

impl StepSpec {
    /// Display name used in rejection reasons.
    pub fn name(&self) -> &str {
        let (custom, kind) = match self {
            Self::Map(s) => (&s.name, "map"),
            Self::Coerce(s) => (&s.name, "coerce"),
            Self::Validate(s) => (&s.name, "validate"),
            Self::Enrich(s) => (&s.name, "enrich"),
            Self::DedupKey(s) => (&s.name, "dedup_key"),
        };
        custom.as_deref().unwrap_or(kind)
    }
}

/// Field mapping: rename, fill defaults, project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapStep {
    #[serde(default)]
    pub name: Option<String>,
    /// Old name -> new name.
    #[serde(default)]
    pub rename: BTreeMap<String, String>,
    /// Values for fields that are missing or null.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// Keep only these fields (after renaming).
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Write the record's extraction time (RFC 3339) into this field.
    #[serde(default)]
    pub stamp_extracted_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Reject,
    /// Substitute the zero value of the target type.
    Default,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coercion {
    pub to: FieldType,
    /// Round floats to this many decimal places.
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub on_error: OnError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoerceStep {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: BTreeMap<String, Coercion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateStep {
    #[serde(default)]
    pub name: Option<String>,
    /// Fields that must be present and non-null.
    #[serde(default)]
    pub required: Vec<String>,
    /// Numeric fields that must be >= 0 when present.
    #[serde(default)]
    pub non_negative: Vec<String>,
    /// Expected type of each field when present and non-null.
    #[serde(default)]
    pub types: BTreeMap<String, FieldType>,
}

/// Enrichment: an optional table lookup, then derived fields in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub lookup: Option<LookupSpec>,
    #[serde(default)]
    pub derive: Vec<DerivedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSpec {
    /// Name of a table under `lookups`.
    pub table: String,
    /// Field whose value is the lookup key.
    pub key_field: String,
    /// Prefix for merged field names.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Reject the record when the key is not in the table.
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedField {
    pub field: String,
    pub expr: Expr,
}

/// Arithmetic over record fields.
///
/// ```yaml
/// expr: { mul: [ { abs: { field: price_change_24h } }, { field: total_volume } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Field(String),
    Const(f64),
    Abs(Box<Expr>),
    Log1p(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupKeyStep {
    #[serde(default)]
    pub name: Option<String>,
    pub fields: Vec<String>,
    /// Store the SHA-256 hex digest instead of the joined values.
    #[serde(default)]
    pub hash: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarehouseSpec {
    Postgres(PostgresWarehouseSpec),
    /// Keeps rows in process memory; useful for dry runs.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresWarehouseSpec {
    /// Connection URL with credentials already resolved.
    pub url: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuarantineSpec {
    /// A table in the warehouse database.
    Postgres {
        #[serde(default = "default_quarantine_table")]
        table: String,
    },
    /// JSON-lines files, one per partition.
    File { dir: PathBuf },
    Memory,
}

impl Default for QuarantineSpec {
    fn default() -> Self {
        Self::File {
            dir: PathBuf::from("data/quarantine"),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_records() -> usize {
    100
}
fn default_max_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}
fn default_max_elapsed_ms() -> u64 {
    300_000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_table() -> String {
    "sluice_records".to_string()
}
fn default_quarantine_table() -> String {
    "sluice_quarantine".to_string()
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    1
}
fn default_acquire_timeout_secs() -> u64 {
    30
}

/// Parse and validate a pipeline from YAML text, without environment overrides.
pub fn parse_pipeline_str(yaml: &str) -> Result<PipelineSpec> {
    let tree: Value = serde_yaml::from_str(yaml).context("Failed to parse pipeline YAML")?;
    finish(tree)
}

/// Load a pipeline file, apply `SLUICE__*` environment overrides, validate.
pub fn load_pipeline(path: &Path) -> Result<PipelineSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    let mut tree: Value = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse pipeline YAML: {}", path.display()))?;

    let env = config::Config::builder()
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to read environment overrides")?;
    let overrides: Value = env
        .try_deserialize()
        .context("Failed to decode environment overrides")?;
    merge_overrides(&mut tree, overrides);

    finish(tree)
}

fn finish(tree: Value) -> Result<PipelineSpec> {
    let spec: PipelineSpec = serde_json::from_value(tree).context("Invalid pipeline specification")?;
    validate_pipeline(&spec)?;
    Ok(spec)
}

/// Deep-merge `overrides` into `base`. Numeric keys index into arrays.
fn merge_overrides(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            for (key, value) in over_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_overrides(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(items), Value::Object(over_map)) => {
            for (key, value) in over_map {
                if let Some(item) = key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                    merge_overrides(item, value);
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Field-level and cross-field validation.
pub fn validate_pipeline(spec: &PipelineSpec) -> Result<()> {
    spec.validate().context("Invalid pipeline specification")?;

    if spec.retry.max_delay_ms < spec.retry.base_delay_ms {
        bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
    }

    let mut source_ids = HashSet::new();
    for source in &spec.sources {
        let id = source.id();
        if id.is_empty() {
            bail!("source id must not be empty");
        }
        if !source_ids.insert(id) {
            bail!("duplicate source id: '{}'", id);
        }
        let mut partition_ids = HashSet::new();
        match source {
            SourceSpec::Jsonl(s) => {
                if s.partitions.is_empty() && s.glob.is_none() {
                    bail!("jsonl source '{}' needs partitions or a glob", s.id);
                }
                for p in &s.partitions {
                    if !partition_ids.insert(p.id.as_str()) {
                        bail!("duplicate partition '{}' in source '{}'", p.id, s.id);
                    }
                }
            }
            SourceSpec::HttpJson(s) => {
                if !(s.url.starts_with("http://") || s.url.starts_with("https://")) {
                    bail!("http_json source '{}' url must be http(s)", s.id);
                }
                if s.timeout_secs == 0 {
                    bail!("http_json source '{}' timeout_secs must be > 0", s.id);
                }
                for p in &s.partitions {
                    if !partition_ids.insert(p.id.as_str()) {
                        bail!("duplicate partition '{}' in source '{}'", p.id, s.id);
                    }
                }
            }
        }
    }

    for step in &spec.transform.steps {
        match step {
            StepSpec::Enrich(e) => {
                if let Some(lookup) = &e.lookup {
                    if !spec.lookups.contains_key(&lookup.table) {
                        bail!("step '{}' references unknown lookup table '{}'", step.name(), lookup.table);
                    }
                }
                if e.lookup.is_none() && e.derive.is_empty() {
                    bail!("enrich step '{}' has neither lookup nor derive", step.name());
                }
            }
            StepSpec::DedupKey(d) if d.fields.is_empty() => {
                bail!("dedup_key step '{}' needs at least one field", step.name());
            }
            StepSpec::Coerce(c) => {
                for (field, coercion) in &c.fields {
                    if coercion.decimals.is_some() && coercion.to != FieldType::Float {
                        bail!("coerce of '{}': decimals only apply to float", field);
                    }
                }
            }
            _ => {}
        }
    }

    if let WarehouseSpec::Postgres(pg) = &spec.warehouse {
        check_identifier("warehouse.table", &pg.table)?;
        if pg.max_connections == 0 || pg.min_connections > pg.max_connections {
            bail!("warehouse connection bounds must satisfy 0 < min <= max");
        }
    }

    if let QuarantineSpec::Postgres { table } = &spec.quarantine {
        check_identifier("quarantine.table", table)?;
        if !matches!(spec.warehouse, WarehouseSpec::Postgres(_)) {
            bail!("postgres quarantine requires a postgres warehouse");
        }
    }

    Ok(())
}

/// SQL identifiers are interpolated into DDL, so only plain names pass.
pub fn check_identifier(what: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid_start || !valid_rest || ident.len() > 63 {
        bail!("{} '{}' must be a lowercase SQL identifier", what, ident);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: fixtures
sources:
  - type: jsonl
    id: files
    partitions:
      - { id: day1, path: data/day1.jsonl }
warehouse:
  type: memory
"#;

    #[test]
    fn minimal_pipeline_gets_defaults() {
        let spec = parse_pipeline_str(MINIMAL).unwrap();
        assert_eq!(spec.name, "fixtures");
        assert_eq!(spec.batch.max_records, 100);
        assert_eq!(spec.retry.max_retries, 3);
        assert_eq!(spec.run.max_concurrency, 4);
        assert!(spec.run.tolerate_partial_failure);
        assert!(matches!(spec.quarantine, QuarantineSpec::File { .. }));
        assert!(spec.transform.steps.is_empty());
    }

    #[test]
    fn full_pipeline_parses_steps_and_expressions() {
        let yaml = r#"
name: crypto-markets
sources:
  - type: http_json
    id: coingecko
    url: https://api.coingecko.com/api/v3/coins/markets
    params: { vs_currency: usd, per_page: "20" }
    partitions:
      - { id: page-1, params: { page: "1" } }
      - { id: page-2, params: { page: "2" } }
transform:
  steps:
    - kind: map
      rename: { id: coin_id }
      defaults: { market_cap: 0 }
      stamp_extracted_at: extracted_at
    - kind: coerce
      fields:
        current_price: { to: float, decimals: 8 }
        market_cap: { to: integer, on_error: default }
    - kind: validate
      required: [coin_id, current_price]
      non_negative: [current_price]
    - kind: enrich
      derive:
        - field: volatility_score
          expr: { mul: [ { abs: { field: price_change_24h } }, { field: total_volume } ] }
    - kind: dedup_key
      fields: [coin_id, extracted_at]
warehouse:
  type: postgres
  url: postgres://etl@localhost/crypto_db
  table: crypto_market
quarantine:
  type: postgres
"#;
        let spec = parse_pipeline_str(yaml).unwrap();
        assert_eq!(spec.transform.steps.len(), 5);
        match &spec.transform.steps[3] {
            StepSpec::Enrich(e) => {
                assert_eq!(
                    e.derive[0].expr,
                    Expr::Mul(
                        Box::new(Expr::Abs(Box::new(Expr::Field("price_change_24h".into())))),
                        Box::new(Expr::Field("total_volume".into())),
                    )
                );
            }
            other => panic!("expected enrich, got {:?}", other),
        }
        assert_eq!(spec.transform.steps[4].name(), "dedup_key");
        match &spec.warehouse {
            WarehouseSpec::Postgres(pg) => {
                assert_eq!(pg.table, "crypto_market");
                assert_eq!(pg.max_connections, 20);
            }
            WarehouseSpec::Memory => panic!("expected postgres"),
        }
    }

    #[test]
    fn unknown_source_type_fails() {
        let yaml = MINIMAL.replace("type: jsonl", "type: kafka");
        let err = parse_pipeline_str(&yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("kafka"), "got: {:#}", err);
    }

    #[test]
    fn duplicate_sources_fail() {
        let yaml = r#"
name: dup
sources:
  - { type: jsonl, id: a, glob: "*.jsonl" }
  - { type: jsonl, id: a, glob: "*.json" }
warehouse: { type: memory }
"#;
        let err = parse_pipeline_str(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate source id"));
    }

    #[test]
    fn zero_batch_size_fails_validation() {
        let yaml = format!("{}\nbatch:\n  max_records: 0\n", MINIMAL);
        assert!(parse_pipeline_str(&yaml).is_err());
    }

    #[test]
    fn postgres_quarantine_needs_postgres_warehouse() {
        let yaml = format!("{}\nquarantine:\n  type: postgres\n", MINIMAL);
        let err = parse_pipeline_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("requires a postgres warehouse"));
    }

    #[test]
    fn table_names_are_checked() {
        let yaml = MINIMAL.replace(
            "type: memory",
            "type: postgres\n  url: postgres://x\n  table: \"records; drop table x\"",
        );
        assert!(parse_pipeline_str(&yaml).is_err());
    }

    #[test]
    fn unknown_lookup_table_fails() {
        let yaml = format!(
            "{}\ntransform:\n  steps:\n    - kind: enrich\n      lookup: {{ table: sectors, key_field: id }}\n",
            MINIMAL
        );
        let err = parse_pipeline_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown lookup table"));
    }

    #[test]
    fn overrides_merge_into_objects_and_arrays() {
        let mut base = serde_json::json!({
            "warehouse": { "type": "postgres", "url": "postgres://old" },
            "sources": [ { "id": "a", "timeout_secs": 30 } ]
        });
        let overrides = serde_json::json!({
            "warehouse": { "url": "postgres://new" },
            "sources": { "0": { "timeout_secs": 5 } },
            "run": { "max_concurrency": 2 }
        });
        merge_overrides(&mut base, overrides);
        assert_eq!(base["warehouse"]["url"], "postgres://new");
        assert_eq!(base["warehouse"]["type"], "postgres");
        assert_eq!(base["sources"][0]["timeout_secs"], 5);
        assert_eq!(base["run"]["max_concurrency"], 2);
    }

    #[test]
    fn batch_limits_admit_first_record_always() {
        let limits = BatchLimits {
            max_records: 2,
            max_bytes: 10,
        };
        assert!(limits.admits(0, 0, 100));
        assert!(limits.admits(1, 4, 6));
        assert!(!limits.admits(1, 4, 7));
        assert!(!limits.admits(2, 0, 1));
    }
}
