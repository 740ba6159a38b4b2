//! Reference tables for the `enrich` step.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
#[error("lookup failed: {0}")]
pub struct LookupError(pub String);

/// A keyed source of extra fields.
#[async_trait]
pub trait LookupTable: Send + Sync {
    /// Fields for `key`, or `None` when the key is unknown.
    async fn get(&self, key: &str) -> Result<Option<Map<String, Value>>, LookupError>;
}

/// A table defined inline in the pipeline file under `lookups`.
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    entries: BTreeMap<String, Map<String, Value>>,
}

impl StaticLookup {
    pub fn new(entries: BTreeMap<String, Map<String, Value>>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LookupTable for StaticLookup {
    async fn get(&self, key: &str) -> Result<Option<Map<String, Value>>, LookupError> {
        Ok(self.entries.get(key).cloned())
    }
}
