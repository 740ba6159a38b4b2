//! PostgreSQL warehouse loader.
//!
//! One transaction per batch: the rows are upserted by natural key and the
//! partition checkpoint is advanced in the same transaction, so data and
//! progress commit or roll back together.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::config::check_identifier;
use sluice_core::{
    Batch, Checkpoint, EtlError, LoadReceipt, Loader, Result, TransformedRecord, WarehouseStats,
};
use sqlx::postgres::PgPool;
use tracing::{debug, warn};

use crate::checkpoint_postgres::{compare_and_advance, to_db_sequence};
use crate::pg::load_error;

pub struct PostgresWarehouse {
    pool: PgPool,
    table: String,
    upsert_sql: String,
}

impl PostgresWarehouse {
    pub fn new(pool: PgPool, table: &str) -> anyhow::Result<Self> {
        check_identifier("warehouse table", table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            upsert_sql: upsert_sql(table),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (natural_key, source_id, partition_id, sequence, record, loaded_at)
         SELECT t.natural_key, $3, $4, $5, t.record::jsonb, now()
         FROM UNNEST($1::text[], $2::text[]) AS t(natural_key, record)
         ON CONFLICT (natural_key) DO UPDATE SET
             source_id = EXCLUDED.source_id,
             partition_id = EXCLUDED.partition_id,
             sequence = EXCLUDED.sequence,
             record = EXCLUDED.record,
             loaded_at = EXCLUDED.loaded_at"
    )
}

/// Collapse records sharing a natural key to the last one, since one
/// upsert statement cannot touch the same row twice.
fn collapse(records: &[TransformedRecord]) -> Result<(Vec<String>, Vec<String>)> {
    let mut latest: BTreeMap<&str, &TransformedRecord> = BTreeMap::new();
    for record in records {
        latest.insert(record.natural_key.as_str(), record);
    }
    let mut keys = Vec::with_capacity(latest.len());
    let mut bodies = Vec::with_capacity(latest.len());
    for (key, record) in latest {
        keys.push(key.to_string());
        bodies.push(
            serde_json::to_string(&record.fields)
                .map_err(|e| EtlError::Internal(anyhow::Error::new(e).context("serializing record")))?,
        );
    }
    Ok((keys, bodies))
}

#[async_trait]
impl Loader for PostgresWarehouse {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn load(&self, batch: &Batch<TransformedRecord>, next: &Checkpoint) -> Result<LoadReceipt> {
        let (keys, bodies) = collapse(&batch.records)?;
        let sequence = to_db_sequence(batch.sequence)?;
        let source_id = batch.partition.source_id.as_str();
        let partition_id = batch.partition.partition_id.as_str();

        let mut tx = self.pool.begin().await.map_err(load_error)?;

        let rows_written = if keys.is_empty() {
            0
        } else {
            sqlx::query(&self.upsert_sql)
                .bind(keys)
                .bind(bodies)
                .bind(source_id)
                .bind(partition_id)
                .bind(sequence)
                .execute(&mut *tx)
                .await
                .map_err(load_error)?
                .rows_affected()
        };

        let next_sequence = to_db_sequence(next.sequence)?;
        let stale = compare_and_advance(&mut tx, source_id, partition_id, next_sequence, next.cursor.as_deref())
            .await
            .map_err(load_error)?;
        if let Some(stored) = stale {
            tx.rollback().await.map_err(load_error)?;
            warn!(
                partition = %batch.partition,
                stored,
                attempted = next.sequence,
                "Checkpoint moved underneath the load, rolled back"
            );
            return Err(EtlError::StaleCheckpoint {
                source_id: source_id.to_string(),
                partition_id: partition_id.to_string(),
                stored,
                attempted: next.sequence,
            });
        }

        tx.commit().await.map_err(load_error)?;
        debug!(
            partition = %batch.partition,
            sequence = batch.sequence,
            rows = rows_written,
            table = %self.table,
            "Loaded batch"
        );
        Ok(LoadReceipt {
            rows_written,
            checkpoint_committed: true,
        })
    }

    async fn stats(&self) -> Result<WarehouseStats> {
        let (row_count, latest): (i64, Option<DateTime<Utc>>) =
            sqlx::query_as(&format!("SELECT COUNT(*), MAX(loaded_at) FROM {}", self.table))
                .fetch_one(&self.pool)
                .await
                .map_err(load_error)?;
        Ok(WarehouseStats {
            row_count: row_count.max(0) as u64,
            latest_loaded_at: latest,
        })
    }
}
