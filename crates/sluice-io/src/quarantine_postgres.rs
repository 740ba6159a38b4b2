//! Dead-letter table in the warehouse database.
//!
//! Payloads are stored as `BYTEA`, byte for byte. Text columns cannot hold
//! NUL, so NULs in offsets and reasons are escaped as `\0`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::config::check_identifier;
use sluice_core::{Quarantine, QuarantinedRecord, Result};
use sqlx::postgres::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::checkpoint_postgres::to_db_sequence;
use crate::pg::state_error;

/// Rows are keyed by record identity and stage, so a redelivered batch
/// overwrites its own entries.
pub struct PostgresQuarantine {
    pool: PgPool,
    insert_sql: String,
}

impl PostgresQuarantine {
    pub fn new(pool: PgPool, table: &str) -> anyhow::Result<Self> {
        check_identifier("quarantine table", table)?;
        Ok(Self {
            pool,
            insert_sql: insert_sql(table),
        })
    }
}

fn insert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table} (source_id, partition_id, record_offset, stage, ordinal, sequence,
                              run_id, code, detail, payload, quarantined_at)
         SELECT t.source_id, t.partition_id, t.record_offset, t.stage, t.ordinal, t.sequence,
                $11, t.code, t.detail, t.payload, t.quarantined_at
         FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[], $5::bigint[], $6::bigint[],
                     $7::text[], $8::text[], $9::bytea[], $10::timestamptz[])
              AS t(source_id, partition_id, record_offset, stage, ordinal, sequence,
                   code, detail, payload, quarantined_at)
         ON CONFLICT (source_id, partition_id, record_offset, stage) DO UPDATE SET
             sequence = EXCLUDED.sequence,
             run_id = EXCLUDED.run_id,
             code = EXCLUDED.code,
             detail = EXCLUDED.detail,
             payload = EXCLUDED.payload,
             quarantined_at = EXCLUDED.quarantined_at"
    )
}

fn pg_text(s: &str) -> String {
    s.replace('\0', "\\0")
}

#[derive(Default)]
struct Columns {
    source_id: Vec<String>,
    partition_id: Vec<String>,
    offset: Vec<String>,
    stage: Vec<String>,
    ordinal: Vec<i64>,
    sequence: Vec<i64>,
    code: Vec<String>,
    detail: Vec<String>,
    payload: Vec<Vec<u8>>,
    quarantined_at: Vec<DateTime<Utc>>,
}

impl Columns {
    fn from_records(records: &[QuarantinedRecord]) -> Result<Self> {
        let mut c = Self::default();
        for r in records {
            c.source_id.push(pg_text(&r.partition.source_id));
            c.partition_id.push(pg_text(&r.partition.partition_id));
            c.offset.push(pg_text(&r.offset));
            c.stage.push(r.stage.as_str().to_string());
            c.ordinal.push(to_db_sequence(r.ordinal)?);
            c.sequence.push(to_db_sequence(r.sequence)?);
            c.code.push(pg_text(&r.code));
            c.detail.push(pg_text(&r.detail));
            c.payload.push(r.payload.to_vec());
            c.quarantined_at.push(r.quarantined_at);
        }
        Ok(c)
    }
}

#[async_trait]
impl Quarantine for PostgresQuarantine {
    async fn quarantine(&self, run_id: Uuid, records: &[QuarantinedRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let c = Columns::from_records(records)?;
        sqlx::query(&self.insert_sql)
            .bind(c.source_id)
            .bind(c.partition_id)
            .bind(c.offset)
            .bind(c.stage)
            .bind(c.ordinal)
            .bind(c.sequence)
            .bind(c.code)
            .bind(c.detail)
            .bind(c.payload)
            .bind(c.quarantined_at)
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(state_error)?;
        debug!(records = records.len(), "Quarantined records in warehouse");
        Ok(records.len() as u64)
    }
}
