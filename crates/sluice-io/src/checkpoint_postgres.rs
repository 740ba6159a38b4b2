//! Checkpoints stored in the warehouse database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::{Checkpoint, CheckpointStore, EtlError, PartitionKey, Result};
use sqlx::postgres::{PgConnection, PgPool};

use crate::pg::{state_error, CHECKPOINT_TABLE};

pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn to_db_sequence(sequence: u64) -> Result<i64> {
    i64::try_from(sequence)
        .map_err(|_| EtlError::Internal(anyhow::anyhow!("sequence {} does not fit in BIGINT", sequence)))
}

fn from_row((sequence, cursor, updated_at): (i64, Option<String>, DateTime<Utc>)) -> Checkpoint {
    Checkpoint {
        sequence: sequence.max(0) as u64,
        cursor,
        updated_at: Some(updated_at),
    }
}

/// Compare-and-advance on an open connection or transaction.
///
/// Returns `Ok(None)` when the row moved forward, or `Ok(Some(stored))`
/// when the stored sequence is already at or beyond `sequence`.
pub(crate) async fn compare_and_advance(
    conn: &mut PgConnection,
    source_id: &str,
    partition_id: &str,
    sequence: i64,
    cursor: Option<&str>,
) -> sqlx::Result<Option<u64>> {
    let advanced = sqlx::query(&format!(
        "INSERT INTO {CHECKPOINT_TABLE} AS c (source_id, partition_id, sequence, cursor, updated_at)
         VALUES ($1, $2, $3, $4, now())
         ON CONFLICT (source_id, partition_id) DO UPDATE SET
             sequence = EXCLUDED.sequence,
             cursor = EXCLUDED.cursor,
             updated_at = EXCLUDED.updated_at
         WHERE c.sequence < EXCLUDED.sequence"
    ))
    .bind(source_id)
    .bind(partition_id)
    .bind(sequence)
    .bind(cursor)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if advanced > 0 {
        return Ok(None);
    }

    let (stored,): (i64,) = sqlx::query_as(&format!(
        "SELECT sequence FROM {CHECKPOINT_TABLE} WHERE source_id = $1 AND partition_id = $2"
    ))
    .bind(source_id)
    .bind(partition_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(Some(stored.max(0) as u64))
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(&self, source_id: &str, partition_id: &str) -> Result<Checkpoint> {
        let row: Option<(i64, Option<String>, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT sequence, cursor, updated_at FROM {CHECKPOINT_TABLE}
             WHERE source_id = $1 AND partition_id = $2"
        ))
        .bind(source_id)
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(row.map(from_row).unwrap_or_default())
    }

    async fn advance(&self, source_id: &str, partition_id: &str, new: &Checkpoint) -> Result<()> {
        let sequence = to_db_sequence(new.sequence)?;
        let mut conn = self.pool.acquire().await.map_err(state_error)?;
        match compare_and_advance(&mut conn, source_id, partition_id, sequence, new.cursor.as_deref())
            .await
            .map_err(state_error)?
        {
            None => Ok(()),
            Some(stored) => Err(EtlError::StaleCheckpoint {
                source_id: source_id.to_string(),
                partition_id: partition_id.to_string(),
                stored,
                attempted: new.sequence,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<(PartitionKey, Checkpoint)>> {
        let rows: Vec<(String, String, i64, Option<String>, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT source_id, partition_id, sequence, cursor, updated_at FROM {CHECKPOINT_TABLE}
             ORDER BY source_id, partition_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(state_error)?;
        Ok(rows
            .into_iter()
            .map(|(source_id, partition_id, sequence, cursor, updated_at)| {
                (
                    PartitionKey::new(source_id, partition_id),
                    from_row((sequence, cursor, updated_at)),
                )
            })
            .collect())
    }
}
