use crate::error::AppError;
use crate::store::DurableStore;
use crate::stream::now_unix_ms;
use crate::stream::types::{BatchRecord, Message};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

fn u64_to_sqlite(value: u64) -> i64 {
    value.min(i64::MAX as u64) as i64
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBatchSummary {
    pub session_id: u64,
    pub message_count: i64,
    pub first_seq: Option<i64>,
    pub last_seq: Option<i64>,
    pub instruments: Vec<String>,
    pub throughput: i64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn count_messages(&self, session_id: u64) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM stream_messages WHERE session_id = ?",
        )
        .bind(u64_to_sqlite(session_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_batches(&self, session_id: u64) -> Result<Vec<StoredBatchSummary>, AppError> {
        let rows = sqlx::query(
            "SELECT session_id, message_count, first_seq, last_seq, instruments_json, throughput \
             FROM stream_batches WHERE session_id = ? \
             ORDER BY created_at_ms ASC, id ASC",
        )
        .bind(u64_to_sqlite(session_id))
        .fetch_all(&self.pool)
        .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            batches.push(map_batch_row(&row)?);
        }
        Ok(batches)
    }
}

fn map_batch_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredBatchSummary, AppError> {
    let session_id: i64 = row.try_get("session_id")?;
    let instruments_json: String = row.try_get("instruments_json")?;

    Ok(StoredBatchSummary {
        session_id: session_id.max(0) as u64,
        message_count: row.try_get("message_count")?,
        first_seq: row.try_get("first_seq")?,
        last_seq: row.try_get("last_seq")?,
        instruments: serde_json::from_str(&instruments_json)?,
        throughput: row.try_get("throughput")?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn save_message(&self, message: &Message) -> Result<(), AppError> {
        let payload_json = serde_json::to_string(&message.payload)?;

        sqlx::query(
            "INSERT INTO stream_messages \
             (session_id, seq, arrival_ms, format, payload_json, extract_s, transform_s, load_s, total_s, stored_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(u64_to_sqlite(message.session_id))
        .bind(u64_to_sqlite(message.seq))
        .bind(message.arrival_ms)
        .bind(message.format.as_str())
        .bind(payload_json)
        .bind(message.latency.extract_s)
        .bind(message.latency.transform_s)
        .bind(message.latency.load_s)
        .bind(message.latency.total_s)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_batch(&self, batch: &BatchRecord) -> Result<(), AppError> {
        let instruments_json = serde_json::to_string(&batch.instruments)?;
        let messages_json = serde_json::to_string(&batch.messages)?;
        let first_seq = batch.messages.first().map(|message| u64_to_sqlite(message.seq));
        let last_seq = batch.messages.last().map(|message| u64_to_sqlite(message.seq));

        sqlx::query(
            "INSERT INTO stream_batches \
             (session_id, created_at_ms, message_count, first_seq, last_seq, instruments_json, average_latency_s, throughput, messages_json, stored_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(u64_to_sqlite(batch.session_id))
        .bind(batch.created_at_ms)
        .bind(batch.messages.len() as i64)
        .bind(first_seq)
        .bind(last_seq)
        .bind(instruments_json)
        .bind(batch.average_latency_s)
        .bind(i64::from(batch.throughput))
        .bind(messages_json)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
