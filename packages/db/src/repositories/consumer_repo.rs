//! Consumer repository: last known heartbeat of every consumer.

use queue_core::{ConsumerInfo, ConsumerStatus};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

/// Repository for consumer heartbeat records.
pub struct ConsumerRepository;

/// Internal record type for SurrealDB. One row per queue name.
#[derive(Debug, Serialize, Deserialize)]
struct ConsumerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    info: ConsumerInfo,
}

impl ConsumerRepository {
    /// Insert or overwrite the heartbeat for a consumer's queue.
    pub async fn upsert(info: &ConsumerInfo) -> Result<ConsumerInfo, DbError> {
        let db = get_db()?;

        let record: Option<ConsumerRecord> = db
            .upsert(("consumer", info.queue_name.clone()))
            .content(ConsumerRecord {
                id: None,
                info: info.clone(),
            })
            .await?;

        record
            .map(|r| r.info)
            .ok_or_else(|| DbError::Query("Failed to record heartbeat".into()))
    }

    /// Get the last heartbeat for a queue.
    pub async fn get(queue_name: &str) -> Result<ConsumerInfo, DbError> {
        let db = get_db()?;

        let record: Option<ConsumerRecord> = db.select(("consumer", queue_name.to_string())).await?;

        record
            .map(|r| r.info)
            .ok_or_else(|| DbError::NotFound(format!("Consumer not found: {}", queue_name)))
    }

    /// List all recorded consumers.
    pub async fn list() -> Result<Vec<ConsumerInfo>, DbError> {
        let db = get_db()?;

        let records: Vec<ConsumerRecord> = db.select("consumer").await?;

        Ok(records.into_iter().map(|r| r.info).collect())
    }

    /// List consumers whose last heartbeat reported the given status.
    pub async fn list_by_status(status: ConsumerStatus) -> Result<Vec<ConsumerInfo>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT * FROM consumer WHERE info.status = $status")
            .bind(("status", status))
            .await?;

        let records: Vec<ConsumerRecord> = result.take(0)?;

        Ok(records.into_iter().map(|r| r.info).collect())
    }

    /// Delete a consumer record.
    pub async fn delete(queue_name: &str) -> Result<(), DbError> {
        let db = get_db()?;

        let _: Option<ConsumerRecord> = db.delete(("consumer", queue_name.to_string())).await?;

        Ok(())
    }
}
