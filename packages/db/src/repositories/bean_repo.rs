//! Bean repository: persists the submission queue and status set of each queue.

use std::collections::HashMap;

use queue_core::{Bean, BeanId, QueueSnapshot};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

/// Repository for bean persistence operations.
pub struct BeanRepository;

/// Which collection of a queue a stored bean belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeanKind {
    Submitted,
    Status,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BeanRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    queue: String,
    kind: BeanKind,
    position: i64,
    bean: Bean,
}

impl BeanRecord {
    fn new(queue: &str, kind: BeanKind, position: usize, bean: &Bean) -> Self {
        Self {
            id: None,
            queue: queue.to_string(),
            kind,
            position: position as i64,
            bean: bean.clone(),
        }
    }
}

impl BeanRepository {
    /// Replace everything stored for a queue with the given snapshot.
    ///
    /// Runs inside one transaction so readers never see a half-written queue.
    pub async fn save_snapshot(queue: &str, snapshot: &QueueSnapshot) -> Result<(), DbError> {
        let db = get_db()?;

        let mut records = Vec::with_capacity(snapshot.len());
        for (position, bean) in snapshot.submitted.iter().enumerate() {
            records.push(BeanRecord::new(queue, BeanKind::Submitted, position, bean));
        }
        for (position, bean) in snapshot.status_set.iter().enumerate() {
            records.push(BeanRecord::new(queue, BeanKind::Status, position, bean));
        }

        let response = if records.is_empty() {
            db.query("DELETE bean WHERE queue = $queue")
                .bind(("queue", queue.to_string()))
                .await?
        } else {
            db.query(
                r#"
                BEGIN TRANSACTION;
                DELETE bean WHERE queue = $queue;
                INSERT INTO bean $records;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("queue", queue.to_string()))
            .bind(("records", records))
            .await?
        };
        response.check()?;

        Ok(())
    }

    /// Load the stored snapshot of a queue. Unknown queues load as empty.
    pub async fn load_snapshot(queue: &str) -> Result<QueueSnapshot, DbError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT * FROM bean WHERE queue = $queue ORDER BY position ASC")
            .bind(("queue", queue.to_string()))
            .await?;

        let records: Vec<BeanRecord> = result.take(0)?;

        let mut snapshot = QueueSnapshot::default();
        for record in records {
            match record.kind {
                BeanKind::Submitted => snapshot.submitted.push(record.bean),
                BeanKind::Status => snapshot.status_set.push(record.bean),
            }
        }

        Ok(snapshot)
    }

    /// Get a stored bean by ID, whichever queue holds it.
    pub async fn get(id: BeanId) -> Result<Bean, DbError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT * FROM bean WHERE bean.id = $id LIMIT 1")
            .bind(("id", id.to_string()))
            .await?;

        let records: Vec<BeanRecord> = result.take(0)?;

        records
            .into_iter()
            .next()
            .map(|r| r.bean)
            .ok_or_else(|| DbError::NotFound(format!("Bean not found: {}", id)))
    }

    /// Names of every queue with stored beans.
    pub async fn queue_names() -> Result<Vec<String>, DbError> {
        let db = get_db()?;

        let mut result = db.query("SELECT queue FROM bean GROUP BY queue").await?;

        #[derive(Deserialize)]
        struct QueueName {
            queue: String,
        }

        let names: Vec<QueueName> = result.take(0)?;

        Ok(names.into_iter().map(|n| n.queue).collect())
    }

    /// Delete everything stored for a queue.
    pub async fn delete_queue(queue: &str) -> Result<(), DbError> {
        let db = get_db()?;

        db.query("DELETE bean WHERE queue = $queue")
            .bind(("queue", queue.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    /// Count stored beans by status for a queue.
    pub async fn count_by_status(queue: &str) -> Result<HashMap<String, u64>, DbError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT bean.status AS status, count() AS count
                FROM bean
                WHERE queue = $queue
                GROUP BY status
                "#,
            )
            .bind(("queue", queue.to_string()))
            .await?;

        #[derive(Deserialize)]
        struct StatusCount {
            status: Option<String>,
            count: i64,
        }

        let counts: Vec<StatusCount> = result.take(0)?;

        let mut map = HashMap::new();
        for count in counts {
            if let Some(status) = count.status {
                map.insert(status, count.count as u64);
            }
        }

        Ok(map)
    }
}
