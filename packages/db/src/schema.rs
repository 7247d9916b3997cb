//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(BEAN_SCHEMA).await?;
    db.query(CONSUMER_SCHEMA).await?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Bean table schema.
///
/// Rows carry the owning queue, which collection the bean sits in and its
/// position inside that collection. The bean itself is stored as a nested object.
const BEAN_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS bean SCHEMALESS;

DEFINE INDEX IF NOT EXISTS bean_queue ON bean FIELDS queue;
DEFINE INDEX IF NOT EXISTS bean_queue_kind ON bean FIELDS queue, kind, position;
DEFINE INDEX IF NOT EXISTS bean_id ON bean FIELDS bean.id;
DEFINE INDEX IF NOT EXISTS bean_status ON bean FIELDS bean.status;
"#;

/// Consumer heartbeat table schema.
const CONSUMER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS consumer SCHEMALESS;

DEFINE INDEX IF NOT EXISTS consumer_queue ON consumer FIELDS info.queue_name UNIQUE;
DEFINE INDEX IF NOT EXISTS consumer_status ON consumer FIELDS info.status;
"#;
