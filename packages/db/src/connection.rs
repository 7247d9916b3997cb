//! Process-wide SurrealDB handle.
//!
//! The queue store connects once at startup; repositories fetch the handle
//! with [`get_db`].

use std::sync::{LazyLock, OnceLock};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use thiserror::Error;
use tokio::sync::OnceCell;

static DB: LazyLock<OnceCell<Database>> = LazyLock::new(OnceCell::new);
static ENDPOINT: OnceLock<String> = OnceLock::new();

pub type Database = Surreal<Any>;

/// Where the queues are stored.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// `mem://`, `file://<path>`, `rocksdb://<path>` or a remote `ws://` URL.
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
}

impl DbConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "beanqueue".to_string(),
            database: "queues".to_string(),
        }
    }

    pub fn memory() -> Self {
        Self::new("mem://")
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Database already connected to {0}")]
    AlreadyConnected(String),
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Connect and select the namespace and database.
///
/// Later calls with the same endpoint return the existing handle; a different
/// endpoint is an error since the handle is shared by the whole process.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    let db = DB
        .get_or_try_init(|| async {
            tracing::info!("Connecting to database: {}", config.endpoint);
            let db = connect(&config.endpoint).await?;
            db.use_ns(&config.namespace).use_db(&config.database).await?;
            let _ = ENDPOINT.set(config.endpoint.clone());
            tracing::info!(
                "Connected to database: {}/{}",
                config.namespace,
                config.database
            );
            Ok::<_, DbError>(db)
        })
        .await?;

    match ENDPOINT.get() {
        Some(endpoint) if *endpoint != config.endpoint => {
            Err(DbError::AlreadyConnected(endpoint.clone()))
        }
        _ => Ok(db),
    }
}

/// The shared handle, once [`init_db`] has completed.
pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}
