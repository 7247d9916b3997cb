//! Error type shared by every engine component.

use std::time::Duration;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the queue engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport could not deliver or subscribe.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A protocol rule was broken: lock timeout, bad state, duplicate bean.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No response arrived in time.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the wait.
    #[error("Cancelled")]
    Cancelled,

    /// A waiting thread was interrupted before the bean reached a final status.
    #[error("Interrupted")]
    Interrupted,

    /// A process failed to build or run.
    #[error("Process error: {0}")]
    Process(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The durable store rejected a read or write.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Marshal error: {0}")]
    Marshal(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Check if the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

impl From<db::DbError> for EngineError {
    fn from(e: db::DbError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<storage::StorageError> for EngineError {
    fn from(e: storage::StorageError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}
