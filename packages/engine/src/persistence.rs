//! Durable storage for queue contents.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use queue_core::{ConsumerInfo, QueueSnapshot};
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineResult;

/// Storage for the submission queue and status set of each queue.
///
/// Called synchronously from queue operations, so implementations must not
/// block on an async runtime.
pub trait QueueStore: Send + Sync + 'static {
    /// Load the last saved snapshot of a queue.
    fn load(&self, queue: &str) -> EngineResult<Option<QueueSnapshot>>;

    /// Replace the saved snapshot of a queue.
    fn save(&self, queue: &str, snapshot: &QueueSnapshot) -> EngineResult<()>;

    /// Forget everything saved for a queue.
    fn delete(&self, queue: &str) -> EngineResult<()>;

    /// Record a consumer heartbeat. Stores without heartbeat support ignore it.
    fn record_heartbeat(&self, _info: &ConsumerInfo) -> EngineResult<()> {
        Ok(())
    }
}

/// File-based store: one pretty-printed JSON file per queue.
pub struct JsonFileStore {
    /// Base directory for queue files.
    base_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Ensure the base directories exist.
    pub fn init(&self) -> EngineResult<()> {
        fs::create_dir_all(self.base_dir.join("consumers"))?;
        Ok(())
    }

    fn queue_path(&self, queue: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", queue))
    }

    fn write_atomic(&self, path: &Path, json: &str) -> EngineResult<()> {
        // Write to temp file first, then rename for atomicity
        let mut temp_path = path.to_path_buf().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// List the names of all saved queues.
    pub fn list(&self) -> EngineResult<Vec<String>> {
        let mut names = Vec::new();

        if !self.base_dir.exists() {
            return Ok(names);
        }

        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem()
            {
                names.push(stem.to_string_lossy().to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Read the last heartbeat written for a queue.
    pub fn load_heartbeat(&self, queue: &str) -> EngineResult<Option<ConsumerInfo>> {
        let path = self.base_dir.join("consumers").join(format!("{}.json", queue));
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self, queue: &str) -> EngineResult<Option<QueueSnapshot>> {
        let path = self.queue_path(queue);

        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)?;
        let snapshot: QueueSnapshot = serde_json::from_str(&json)?;
        tracing::debug!("Loaded queue {} from {:?}", queue, path);

        Ok(Some(snapshot))
    }

    fn save(&self, queue: &str, snapshot: &QueueSnapshot) -> EngineResult<()> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.queue_path(queue);
        let json = serde_json::to_string_pretty(snapshot)?;
        self.write_atomic(&path, &json)?;

        tracing::debug!("Saved queue {} to {:?}", queue, path);
        Ok(())
    }

    fn delete(&self, queue: &str) -> EngineResult<()> {
        let path = self.queue_path(queue);

        if path.exists() {
            fs::remove_file(&path)?;
            tracing::debug!("Deleted queue file {:?}", path);
        }

        Ok(())
    }

    fn record_heartbeat(&self, info: &ConsumerInfo) -> EngineResult<()> {
        let dir = self.base_dir.join("consumers");
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_string_pretty(info)?;
        self.write_atomic(&dir.join(format!("{}.json", info.queue_name)), &json)
    }
}

enum StoreWrite {
    Snapshot {
        queue: String,
        snapshot: QueueSnapshot,
    },
    Delete {
        queue: String,
    },
    Heartbeat(ConsumerInfo),
    Flush(oneshot::Sender<()>),
}

/// SurrealDB-backed store.
///
/// Reads are served from a cache filled when the store is opened. Writes are
/// handed to a background task in order, so queue operations never wait on
/// the database.
pub struct SurrealQueueStore {
    cache: Mutex<HashMap<String, QueueSnapshot>>,
    writes: mpsc::UnboundedSender<StoreWrite>,
}

impl SurrealQueueStore {
    /// Connect, load every stored queue and start the writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(config: db::DbConfig) -> EngineResult<Self> {
        db::init(config).await?;

        let mut cache = HashMap::new();
        for queue in db::repositories::BeanRepository::queue_names().await? {
            let snapshot = db::repositories::BeanRepository::load_snapshot(&queue).await?;
            tracing::info!("Loaded {} stored beans for queue {}", snapshot.len(), queue);
            cache.insert(queue, snapshot);
        }

        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(rx));

        Ok(Self {
            cache: Mutex::new(cache),
            writes,
        })
    }

    /// Wait until every write queued so far has reached the database.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writes.send(StoreWrite::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn enqueue(&self, write: StoreWrite) -> EngineResult<()> {
        self.writes
            .send(write)
            .map_err(|_| crate::EngineError::Persistence("Database writer stopped".into()))
    }
}

async fn run_writer(mut rx: mpsc::UnboundedReceiver<StoreWrite>) {
    use db::repositories::{BeanRepository, ConsumerRepository};

    while let Some(write) = rx.recv().await {
        match write {
            StoreWrite::Snapshot { queue, snapshot } => {
                if let Err(e) = BeanRepository::save_snapshot(&queue, &snapshot).await {
                    tracing::warn!("Failed to persist queue {}: {}", queue, e);
                }
            }
            StoreWrite::Delete { queue } => {
                if let Err(e) = BeanRepository::delete_queue(&queue).await {
                    tracing::warn!("Failed to delete queue {}: {}", queue, e);
                }
            }
            StoreWrite::Heartbeat(info) => {
                if let Err(e) = ConsumerRepository::upsert(&info).await {
                    tracing::warn!("Failed to record heartbeat for {}: {}", info.queue_name, e);
                }
            }
            StoreWrite::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl QueueStore for SurrealQueueStore {
    fn load(&self, queue: &str) -> EngineResult<Option<QueueSnapshot>> {
        Ok(self.cache.lock().get(queue).cloned())
    }

    fn save(&self, queue: &str, snapshot: &QueueSnapshot) -> EngineResult<()> {
        self.cache.lock().insert(queue.to_string(), snapshot.clone());
        self.enqueue(StoreWrite::Snapshot {
            queue: queue.to_string(),
            snapshot: snapshot.clone(),
        })
    }

    fn delete(&self, queue: &str) -> EngineResult<()> {
        self.cache.lock().remove(queue);
        self.enqueue(StoreWrite::Delete {
            queue: queue.to_string(),
        })
    }

    fn record_heartbeat(&self, info: &ConsumerInfo) -> EngineResult<()> {
        self.enqueue(StoreWrite::Heartbeat(info.clone()))
    }
}
