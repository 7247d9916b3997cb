//! Archive of bean snapshots taken when a process starts.

use std::sync::Arc;

use queue_core::Bean;
use storage::Storage;
use tokio::runtime::Handle;

use crate::error::EngineResult;
use crate::marshaller::Marshaller;

/// Receives a copy of each bean as its process starts.
pub trait SnapshotSink: Send + Sync + 'static {
    fn write(&self, queue: &str, bean: &Bean) -> EngineResult<()>;
}

/// Writes marshalled beans to object storage under `beans/<queue>/<id>.json`.
///
/// Uploads run on the given runtime so process threads never wait on them.
pub struct ObjectStoreSnapshots {
    storage: Storage,
    marshaller: Arc<dyn Marshaller>,
    handle: Handle,
}

impl ObjectStoreSnapshots {
    pub fn new(storage: Storage, marshaller: Arc<dyn Marshaller>, handle: Handle) -> Self {
        Self {
            storage,
            marshaller,
            handle,
        }
    }
}

impl SnapshotSink for ObjectStoreSnapshots {
    fn write(&self, queue: &str, bean: &Bean) -> EngineResult<()> {
        let text = self.marshaller.marshal(bean)?;
        let storage = self.storage.clone();
        let queue = queue.to_string();
        let id = bean.id.to_string();

        self.handle.spawn(async move {
            match storage.put_snapshot(&queue, &id, text).await {
                Ok(()) => tracing::debug!("Archived bean {} of {}", id, queue),
                Err(e) => tracing::warn!("Failed to archive bean {} of {}: {}", id, queue, e),
            }
        });
        Ok(())
    }
}
