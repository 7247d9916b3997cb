//! Object storage archive for bean snapshots.
//!
//! Snapshots live under `beans/<queue>/<bean id>.json`, below an optional key
//! prefix, in an S3-compatible bucket, a local directory or memory.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};

/// Directory used when no backend is configured.
const DEFAULT_ROOT: &str = "./data/snapshots";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

/// Where snapshots are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// S3-compatible bucket. Credentials and region come from the `AWS_*`
    /// variables.
    S3 {
        bucket: String,
        endpoint: Option<String>,
    },
    Directory(PathBuf),
    Memory,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::S3 { .. } => "s3",
            Backend::Directory(_) => "filesystem",
            Backend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: Backend,
    /// Prepended to every key, e.g. the beamline name.
    pub prefix: Option<String>,
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            prefix: None,
        }
    }

    pub fn directory(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Directory(root.into()),
            prefix: None,
        }
    }

    /// Read the archive location from the environment.
    ///
    /// - `STORAGE_BACKEND`: `s3`, `filesystem` (default) or `memory`
    /// - `STORAGE_FS_ROOT`: directory for `filesystem` (default `./data/snapshots`)
    /// - `S3_BUCKET` (required for `s3`) and `S3_ENDPOINT`
    /// - `STORAGE_PREFIX`: optional key prefix
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let backend = match get("STORAGE_BACKEND").as_deref() {
            Some("s3") => Backend::S3 {
                bucket: get("S3_BUCKET").ok_or_else(|| {
                    StorageError::InvalidConfig("S3_BUCKET is required for the s3 backend".into())
                })?,
                endpoint: get("S3_ENDPOINT"),
            },
            None | Some("filesystem") | Some("fs") => Backend::Directory(PathBuf::from(
                get("STORAGE_FS_ROOT").unwrap_or_else(|| DEFAULT_ROOT.to_string()),
            )),
            Some("memory") | Some("mem") => Backend::Memory,
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported STORAGE_BACKEND={other} (expected s3|filesystem|memory)"
                )));
            }
        };

        Ok(Self {
            backend,
            prefix: get("STORAGE_PREFIX"),
        })
    }
}

/// Handle on the snapshot archive. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    backend: &'static str,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl Storage {
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let store: Arc<dyn ObjectStore> = match &config.backend {
            Backend::S3 { bucket, endpoint } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_allow_http(endpoint.starts_with("http://"))
                        .with_endpoint(endpoint);
                }
                Arc::new(builder.build()?)
            }
            Backend::Directory(root) => {
                std::fs::create_dir_all(root)?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            Backend::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self {
            backend: config.backend.name(),
            store,
            prefix: config
                .prefix
                .map(|prefix| prefix.trim_matches('/').to_string())
                .filter(|prefix| !prefix.is_empty()),
        })
    }

    pub fn from_env() -> Result<Self, StorageError> {
        Self::open(StorageConfig::from_env()?)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    fn path(&self, queue: &str, bean_id: &str) -> Path {
        let key = snapshot_key(queue, bean_id);
        match &self.prefix {
            Some(prefix) => Path::from(format!("{prefix}/{key}")),
            None => Path::from(key),
        }
    }

    /// Store an already-marshalled bean, replacing any earlier snapshot.
    pub async fn put_snapshot(
        &self,
        queue: &str,
        bean_id: &str,
        text: String,
    ) -> Result<(), StorageError> {
        let payload = PutPayload::from(Bytes::from(text));
        self.store.put(&self.path(queue, bean_id), payload).await?;
        Ok(())
    }

    /// Raw text of a stored snapshot.
    pub async fn get_snapshot(&self, queue: &str, bean_id: &str) -> Result<Bytes, StorageError> {
        let found = self.store.get(&self.path(queue, bean_id)).await?;
        Ok(found.bytes().await?)
    }
}

/// Object key of a bean snapshot, before the prefix.
pub fn snapshot_key(queue: &str, bean_id: &str) -> String {
    format!("beans/{queue}/{bean_id}.json")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_backend_means_local_directory() {
        let config = StorageConfig::from_lookup(lookup(&[("STORAGE_PREFIX", "  ")])).unwrap();
        assert_eq!(config.backend, Backend::Directory(PathBuf::from(DEFAULT_ROOT)));
        assert_eq!(config.prefix, None);
    }

    #[test]
    fn s3_needs_a_bucket() {
        let err = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "s3")])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidConfig(_)));

        let config = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "beamline"),
            ("S3_ENDPOINT", "http://localhost:9000"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            Backend::S3 {
                bucket: "beamline".into(),
                endpoint: Some("http://localhost:9000".into()),
            }
        );
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "tape")])).unwrap_err();
        assert!(err.to_string().contains("tape"));
    }

    #[tokio::test]
    async fn snapshot_is_replaced_in_memory() -> Result<(), StorageError> {
        let storage = Storage::open(StorageConfig::memory())?;
        assert_eq!(storage.backend_name(), "memory");

        storage.put_snapshot("scan", "01A", "{\"v\":1}".into()).await?;
        storage.put_snapshot("scan", "01A", "{\"v\":2}".into()).await?;
        assert_eq!(storage.get_snapshot("scan", "01A").await?, Bytes::from("{\"v\":2}"));
        assert!(storage.get_snapshot("align", "01A").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn prefix_places_snapshots_on_disk() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::open(StorageConfig {
            prefix: Some("/beamline/".to_string()),
            ..StorageConfig::directory(dir.path())
        })?;

        storage.put_snapshot("scan", "01A", "{}".into()).await?;
        assert!(dir.path().join("beamline/beans/scan/01A.json").exists());
        Ok(())
    }
}
