use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::config::{AppConfig, BlobStorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Durable blob storage behind the ingestion pipeline. Thin handle over an
/// `object_store` backend chosen by configuration.
#[derive(Clone)]
pub struct BlobStorage {
    store: DynStore,
    backend_kind: BlobStorageKind,
}

impl BlobStorage {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.blob_storage.clone();
        let store = create_blob_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
        })
    }

    /// Inject a specific backend, mainly for tests.
    pub fn with_backend(store: DynStore, backend_kind: BlobStorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), BlobStorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &BlobStorageKind {
        &self.backend_kind
    }

    /// Put-object. Retried attempts reuse the same location, so a late
    /// arriving write safely overwrites any partial prior one.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        self.store
            .head(&path)
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }
}

async fn create_blob_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.blob_storage {
        BlobStorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base).await.map_err(|e| {
                    object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: e.into(),
                    }
                })?;
            }
            let store = LocalFileSystem::new_with_prefix(base)?;
            Ok(Arc::new(store))
        }
        BlobStorageKind::Memory => Ok(Arc::new(InMemory::new())),
    }
}

/// Resolve the absolute base directory used for local blob storage.
fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}
