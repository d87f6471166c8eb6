use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Object storage behind the pipeline: original uploads and transcribed
/// text objects are fetched through this manager.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let store = create_storage_backend(cfg)?;

        Ok(Self {
            store,
            backend_kind,
        })
    }

    /// Wraps a caller-provided backend, useful for injecting an in-memory
    /// store in tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    pub fn memory() -> Self {
        Self::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    /// Store bytes at the specified location.
    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        let path = ObjPath::from(location);
        let payload = object_store::PutPayload::from_bytes(data);
        self.store.put(&path, payload).await.map(|_| ())
    }

    /// Retrieve the full contents at the specified location, buffered in
    /// memory.
    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        result.bytes().await
    }

    /// Get a streaming handle for large objects.
    pub async fn get_stream(
        &self,
        location: &str,
    ) -> object_store::Result<BoxStream<'static, object_store::Result<Bytes>>> {
        let path = ObjPath::from(location);
        let result = self.store.get(&path).await?;
        Ok(result.into_stream())
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        let path = ObjPath::from(location);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn create_storage_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::Local => {
            std::fs::create_dir_all(&cfg.data_dir).map_err(|source| {
                object_store::Error::Generic {
                    store: "LocalFileSystem",
                    source: Box::new(source),
                }
            })?;
            let store = LocalFileSystem::new_with_prefix(&cfg.data_dir)?;
            Ok(Arc::new(store))
        }
        StorageKind::Memory => Ok(Arc::new(InMemory::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_exists_round_trip() {
        let storage = StorageManager::memory();

        storage
            .put("tenant-1/doc-1/notes.txt", Bytes::from_static(b"hello"))
            .await
            .expect("put");

        assert!(storage
            .exists("tenant-1/doc-1/notes.txt")
            .await
            .expect("exists"));
        assert!(!storage.exists("tenant-1/missing").await.expect("exists"));

        let bytes = storage.get("tenant-1/doc-1/notes.txt").await.expect("get");
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn missing_object_surfaces_not_found() {
        let storage = StorageManager::memory();
        let result = storage.get("absent-key").await;
        assert!(matches!(result, Err(object_store::Error::NotFound { .. })));
    }
}
