//! Blob-store access.
//!
//! Attack files and zip-sourced defense archives live in an object store
//! addressed by opaque keys. Nothing here imposes a layout.

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("{0}")]
    Store(#[from] object_store::Error),

    #[error("invalid object key '{key}': {source}")]
    Key {
        key: String,
        source: object_store::path::Error,
    },
}

/// Thin handle over any `ObjectStore` backend.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Filesystem-backed store rooted at `root` (created if missing).
    pub fn local(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::new(Arc::new(store)))
    }

    /// In-memory store for tests.
    pub fn memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = parse_key(key)?;
        Ok(self.store.get(&path).await?.bytes().await?)
    }

    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<(), BlobError> {
        let path = parse_key(key)?;
        self.store.put(&path, bytes.into()).await?;
        Ok(())
    }
}

fn parse_key(key: &str) -> Result<ObjectPath, BlobError> {
    ObjectPath::parse(key).map_err(|source| BlobError::Key { key: key.to_string(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip() {
        let blob = BlobStore::memory();
        blob.put("attacks/a1/f1.exe", Bytes::from_static(b"MZpayload")).await.unwrap();
        let got = blob.get("attacks/a1/f1.exe").await.unwrap();
        assert_eq!(&got[..], b"MZpayload");
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let blob = BlobStore::memory();
        assert!(blob.get("nope").await.is_err());
    }
}
