use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => f.write_str("local"),
            BackendType::Memory => f.write_str("memory"),
        }
    }
}

/// Opaque blob store on the remote side. Nothing returned from it is trusted
/// until it has been authenticated.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Stores `data` under `blob_id`, replacing any previous content.
    async fn put(&self, blob_id: &str, data: Bytes) -> Result<()>;

    async fn get(&self, blob_id: &str) -> Result<Bytes>;

    /// Every blob id currently stored.
    async fn list(&self) -> Result<BTreeSet<String>>;

    async fn delete(&self, blob_id: &str) -> Result<()>;

    fn backend_type(&self) -> BackendType;
}

#[async_trait]
impl<B: Backend + ?Sized> Backend for Arc<B> {
    async fn init(&self) -> Result<()> {
        (**self).init().await
    }

    async fn put(&self, blob_id: &str, data: Bytes) -> Result<()> {
        (**self).put(blob_id, data).await
    }

    async fn get(&self, blob_id: &str) -> Result<Bytes> {
        (**self).get(blob_id).await
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        (**self).list().await
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        (**self).delete(blob_id).await
    }

    fn backend_type(&self) -> BackendType {
        (**self).backend_type()
    }
}

/// In-process store. Clones share the same blobs.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    blobs: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Bytes>>> {
        self.blobs
            .lock()
            .map_err(|_| Error::Backend("memory backend lock poisoned".to_string()))
    }

    /// Applies `f` to a stored blob in place. Used to simulate a hostile
    /// remote.
    pub fn tamper(&self, blob_id: &str, f: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        let mut blobs = self.blobs()?;
        let blob = blobs
            .get_mut(blob_id)
            .ok_or_else(|| Error::Backend(format!("blob not found: {}", blob_id)))?;
        let mut data = blob.to_vec();
        f(&mut data);
        *blob = Bytes::from(data);
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, blob_id: &str, data: Bytes) -> Result<()> {
        self.blobs()?.insert(blob_id.to_string(), data);
        Ok(())
    }

    async fn get(&self, blob_id: &str) -> Result<Bytes> {
        self.blobs()?
            .get(blob_id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("blob not found: {}", blob_id)))
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        Ok(self.blobs()?.keys().cloned().collect())
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        self.blobs()?.remove(blob_id);
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("data/1", Bytes::from_static(b"one")).await.unwrap();
        backend.put("config", Bytes::from_static(b"cfg")).await.unwrap();

        assert_eq!(backend.get("data/1").await.unwrap(), Bytes::from_static(b"one"));
        let listed: Vec<_> = backend.list().await.unwrap().into_iter().collect();
        assert_eq!(listed, vec!["config", "data/1"]);

        backend.delete("data/1").await.unwrap();
        assert!(matches!(backend.get("data/1").await.unwrap_err(), Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let shared: Arc<dyn Backend> = Arc::new(backend.clone());
        shared.put("x", Bytes::from_static(b"abc")).await.unwrap();

        backend.tamper("x", |data| data[0] = b'z').unwrap();
        assert_eq!(shared.get("x").await.unwrap(), Bytes::from_static(b"zbc"));
        assert_eq!(shared.backend_type(), BackendType::Memory);
    }
}
