use async_trait::async_trait;
use bytes::Bytes;
use cairn_core::{Backend, BackendType, Error, Result};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A directory standing in for the remote, e.g. a mounted network share.
/// Blob ids map to `/`-separated paths below the root.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rejects blob ids that could escape the root.
    fn validate_blob_id(blob_id: &str) -> Result<()> {
        if blob_id.is_empty() {
            return Err(Error::Backend("unsafe blob id: empty".to_string()));
        }
        if blob_id.starts_with('/') || blob_id.contains('\\') {
            return Err(Error::Backend(format!("unsafe blob id: {:?}", blob_id)));
        }
        for component in Path::new(blob_id).components() {
            if !matches!(component, Component::Normal(_)) {
                return Err(Error::Backend(format!("unsafe blob id: {:?}", blob_id)));
            }
        }
        Ok(())
    }

    fn full_path(&self, blob_id: &str) -> Result<PathBuf> {
        Self::validate_blob_id(blob_id)?;
        Ok(self.base_path.join(blob_id))
    }
}

/// Writes to a temporary file in the target directory, then renames it into
/// place. Readers never observe a partial blob.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("blob path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            Error::Backend(format!("Failed to create {}: {}", self.base_path.display(), e))
        })?;
        Ok(())
    }

    async fn put(&self, blob_id: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(blob_id)?;
        let len = data.len();
        tokio::task::spawn_blocking(move || atomic_write(&full_path, &data))
            .await
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", blob_id, e)))?
            .map_err(|e| Error::Backend(format!("Failed to write {}: {}", blob_id, e)))?;
        debug!(blob = blob_id, bytes = len, "Blob written");
        Ok(())
    }

    async fn get(&self, blob_id: &str) -> Result<Bytes> {
        let full_path = self.full_path(blob_id)?;
        let data = fs::read(&full_path)
            .await
            .map_err(|e| Error::Backend(format!("Failed to read {}: {}", blob_id, e)))?;
        Ok(Bytes::from(data))
    }

    async fn list(&self) -> Result<BTreeSet<String>> {
        let base = self.base_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut blobs = BTreeSet::new();
            if !base.is_dir() {
                return Ok(blobs);
            }
            for entry in walkdir::WalkDir::new(&base).min_depth(1) {
                let entry = entry.map_err(|e| Error::Backend(format!("Failed to list: {}", e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                // In-flight atomic writes.
                if name.starts_with(".tmp") {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&base) else {
                    continue;
                };
                let id: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                blobs.insert(id.join("/"));
            }
            Ok(blobs)
        })
        .await
        .map_err(|e| Error::Backend(format!("Failed to list: {}", e)))?
    }

    async fn delete(&self, blob_id: &str) -> Result<()> {
        let full_path = self.full_path(blob_id)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Backend(format!("Failed to delete {}: {}", blob_id, e))),
        }
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
