use crate::lock::WriteLock;
use crate::snapshot::{Snapshot, SnapshotChain};
use crate::types::is_normalized;
use crate::{Error, FileRecord, Result, SnapshotId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Complete logical state of the tree at one snapshot, keyed by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    entries: BTreeMap<String, FileRecord>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record`, replacing any earlier record for the same path.
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.entries.insert(record.path.clone(), record)
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Records in path order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.entries.values()
    }

    /// Records that exist on disk, in path order.
    pub fn live(&self) -> impl Iterator<Item = &FileRecord> {
        self.entries.values().filter(|r| !r.is_tombstone())
    }

    pub fn tombstones(&self) -> impl Iterator<Item = &FileRecord> {
        self.entries.values().filter(|r| r.is_tombstone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.live().filter(|r| r.is_file()).map(|r| r.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.live().filter(|r| r.is_file()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.live().filter(|r| r.is_dir()).count()
    }

    /// Compares the live state of two manifests, ignoring tombstones and
    /// modification times.
    pub fn same_live_state(&self, other: &Manifest) -> bool {
        let mut mine = self.live();
        let mut theirs = other.live();
        loop {
            match (mine.next(), theirs.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a.path == b.path && a.same_state(b) => {}
                _ => return false,
            }
        }
    }

    /// Rejects manifests whose keys disagree with their records or are not
    /// normalized relative paths.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (key, record) in &self.entries {
            if key != &record.path {
                return Err(format!("entry {} is keyed as {}", record.path, key));
            }
            if !is_normalized(key) {
                return Err(format!("unsafe path {:?}", key));
            }
        }
        Ok(())
    }
}

impl FromIterator<FileRecord> for Manifest {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut manifest = Manifest::new();
        for record in iter {
            manifest.insert(record);
        }
        manifest
    }
}

pub const MANIFESTS_DIR: &str = "manifests";
pub const CHAIN_INDEX: &str = "chain.jsonl";

/// Local, authoritative history of manifests and the chain index.
///
/// ```text
/// state/
/// ├── manifests/<id>.json   # one manifest per snapshot
/// └── chain.jsonl           # chain index, one snapshot per line
/// ```
///
/// A manifest is always fully on disk before the index line that refers to
/// it is published, so a crash never leaves a dangling index entry.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub async fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(store.root.join(MANIFESTS_DIR))
            .await
            .map_err(|e| Error::storage(format!("creating {}", store.root.display()), e))?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(&self, id: SnapshotId) -> PathBuf {
        self.root.join(MANIFESTS_DIR).join(format!("{:010}.json", id.0))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(CHAIN_INDEX)
    }

    /// Reads the whole chain index. A missing index is an empty chain.
    pub async fn load_chain(&self) -> Result<SnapshotChain> {
        match fs::read(self.index_path()).await {
            Ok(data) => SnapshotChain::from_jsonl(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotChain::new()),
            Err(e) => Err(Error::storage("reading the chain index", e)),
        }
    }

    pub async fn load(&self, id: SnapshotId) -> Result<Manifest> {
        let path = self.manifest_path(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::chain(format!(
                    "manifest for snapshot {} is missing from {}",
                    id,
                    path.display()
                )));
            }
            Err(e) => return Err(Error::storage(format!("reading {}", path.display()), e)),
        };
        let manifest: Manifest = serde_json::from_slice(&data).map_err(|e| {
            Error::chain(format!("manifest for snapshot {} is corrupt: {}", id, e))
        })?;
        manifest.validate().map_err(|reason| {
            Error::chain(format!("manifest for snapshot {} is corrupt: {}", id, reason))
        })?;
        Ok(manifest)
    }

    /// Manifest of the newest snapshot in `chain`, or `None` before the first
    /// backup.
    pub async fn load_latest(&self, chain: &SnapshotChain) -> Result<Option<Manifest>> {
        match chain.latest() {
            Some(snapshot) => self.load(snapshot.id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Persists `manifest` and publishes `snapshot` as the newest entry of
    /// `chain`. On error the on-disk index and `chain` are left untouched.
    pub async fn save(
        &self,
        chain: &mut SnapshotChain,
        manifest: &Manifest,
        snapshot: Snapshot,
        _lock: &WriteLock,
    ) -> Result<()> {
        chain.check_append(&snapshot)?;

        let manifest_path = self.manifest_path(snapshot.id);
        let data = serde_json::to_vec(manifest)?;
        atomic_write(&manifest_path, &data).await?;
        debug!(snapshot = %snapshot.id, path = %manifest_path.display(), "Manifest written");

        let mut next = chain.clone();
        let id = snapshot.id;
        next.append(snapshot)?;
        atomic_write(&self.index_path(), &next.to_jsonl()?).await?;
        *chain = next;

        info!(snapshot = %id, entries = manifest.len(), "Snapshot published");
        Ok(())
    }
}

/// Writes `data` to a temporary sibling, syncs it and renames it over `path`.
pub(crate) async fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Other(format!("{} has no parent directory", path.display())))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        #[cfg(unix)]
        fs::File::open(dir).await?.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(Error::storage(format!("writing {}", path.display()), e));
    }
    Ok(())
}
