use crate::archive::{pack, unpack};
use crate::backend::Backend;
use crate::crypto::{BlobContext, Encryptor, KeyFile, MasterKey, Secret, open_blob, seal_blob};
use crate::diff::{Changeset, DiffMode, diff};
use crate::lock::{ReadLock, WriteLock};
use crate::manifest::{ManifestStore, Manifest, atomic_write};
use crate::restore::{MaterializeStats, RestoredTree};
use crate::scan::{ScanIssue, ScanOptions, scan_tree};
use crate::snapshot::{BLOB_PREFIX, Snapshot, SnapshotKind};
use crate::{Error, FORMAT_VERSION, KdfParams, RepoConfig, Result, SnapshotId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub const CONFIG_FILE: &str = "config.json";
pub const KEYS_DIR: &str = "keys";
/// Remote name of the public set descriptor.
pub const DESCRIPTOR_BLOB: &str = "config";

#[derive(Debug, Clone)]
pub struct RepoOptions {
    pub full_every: u32,
    pub compression: bool,
    pub kdf: KdfParams,
}

impl Default for RepoOptions {
    fn default() -> Self {
        let config = RepoConfig::default();
        Self {
            full_every: config.full_every,
            compression: config.compression,
            kdf: KdfParams::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub excludes: Vec<String>,
    /// Write a full snapshot regardless of the chain length.
    pub force_full: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub snapshot: Snapshot,
    pub issues: Vec<ScanIssue>,
    pub archive_size: u64,
    pub blob_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub snapshot: SnapshotId,
    /// Snapshots replayed, oldest first.
    pub chain: Vec<SnapshotId>,
    pub destination: PathBuf,
    pub stats: MaterializeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckFailure {
    pub snapshot: SnapshotId,
    pub blob_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub verified: Vec<SnapshotId>,
    pub failures: Vec<CheckFailure>,
    pub orphans: Vec<String>,
    pub removed: Vec<String>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What the remote keeps about the set besides its blobs: enough to unlock
/// the data key again if the local state directory is lost.
#[derive(Debug, Serialize, Deserialize)]
struct SetDescriptor {
    config: RepoConfig,
    key: KeyFile,
}

/// One backup set: a local state directory, a remote backend and the
/// unlocked data key.
///
/// # State directory
///
/// ```text
/// state/
/// ├── config.json          # set id, format version, policy
/// ├── keys/<key-id>.json   # data key wrapped under the passphrase
/// ├── manifests/<id>.json  # one manifest per snapshot
/// ├── chain.jsonl          # chain index
/// └── lock                 # advisory lock
/// ```
///
/// The remote holds one sealed archive per snapshot under `data/` and the
/// set descriptor under `config`.
///
/// # Examples
///
/// ```no_run
/// use cairn_core::backend::MemoryBackend;
/// use cairn_core::crypto::Secret;
/// use cairn_core::repository::{BackupOptions, RepoOptions};
/// use cairn_core::Repository;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> cairn_core::Result<()> {
///     let backend = Arc::new(MemoryBackend::new());
///     let secret = Secret::from_passphrase("my-password");
///     let repo = Repository::init("./state", backend, &secret, RepoOptions::default()).await?;
///
///     let report = repo.backup("./documents".as_ref(), &BackupOptions::default()).await?;
///     repo.restore(report.snapshot.id, "./restored".as_ref()).await?;
///     Ok(())
/// }
/// ```
pub struct Repository {
    state_dir: PathBuf,
    store: ManifestStore,
    backend: Arc<dyn Backend>,
    config: RepoConfig,
    key_id: String,
    encryptor: Encryptor,
}

impl Repository {
    /// Creates a backup set: the local state layout, a random set id, salt
    /// and data key, and the remote descriptor.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryExists` - the state directory or the remote already
    ///   holds a backup set
    /// * `Error::Storage` - the state directory cannot be written
    pub async fn init<P: AsRef<Path>>(
        state_dir: P,
        backend: Arc<dyn Backend>,
        secret: &Secret,
        options: RepoOptions,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        if state_dir.join(CONFIG_FILE).exists() {
            return Err(Error::RepositoryExists {
                path: state_dir.display().to_string(),
            });
        }

        backend.init().await?;
        if backend.list().await?.contains(DESCRIPTOR_BLOB) {
            return Err(Error::RepositoryExists {
                path: format!("{} remote", backend.backend_type()),
            });
        }

        let store = ManifestStore::create(&state_dir).await?;
        fs::create_dir_all(state_dir.join(KEYS_DIR))
            .await
            .map_err(|e| Error::storage(format!("creating {}", state_dir.display()), e))?;

        let config = RepoConfig {
            full_every: options.full_every.max(1),
            compression: options.compression,
            ..RepoConfig::default()
        };
        let data_key = MasterKey::generate();
        let key_file = KeyFile::wrap(secret, options.kdf, &data_key)?;

        atomic_write(
            &state_dir.join(KEYS_DIR).join(format!("{}.json", key_file.id)),
            &serde_json::to_vec_pretty(&key_file)?,
        )
        .await?;

        let descriptor = SetDescriptor {
            config: config.clone(),
            key: key_file.clone(),
        };
        backend
            .put(DESCRIPTOR_BLOB, Bytes::from(serde_json::to_vec_pretty(&descriptor)?))
            .await?;

        // The config file marks the set as initialized, so it goes last.
        atomic_write(
            &state_dir.join(CONFIG_FILE),
            &serde_json::to_vec_pretty(&config)?,
        )
        .await?;

        info!(
            set = %config.id,
            state = %state_dir.display(),
            backend = %backend.backend_type(),
            "Backup set initialized"
        );
        Ok(Self {
            state_dir,
            store,
            backend,
            config,
            key_id: key_file.id,
            encryptor: Encryptor::new(&data_key),
        })
    }

    /// Opens an existing backup set and unlocks its data key.
    ///
    /// # Errors
    ///
    /// * `Error::RepositoryNotFound` - no backup set in `state_dir`
    /// * `Error::InvalidFormatVersion` - the set was written by an unknown version
    /// * `Error::InvalidPassword` - `secret` unlocks none of the key files
    pub async fn open<P: AsRef<Path>>(
        state_dir: P,
        backend: Arc<dyn Backend>,
        secret: &Secret,
    ) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let config_data = match fs::read(state_dir.join(CONFIG_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RepositoryNotFound {
                    path: state_dir.display().to_string(),
                });
            }
            Err(e) => return Err(Error::storage("reading the set config", e)),
        };
        let config: RepoConfig = serde_json::from_slice(&config_data)?;
        if config.version != FORMAT_VERSION {
            return Err(Error::InvalidFormatVersion {
                version: config.version,
            });
        }

        let mut key_paths = Vec::new();
        let mut entries = fs::read_dir(state_dir.join(KEYS_DIR))
            .await
            .map_err(|e| Error::storage("listing key files", e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage("listing key files", e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                key_paths.push(path);
            }
        }
        key_paths.sort();

        for path in key_paths {
            let data = fs::read(&path)
                .await
                .map_err(|e| Error::storage(format!("reading {}", path.display()), e))?;
            let key_file: KeyFile = match serde_json::from_slice(&data) {
                Ok(key_file) => key_file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable key file");
                    continue;
                }
            };
            match key_file.unwrap_key(secret) {
                Ok(data_key) => {
                    debug!(set = %config.id, key = %key_file.id, "Backup set unlocked");
                    return Ok(Self {
                        store: ManifestStore::new(&state_dir),
                        state_dir,
                        backend,
                        config,
                        key_id: key_file.id,
                        encryptor: Encryptor::new(&data_key),
                    });
                }
                Err(Error::InvalidPassword) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::InvalidPassword)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn blob_context<'a>(&'a self, snapshot: &'a Snapshot) -> BlobContext<'a> {
        BlobContext {
            set_id: &self.config.id,
            blob_id: &snapshot.blob_id,
            snapshot: snapshot.id,
            parent: snapshot.parent,
        }
    }

    /// Records the current state of `source` as a new snapshot.
    ///
    /// The tree is scanned and diffed against the latest manifest, the
    /// changeset is packed, sealed and uploaded, and only then is the new
    /// manifest published locally. Paths that could not be read are listed in
    /// the report and keep their previous state.
    pub async fn backup(&self, source: &Path, options: &BackupOptions) -> Result<BackupReport> {
        let lock = WriteLock::acquire(&self.state_dir)?;
        let mut chain = self.store.load_chain().await?;
        let previous = self.store.load_latest(&chain).await?;
        let parent = chain.latest().map(|s| s.id);

        let kind = if options.force_full {
            SnapshotKind::Full
        } else {
            chain.next_kind(parent, self.config.full_every)?
        };
        let mode = match kind {
            SnapshotKind::Full => DiffMode::Full,
            SnapshotKind::Incremental => DiffMode::Incremental,
        };

        let root = fs::canonicalize(source).await.map_err(|e| Error::Scan {
            path: source.to_path_buf(),
            source: e,
        })?;
        info!(source = %root.display(), kind = ?kind, "Starting backup");

        let scan_root = root.clone();
        let scan_options = ScanOptions {
            excludes: options.excludes.clone(),
        };
        let (changeset, archive) = tokio::task::spawn_blocking(move || -> Result<(Changeset, Vec<u8>)> {
            let scan = scan_tree(&scan_root, &scan_options)?;
            let changeset = diff(previous.as_ref(), &scan, mode);
            let archive = pack(&changeset)?;
            Ok((changeset, archive))
        })
        .await
        .map_err(|e| Error::Other(format!("backup task failed: {}", e)))??;

        let id = chain.next_id(parent);
        let snapshot = Snapshot::new(id, parent, kind, self.key_id.clone(), root)
            .with_stats(changeset.stats());
        let blob = seal_blob(
            &self.encryptor,
            &self.blob_context(&snapshot),
            &archive,
            self.config.compression,
        )?;
        let blob_size = blob.len() as u64;

        self.backend.put(&snapshot.blob_id, Bytes::from(blob)).await?;
        debug!(snapshot = %id, blob = %snapshot.blob_id, bytes = blob_size, "Blob uploaded");

        let (_, manifest, issues) = changeset.into_parts();
        self.store
            .save(&mut chain, &manifest, snapshot.clone(), &lock)
            .await?;

        for issue in &issues {
            warn!(path = %issue.path, reason = %issue.reason, "Path skipped");
        }
        info!(
            snapshot = %id,
            kind = ?kind,
            added = snapshot.stats.added,
            modified = snapshot.stats.modified,
            removed = snapshot.stats.removed,
            skipped = snapshot.stats.skipped,
            "Backup complete"
        );
        Ok(BackupReport {
            snapshot,
            issues,
            archive_size: archive.len() as u64,
            blob_size,
        })
    }

    /// Fetches, authenticates and decodes one snapshot's archive.
    async fn fetch_changeset(&self, snapshot: &Snapshot) -> Result<Changeset> {
        let data = self
            .backend
            .get(&snapshot.blob_id)
            .await
            .map_err(|e| Error::Unreachable {
                snapshot: snapshot.id,
                blob_id: snapshot.blob_id.clone(),
                reason: e.to_string(),
            })?;
        let archive = open_blob(&self.encryptor, &self.blob_context(snapshot), &data)?;
        unpack(&archive).map_err(|e| match e {
            Error::Format { context, reason } => Error::Format {
                context: format!("snapshot {}, {}", snapshot.id, context),
                reason,
            },
            other => other,
        })
    }

    /// Rebuilds snapshot `target` under `destination`, which must be absent
    /// or an empty directory.
    pub async fn restore(&self, target: SnapshotId, destination: &Path) -> Result<RestoreReport> {
        let _lock = ReadLock::acquire(&self.state_dir)?;
        let chain = self.store.load_chain().await?;
        let path = chain.resolve_chain(target)?;
        info!(snapshot = %target, chain_len = path.len(), "Starting restore");

        let mut tree = RestoredTree::new();
        let mut expected = None;
        for snapshot in &path {
            let changeset = self.fetch_changeset(snapshot).await?;
            if snapshot.id == target {
                expected = Some(changeset.manifest().clone());
            }
            tree.apply(snapshot, changeset)?;
        }

        let (Some(last), Some(expected)) = (path.last(), expected) else {
            return Err(Error::chain(format!("snapshot {} resolved to an empty chain", target)));
        };
        tree.verify(last, &expected)?;
        tree.adopt_metadata(&expected);

        let dest = destination.to_path_buf();
        let stats = tokio::task::spawn_blocking(move || tree.materialize(&dest))
            .await
            .map_err(|e| Error::Other(format!("restore task failed: {}", e)))??;

        Ok(RestoreReport {
            snapshot: target,
            chain: path.iter().map(|s| s.id).collect(),
            destination: destination.to_path_buf(),
            stats,
        })
    }

    /// Verifies every snapshot end to end and looks for orphan blobs. With
    /// `remove_orphans`, orphans are deleted from the remote.
    pub async fn check(&self, remove_orphans: bool) -> Result<CheckReport> {
        let (_read, _write) = if remove_orphans {
            (None, Some(WriteLock::acquire(&self.state_dir)?))
        } else {
            (Some(ReadLock::acquire(&self.state_dir)?), None)
        };
        let chain = self.store.load_chain().await?;
        let mut report = CheckReport::default();

        // Tree replayed so far; `None` while the chain is broken.
        let mut tree: Option<RestoredTree> = None;
        for snapshot in chain.iter() {
            if snapshot.is_full() {
                tree = Some(RestoredTree::new());
            }
            let result = match tree.as_mut() {
                Some(tree) => self.check_snapshot(snapshot, tree).await,
                None => Err(Error::chain(format!(
                    "snapshot {} depends on a snapshot that failed verification",
                    snapshot.id
                ))),
            };
            match result {
                Ok(()) => {
                    debug!(snapshot = %snapshot.id, "Snapshot verified");
                    report.verified.push(snapshot.id);
                }
                Err(e) => {
                    warn!(snapshot = %snapshot.id, error = %e, "Snapshot failed verification");
                    report.failures.push(CheckFailure {
                        snapshot: snapshot.id,
                        blob_id: snapshot.blob_id.clone(),
                        error: e.to_string(),
                    });
                    tree = None;
                }
            }
        }

        let stored = self.backend.list().await?;
        report.orphans = stored
            .iter()
            .filter(|id| id.starts_with(BLOB_PREFIX))
            .filter(|id| !chain.iter().any(|s| &s.blob_id == *id))
            .cloned()
            .collect();

        if remove_orphans {
            for blob_id in &report.orphans {
                self.backend.delete(blob_id).await?;
                info!(blob = %blob_id, "Orphan blob removed");
                report.removed.push(blob_id.clone());
            }
        }

        info!(
            verified = report.verified.len(),
            failures = report.failures.len(),
            orphans = report.orphans.len(),
            "Check complete"
        );
        Ok(report)
    }

    async fn check_snapshot(&self, snapshot: &Snapshot, tree: &mut RestoredTree) -> Result<()> {
        let changeset = self.fetch_changeset(snapshot).await?;
        let embedded = changeset.manifest().clone();
        let local = self.store.load(snapshot.id).await?;
        if embedded != local {
            return Err(Error::format(
                format!("snapshot {}", snapshot.id),
                "archive manifest differs from the local manifest",
            ));
        }
        tree.apply(snapshot, changeset)?;
        tree.verify(snapshot, &embedded)
    }

    /// Every snapshot in the chain index, oldest first.
    pub async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        let _lock = ReadLock::acquire(&self.state_dir)?;
        let chain = self.store.load_chain().await?;
        Ok(chain.iter().cloned().collect())
    }

    /// The manifest of snapshot `id`, from the local store.
    pub async fn list_files(&self, id: SnapshotId) -> Result<Manifest> {
        let _lock = ReadLock::acquire(&self.state_dir)?;
        let chain = self.store.load_chain().await?;
        if chain.get(id).is_none() {
            return Err(Error::SnapshotNotFound { id });
        }
        self.store.load(id).await
    }
}
