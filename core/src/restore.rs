use crate::diff::{Change, Changeset};
use crate::manifest::Manifest;
use crate::snapshot::Snapshot;
use crate::{Error, FileKind, FileRecord, Result};
use bytes::Bytes;
use filetime::FileTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// Mode of a restore root created from scratch.
const DEFAULT_ROOT_MODE: u32 = 0o755;

/// Tree state rebuilt in memory by replaying changesets oldest first.
#[derive(Debug, Default)]
pub struct RestoredTree {
    records: BTreeMap<String, (FileRecord, Option<Bytes>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

impl RestoredTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Applies one snapshot's changeset. A full snapshot replaces everything
    /// accumulated so far.
    pub fn apply(&mut self, snapshot: &Snapshot, changeset: Changeset) -> Result<()> {
        if snapshot.is_full() {
            self.records.clear();
        }
        let (entries, _, _) = changeset.into_parts();
        for entry in entries {
            match entry.change {
                Change::Removed => {
                    self.records.remove(&entry.record.path);
                }
                Change::Added | Change::Modified | Change::Unchanged => {
                    if entry.record.is_file() && entry.content.is_none() {
                        return Err(Error::format(
                            format!("snapshot {}", snapshot.id),
                            format!("file {} has no content", entry.record.path),
                        ));
                    }
                    self.records
                        .insert(entry.record.path.clone(), (entry.record, entry.content));
                }
            }
        }
        debug!(snapshot = %snapshot.id, entries = self.records.len(), "Changeset applied");
        Ok(())
    }

    pub fn manifest(&self) -> Manifest {
        self.records.values().map(|(record, _)| record.clone()).collect()
    }

    /// Checks the rebuilt tree against the manifest sealed into the target
    /// snapshot's blob.
    pub fn verify(&self, snapshot: &Snapshot, expected: &Manifest) -> Result<()> {
        let rebuilt = self.manifest();
        if rebuilt.same_live_state(expected) {
            return Ok(());
        }

        let mismatch = expected
            .live()
            .find(|want| match rebuilt.get(&want.path) {
                Some(have) => !have.same_state(want),
                None => true,
            })
            .map(|r| r.path.clone())
            .or_else(|| {
                rebuilt
                    .live()
                    .find(|have| expected.get(&have.path).is_none_or(|r| r.is_tombstone()))
                    .map(|r| r.path.clone())
            })
            .unwrap_or_default();
        Err(Error::format(
            format!("snapshot {}", snapshot.id),
            format!("reconstructed tree differs from its manifest at {:?}", mismatch),
        ))
    }

    /// Takes modification times and modes from the target's manifest. Paths
    /// whose only change was their mtime travel in no archive, so the replayed
    /// records can carry an older one.
    pub fn adopt_metadata(&mut self, expected: &Manifest) {
        for (record, _) in self.records.values_mut() {
            if let Some(want) = expected.get(&record.path).filter(|w| w.kind == record.kind) {
                record.mtime = want.mtime;
                record.mode = want.mode;
            }
        }
    }

    /// Writes the tree under `destination`, which must be absent or an empty
    /// directory. Everything is built in a staging directory beside it and
    /// renamed into place, so a failure leaves nothing behind.
    pub fn materialize(&self, destination: &Path) -> Result<MaterializeStats> {
        check_destination(destination)?;

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        fs::create_dir_all(&parent)
            .map_err(|e| Error::storage(format!("creating {}", parent.display()), e))?;
        let staging = tempfile::Builder::new()
            .prefix(".cairn-restore-")
            .tempdir_in(&parent)
            .map_err(|e| Error::storage(format!("creating staging directory in {}", parent.display()), e))?;

        let mut stats = MaterializeStats::default();
        let mut directories = Vec::new();
        for (record, content) in self.records.values() {
            let target = staging.path().join(&record.path);
            write_entry(&target, record, content.as_deref(), &mut stats)
                .map_err(|e| Error::storage(format!("restoring {}", record.path), e))?;
            if record.is_dir() {
                directories.push((target, record));
            }
        }

        // Deepest first, so restricting a parent cannot block its children.
        for (target, record) in directories.iter().rev() {
            set_mode(target, record.mode)
                .and_then(|_| filetime::set_file_mtime(target, FileTime::from_unix_time(record.mtime, 0)))
                .map_err(|e| Error::storage(format!("restoring {}", record.path), e))?;
        }

        // The staging directory is private; give the root the mode of the
        // directory it replaces, or of a fresh one.
        set_mode(staging.path(), root_mode(destination))
            .map_err(|e| Error::storage(format!("restoring {}", destination.display()), e))?;

        if destination.exists() {
            fs::remove_dir(destination)
                .map_err(|e| Error::storage(format!("replacing {}", destination.display()), e))?;
        }
        fs::rename(staging.path(), destination)
            .map_err(|e| Error::storage(format!("moving restored tree to {}", destination.display()), e))?;

        info!(
            destination = %destination.display(),
            files = stats.files,
            directories = stats.directories,
            bytes = stats.bytes,
            "Tree materialized"
        );
        Ok(stats)
    }
}

fn check_destination(destination: &Path) -> Result<()> {
    match fs::symlink_metadata(destination) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::storage(format!("inspecting {}", destination.display()), e)),
        Ok(meta) if meta.is_dir() => {
            let mut listing = fs::read_dir(destination)
                .map_err(|e| Error::storage(format!("inspecting {}", destination.display()), e))?;
            if listing.next().is_some() {
                return Err(Error::storage(
                    format!("restoring into {}", destination.display()),
                    io::Error::new(io::ErrorKind::AlreadyExists, "destination is not empty"),
                ));
            }
            Ok(())
        }
        Ok(_) => Err(Error::storage(
            format!("restoring into {}", destination.display()),
            io::Error::new(io::ErrorKind::AlreadyExists, "destination exists and is not a directory"),
        )),
    }
}

fn write_entry(
    target: &Path,
    record: &FileRecord,
    content: Option<&[u8]>,
    stats: &mut MaterializeStats,
) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mtime = FileTime::from_unix_time(record.mtime, 0);

    match record.kind {
        FileKind::Directory => {
            fs::create_dir_all(target)?;
            stats.directories += 1;
        }
        FileKind::File => {
            let data = content.unwrap_or_default();
            fs::write(target, data)?;
            set_mode(target, record.mode)?;
            filetime::set_file_mtime(target, mtime)?;
            stats.files += 1;
            stats.bytes += data.len() as u64;
        }
        FileKind::Symlink => {
            let link_target = record.link_target.as_deref().unwrap_or_default();
            if create_symlink(link_target, target)? {
                filetime::set_symlink_file_times(target, mtime, mtime)?;
                stats.symlinks += 1;
            }
        }
        FileKind::Tombstone => {}
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link_target: &str, path: &Path) -> io::Result<bool> {
    std::os::unix::fs::symlink(link_target, path)?;
    Ok(true)
}

#[cfg(not(unix))]
fn create_symlink(link_target: &str, path: &Path) -> io::Result<bool> {
    tracing::warn!(path = %path.display(), target = link_target, "Symlinks are not restored on this platform");
    Ok(false)
}

#[cfg(unix)]
fn root_mode(destination: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(destination)
        .map(|meta| meta.permissions().mode() & 0o7777)
        .unwrap_or(DEFAULT_ROOT_MODE)
}

#[cfg(not(unix))]
fn root_mode(_destination: &Path) -> u32 {
    DEFAULT_ROOT_MODE
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    if let Err(e) = fs::set_permissions(path, permissions) {
        tracing::warn!(path = %path.display(), error = %e, "Could not apply permissions");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{DiffMode, diff};
    use crate::scan::{ScanOptions, scan_tree};
    use crate::snapshot::SnapshotKind;
    use crate::SnapshotId;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn snapshot(id: u64, kind: SnapshotKind) -> Snapshot {
        let parent = (id > 1).then(|| SnapshotId(id - 1));
        Snapshot::new(SnapshotId(id), parent, kind, "key", PathBuf::from("/src"))
    }

    fn scan(dir: &Path) -> crate::scan::TreeScan {
        scan_tree(dir, &ScanOptions::default()).unwrap()
    }

    #[test]
    fn test_replay_applies_deletions() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::write(src.path().join("b.txt"), b"keep").unwrap();
        let first = diff(None, &scan(src.path()), DiffMode::Full);

        fs::remove_file(src.path().join("a.txt")).unwrap();
        let second = diff(Some(first.manifest()), &scan(src.path()), DiffMode::Incremental);
        let expected = second.manifest().clone();

        let mut tree = RestoredTree::new();
        tree.apply(&snapshot(1, SnapshotKind::Full), first).unwrap();
        assert_eq!(tree.len(), 2);
        tree.apply(&snapshot(2, SnapshotKind::Incremental), second).unwrap();
        assert_eq!(tree.len(), 1);
        tree.verify(&snapshot(2, SnapshotKind::Incremental), &expected).unwrap();
    }

    #[test]
    fn test_verify_reports_the_diverging_path() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let changeset = diff(None, &scan(src.path()), DiffMode::Full);

        let mut expected = changeset.manifest().clone();
        let mut extra = expected.get("a.txt").unwrap().clone();
        extra.path = "z.txt".to_string();
        expected.insert(extra);

        let mut tree = RestoredTree::new();
        tree.apply(&snapshot(1, SnapshotKind::Full), changeset).unwrap();
        let err = tree.verify(&snapshot(1, SnapshotKind::Full), &expected).unwrap_err();
        assert!(matches!(err, Error::Format { .. }));
        assert!(err.to_string().contains("z.txt"));
    }

    #[test]
    fn test_materialize_restores_content_modes_and_mtimes() {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("docs")).unwrap();
        fs::write(src.path().join("docs/notes.txt"), b"notes").unwrap();
        fs::write(src.path().join("top.txt"), b"top").unwrap();
        filetime::set_file_mtime(
            src.path().join("top.txt"),
            FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("top.txt", src.path().join("link")).unwrap();

        let changeset = diff(None, &scan(src.path()), DiffMode::Full);
        let mut tree = RestoredTree::new();
        tree.apply(&snapshot(1, SnapshotKind::Full), changeset).unwrap();

        let out = TempDir::new().unwrap();
        let destination = out.path().join("restored");
        let stats = tree.materialize(&destination).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 1);
        assert_eq!(stats.bytes, 8);

        assert_eq!(fs::read(destination.join("docs/notes.txt")).unwrap(), b"notes");
        let meta = fs::metadata(destination.join("top.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_600_000_000);
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(destination.join("link")).unwrap(),
            PathBuf::from("top.txt")
        );

        // The rebuilt tree scans back to the same state.
        let rescanned = scan(&destination);
        let original_scan = scan(src.path());
        for entry in rescanned.entries() {
            let original = &original_scan.get(&entry.record.path).unwrap().record;
            assert!(entry.record.same_state(original), "{}", entry.record.path);
        }

        // No staging directories are left beside the destination.
        let leftovers: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_adopt_metadata_takes_the_target_mtime() {
        let src = TempDir::new().unwrap();
        fs::write(src.path().join("a.txt"), b"same").unwrap();
        filetime::set_file_mtime(src.path().join("a.txt"), FileTime::from_unix_time(1_000_000_000, 0))
            .unwrap();
        let first = diff(None, &scan(src.path()), DiffMode::Full);

        filetime::set_file_mtime(src.path().join("a.txt"), FileTime::from_unix_time(1_700_000_000, 0))
            .unwrap();
        let second = diff(Some(first.manifest()), &scan(src.path()), DiffMode::Incremental);
        assert!(second.entries().is_empty());
        let expected = second.manifest().clone();

        let mut tree = RestoredTree::new();
        tree.apply(&snapshot(1, SnapshotKind::Full), first).unwrap();
        tree.apply(&snapshot(2, SnapshotKind::Incremental), second).unwrap();
        tree.verify(&snapshot(2, SnapshotKind::Incremental), &expected).unwrap();
        tree.adopt_metadata(&expected);
        assert_eq!(tree.manifest(), expected);

        let out = TempDir::new().unwrap();
        let destination = out.path().join("restored");
        tree.materialize(&destination).unwrap();
        let meta = fs::metadata(destination.join("a.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_700_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_root_gets_a_regular_mode() {
        use std::os::unix::fs::PermissionsExt;
        let out = TempDir::new().unwrap();

        let fresh = out.path().join("fresh");
        RestoredTree::new().materialize(&fresh).unwrap();
        assert_eq!(fs::metadata(&fresh).unwrap().permissions().mode() & 0o7777, DEFAULT_ROOT_MODE);

        let existing = out.path().join("existing");
        fs::create_dir(&existing).unwrap();
        fs::set_permissions(&existing, fs::Permissions::from_mode(0o750)).unwrap();
        RestoredTree::new().materialize(&existing).unwrap();
        assert_eq!(fs::metadata(&existing).unwrap().permissions().mode() & 0o7777, 0o750);
    }

    #[test]
    fn test_materialize_refuses_non_empty_destination() {
        let out = TempDir::new().unwrap();
        fs::write(out.path().join("existing"), b"x").unwrap();

        let err = RestoredTree::new().materialize(out.path()).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(out.path().join("existing").exists());
    }

    #[test]
    fn test_materialize_into_empty_directory() {
        let out = TempDir::new().unwrap();
        let destination = out.path().join("empty");
        fs::create_dir(&destination).unwrap();

        let stats = RestoredTree::new().materialize(&destination).unwrap();
        assert_eq!(stats, MaterializeStats::default());
        assert!(destination.is_dir());
        assert_eq!(fs::read_dir(&destination).unwrap().count(), 0);
    }
}
