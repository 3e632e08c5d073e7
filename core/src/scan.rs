use crate::types::normalize_rel_path;
use crate::{ContentHash, Error, FileKind, FileRecord, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Gitignore-style patterns, matched relative to the scan root.
    pub excludes: Vec<String>,
}

/// A path the scan could not read. Such paths are neither unchanged nor
/// removed; their last known state is carried forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub record: FileRecord,
    pub source: PathBuf,
}

/// Current state of a tree, as seen by one walk.
#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    root: PathBuf,
    entries: BTreeMap<String, ScannedEntry>,
    issues: Vec<ScanIssue>,
    unreadable: BTreeSet<String>,
}

impl TreeScan {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn push(&mut self, record: FileRecord) {
        let source = self.root.join(&record.path);
        self.entries
            .insert(record.path.clone(), ScannedEntry { record, source });
    }

    /// Records that `path` (and, for a directory, everything below it) could
    /// not be read.
    pub fn push_issue(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        let path = path.into();
        self.unreadable.insert(path.clone());
        self.issues.push(ScanIssue {
            path,
            reason: reason.into(),
        });
    }

    pub fn get(&self, path: &str) -> Option<&ScannedEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ScannedEntry> {
        self.entries.values()
    }

    pub fn issues(&self) -> &[ScanIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `path` or one of its ancestors could not be read.
    pub fn is_shadowed(&self, path: &str) -> bool {
        if self.unreadable.is_empty() {
            return false;
        }
        let mut end = 0;
        loop {
            let next = path[end..].find('/').map(|i| end + i);
            let prefix = match next {
                Some(i) => &path[..i],
                None => path,
            };
            if self.unreadable.contains(prefix) {
                return true;
            }
            match next {
                Some(i) => end = i + 1,
                None => return false,
            }
        }
    }
}

fn build_excludes(root: &Path, patterns: &[String]) -> Result<Gitignore> {
    let mut builder = GitignoreBuilder::new(root);
    for pattern in patterns {
        builder
            .add_line(None, pattern)
            .map_err(|e| Error::Other(format!("invalid exclude pattern {:?}: {}", pattern, e)))?;
    }
    builder
        .build()
        .map_err(|e| Error::Other(format!("invalid exclude patterns: {}", e)))
}

/// Walks `root` without following symlinks and fingerprints every regular
/// file. Only an unreadable root fails the scan; anything below it that cannot
/// be read becomes a [`ScanIssue`].
pub fn scan_tree(root: &Path, options: &ScanOptions) -> Result<TreeScan> {
    let meta = fs::symlink_metadata(root).map_err(|e| Error::Scan {
        path: root.to_path_buf(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(Error::Scan {
            path: root.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        });
    }

    let excludes = build_excludes(root, &options.excludes)?;
    let mut scan = TreeScan::new(root);
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(root).to_path_buf();
                if err.depth() == 0 {
                    let source = err
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("filesystem loop"));
                    return Err(Error::Scan { path, source });
                }
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let key = normalize_rel_path(rel).unwrap_or_else(|_| rel.display().to_string());
                warn!(path = %key, error = %err, "Skipping unreadable path");
                scan.push_issue(key, err.to_string());
                continue;
            }
        };

        let is_dir = entry.file_type().is_dir();
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if excludes.matched_path_or_any_parents(rel, is_dir).is_ignore() {
            debug!(path = %rel.display(), "Excluded");
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }

        let key = match normalize_rel_path(rel) {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %rel.display(), error = %e, "Skipping path");
                scan.push_issue(rel.display().to_string(), e.to_string());
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
        };

        match read_record(entry.path(), &key) {
            Ok(Some(record)) => scan.push(record),
            Ok(None) => {
                debug!(path = %key, "Skipping special file");
            }
            Err(e) => {
                warn!(path = %key, error = %e, "Skipping unreadable path");
                scan.push_issue(key, e.to_string());
                if is_dir {
                    walker.skip_current_dir();
                }
            }
        }
    }

    debug!(
        root = %root.display(),
        entries = scan.len(),
        issues = scan.issues().len(),
        "Scan finished"
    );
    Ok(scan)
}

/// Builds the record for one path. Sockets, FIFOs and devices yield `None`.
fn read_record(path: &Path, key: &str) -> io::Result<Option<FileRecord>> {
    let meta = fs::symlink_metadata(path)?;
    let file_type = meta.file_type();

    let mut record = FileRecord {
        path: key.to_string(),
        kind: FileKind::File,
        mode: mode_of(&meta),
        size: 0,
        mtime: mtime_of(&meta),
        fingerprint: None,
        link_target: None,
    };

    if file_type.is_symlink() {
        let target = fs::read_link(path)?;
        let target = target.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "symlink target is not valid UTF-8")
        })?;
        record.kind = FileKind::Symlink;
        record.size = target.len() as u64;
        record.link_target = Some(target.to_string());
    } else if file_type.is_dir() {
        record.kind = FileKind::Directory;
    } else if file_type.is_file() {
        let (fingerprint, size) = fingerprint_file(path)?;
        record.size = size;
        record.fingerprint = Some(fingerprint);
    } else {
        return Ok(None);
    }

    Ok(Some(record))
}

/// Streams a file through BLAKE3.
pub fn fingerprint_file(path: &Path) -> io::Result<(ContentHash, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((ContentHash::new(hasher.finalize()), size))
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn mtime_of(meta: &Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/b.log"), b"log").unwrap();
        fs::write(dir.path().join("sub/deeper/c.txt"), b"c").unwrap();
        dir
    }

    #[test]
    fn test_scan_records_files_and_dirs() {
        let dir = tree();
        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();

        let paths: Vec<_> = scan.entries().map(|e| e.record.path.clone()).collect();
        assert_eq!(
            paths,
            vec!["a.txt", "sub", "sub/b.log", "sub/deeper", "sub/deeper/c.txt"]
        );

        let a = &scan.get("a.txt").unwrap().record;
        assert_eq!(a.kind, FileKind::File);
        assert_eq!(a.size, 5);
        assert_eq!(a.fingerprint, Some(ContentHash::from_data(b"hello")));
        assert!(scan.get("sub").unwrap().record.is_dir());
        assert!(scan.issues().is_empty());
    }

    #[test]
    fn test_excludes_use_gitignore_syntax() {
        let dir = tree();
        let options = ScanOptions {
            excludes: vec!["*.log".to_string(), "deeper/".to_string()],
        };
        let scan = scan_tree(dir.path(), &options).unwrap();
        let paths: Vec<_> = scan.entries().map(|e| e.record.path.clone()).collect();
        assert_eq!(paths, vec!["a.txt", "sub"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_records_target_not_content() {
        let dir = tree();
        std::os::unix::fs::symlink("a.txt", dir.path().join("link")).unwrap();
        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();
        let link = &scan.get("link").unwrap().record;
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("a.txt"));
        assert_eq!(link.fingerprint, None);
    }

    #[test]
    fn test_missing_root_is_a_scan_fault() {
        let dir = TempDir::new().unwrap();
        let err = scan_tree(&dir.path().join("nope"), &ScanOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Scan { .. }));
    }

    #[test]
    fn test_is_shadowed() {
        let mut scan = TreeScan::new("/r");
        scan.push_issue("locked", "permission denied");
        assert!(scan.is_shadowed("locked"));
        assert!(scan.is_shadowed("locked/inner/file"));
        assert!(!scan.is_shadowed("locked-not"));
        assert!(!scan.is_shadowed("other/locked"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_symlink_target_is_reported_not_fatal() {
        use std::os::unix::ffi::OsStrExt;
        let dir = tree();
        std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(b"\xff"), dir.path().join("odd"))
            .unwrap();

        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();
        assert!(scan.get("odd").is_none());
        assert!(scan.get("a.txt").is_some());
        assert_eq!(scan.issues().len(), 1);
        assert_eq!(scan.issues()[0].path, "odd");
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_reported_not_fatal() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tree();
        let secret = dir.path().join("secret.txt");
        fs::write(&secret, b"classified").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&secret).is_ok() {
            // Running with privileges that bypass permission bits.
            return;
        }

        let scan = scan_tree(dir.path(), &ScanOptions::default()).unwrap();
        assert!(scan.get("secret.txt").is_none());
        assert!(scan.get("a.txt").is_some());
        assert_eq!(scan.issues().len(), 1);
        assert_eq!(scan.issues()[0].path, "secret.txt");
    }
}
