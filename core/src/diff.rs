use crate::manifest::Manifest;
use crate::scan::{ScanIssue, ScannedEntry, TreeScan};
use crate::{ContentHash, FileRecord};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Added,
    Modified,
    Removed,
    /// Only present in full changesets, which carry every live path.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    /// Only added, modified and removed paths.
    Incremental,
    /// Every live path, so the changeset alone rebuilds the tree.
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEntry {
    pub change: Change,
    pub record: FileRecord,
    /// Bytes of a regular file; `None` for everything else.
    pub content: Option<Bytes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub added: u64,
    pub modified: u64,
    pub removed: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub bytes: u64,
}

/// Delta between two manifests, plus the manifest it produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    entries: Vec<ChangeEntry>,
    manifest: Manifest,
    issues: Vec<ScanIssue>,
}

impl Changeset {
    pub fn new(mut entries: Vec<ChangeEntry>, manifest: Manifest, issues: Vec<ScanIssue>) -> Self {
        entries.sort_by(|a, b| a.record.path.cmp(&b.record.path));
        Self {
            entries,
            manifest,
            issues,
        }
    }

    /// Entries in path order.
    pub fn entries(&self) -> &[ChangeEntry] {
        &self.entries
    }

    /// State of the whole tree once this changeset is applied.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn issues(&self) -> &[ScanIssue] {
        &self.issues
    }

    pub fn with_change(&self, change: Change) -> impl Iterator<Item = &ChangeEntry> {
        self.entries.iter().filter(move |e| e.change == change)
    }

    /// True when nothing was added, modified or removed.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.change == Change::Unchanged)
    }

    pub fn into_parts(self) -> (Vec<ChangeEntry>, Manifest, Vec<ScanIssue>) {
        (self.entries, self.manifest, self.issues)
    }

    /// Counts per classification. Paths carried forward after a scan issue
    /// count as skipped, not unchanged.
    pub fn stats(&self) -> ChangeStats {
        let mut stats = ChangeStats {
            skipped: self.issues.len() as u64,
            ..ChangeStats::default()
        };
        for entry in &self.entries {
            match entry.change {
                Change::Added => stats.added += 1,
                Change::Modified => stats.modified += 1,
                Change::Removed => stats.removed += 1,
                Change::Unchanged => {}
            }
            stats.bytes += entry.content.as_ref().map_or(0, |c| c.len() as u64);
        }
        let live = self.manifest.live().count() as u64;
        let carried = self
            .manifest
            .live()
            .filter(|r| self.is_carried(&r.path))
            .count() as u64;
        stats.unchanged = live.saturating_sub(stats.added + stats.modified + carried);
        stats
    }

    /// Whether `path` kept its previous record because it, or a directory
    /// above it, could not be read.
    fn is_carried(&self, path: &str) -> bool {
        self.issues.iter().any(|issue| {
            path.strip_prefix(issue.path.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }
}

/// Classifies every path of `scan` against `previous`.
///
/// Added wins over everything, then Modified (fingerprint, size, mode, type or
/// symlink target differ), then Removed, then Unchanged. Paths the scan could
/// not read keep their previous record and are reported, never tombstoned.
pub fn diff(previous: Option<&Manifest>, scan: &TreeScan, mode: DiffMode) -> Changeset {
    let empty = Manifest::new();
    let previous = previous.unwrap_or(&empty);

    let mut manifest = Manifest::new();
    let mut entries = Vec::new();
    let mut issues = scan.issues().to_vec();

    for scanned in scan.entries() {
        let current = &scanned.record;
        let prior = previous.get(&current.path).filter(|r| !r.is_tombstone());
        let change = match prior {
            None => Change::Added,
            Some(prior) if prior.same_state(current) => Change::Unchanged,
            Some(_) => Change::Modified,
        };

        if change == Change::Unchanged && mode == DiffMode::Incremental {
            manifest.insert(current.clone());
            continue;
        }

        if !current.is_file() {
            manifest.insert(current.clone());
            entries.push(ChangeEntry {
                change,
                record: current.clone(),
                content: None,
            });
            continue;
        }

        match load_content(scanned) {
            Ok((record, content)) => {
                manifest.insert(record.clone());
                entries.push(ChangeEntry {
                    change,
                    record,
                    content: Some(content),
                });
            }
            Err(e) => {
                warn!(path = %current.path, error = %e, "File became unreadable during backup");
                issues.push(ScanIssue {
                    path: current.path.clone(),
                    reason: e.to_string(),
                });
                if let Some(prior) = prior {
                    carry_forward(prior, mode, &mut manifest, &mut entries);
                }
            }
        }
    }

    for prior in previous.live() {
        if scan.get(&prior.path).is_some() {
            continue;
        }
        if scan.is_shadowed(&prior.path) {
            carry_forward(prior, mode, &mut manifest, &mut entries);
            continue;
        }
        let tombstone = FileRecord::tombstone(prior.path.clone());
        manifest.insert(tombstone.clone());
        entries.push(ChangeEntry {
            change: Change::Removed,
            record: tombstone,
            content: None,
        });
    }

    let changeset = Changeset::new(entries, manifest, issues);
    debug!(stats = ?changeset.stats(), "Diff computed");
    changeset
}

/// Keeps the last known state of a path the scan could not read. A full
/// changeset has to carry the content itself, which is unavailable, so
/// unreadable files drop out of it and come back as Added once readable.
fn carry_forward(
    prior: &FileRecord,
    mode: DiffMode,
    manifest: &mut Manifest,
    entries: &mut Vec<ChangeEntry>,
) {
    match mode {
        DiffMode::Incremental => {
            manifest.insert(prior.clone());
        }
        DiffMode::Full if prior.is_file() => {}
        DiffMode::Full => {
            manifest.insert(prior.clone());
            entries.push(ChangeEntry {
                change: Change::Unchanged,
                record: prior.clone(),
                content: None,
            });
        }
    }
}

/// Reads the bytes to archive. If the file changed since it was
/// fingerprinted, the record is refreshed to describe what was read.
fn load_content(scanned: &ScannedEntry) -> io::Result<(FileRecord, Bytes)> {
    let data = read_file(&scanned.source)?;
    let mut record = scanned.record.clone();
    let fingerprint = ContentHash::from_data(&data);
    if record.fingerprint != Some(fingerprint) || record.size != data.len() as u64 {
        debug!(path = %record.path, "File changed while scanning, using the bytes read");
        record.fingerprint = Some(fingerprint);
        record.size = data.len() as u64;
    }
    Ok((record, Bytes::from(data)))
}

fn read_file(path: &Path) -> io::Result<Vec<u8>> {
    std::fs::read(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanOptions, scan_tree};
    use crate::FileKind;
    use std::fs;
    use tempfile::TempDir;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            kind: FileKind::File,
            mode: 0o644,
            size: content.len() as u64,
            mtime: 0,
            fingerprint: Some(ContentHash::from_data(content)),
            link_target: None,
        }
    }

    fn scan(dir: &TempDir) -> TreeScan {
        scan_tree(dir.path(), &ScanOptions::default()).unwrap()
    }

    #[test]
    fn test_first_backup_adds_everything() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let changeset = diff(None, &scan(&dir), DiffMode::Incremental);
        let added: Vec<_> = changeset
            .with_change(Change::Added)
            .map(|e| e.record.path.as_str())
            .collect();
        assert_eq!(added, vec!["a.txt", "d"]);

        let a = &changeset.entries()[0];
        assert_eq!(a.content.as_deref(), Some(&b"hello"[..]));
        assert_eq!(changeset.manifest().len(), 2);
        assert_eq!(changeset.stats().bytes, 5);
    }

    #[test]
    fn test_classification() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("same.txt"), b"same").unwrap();
        fs::write(dir.path().join("changed.txt"), b"new").unwrap();
        fs::write(dir.path().join("fresh.txt"), b"fresh").unwrap();

        let previous: Manifest = vec![
            record("same.txt", b"same"),
            record("changed.txt", b"old"),
            record("gone.txt", b"bye"),
        ]
        .into_iter()
        .collect();

        let changeset = diff(Some(&previous), &scan(&dir), DiffMode::Incremental);
        let summary: Vec<_> = changeset
            .entries()
            .iter()
            .map(|e| (e.record.path.as_str(), e.change))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("changed.txt", Change::Modified),
                ("fresh.txt", Change::Added),
                ("gone.txt", Change::Removed),
            ]
        );

        let manifest = changeset.manifest();
        assert!(manifest.get("gone.txt").unwrap().is_tombstone());
        assert!(manifest.get("same.txt").unwrap().is_file());

        let stats = changeset.stats();
        assert_eq!((stats.added, stats.modified, stats.removed, stats.unchanged), (1, 1, 1, 1));
    }

    #[test]
    fn test_mode_change_is_modified_but_mtime_is_not() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        let current = scan(&dir);
        let scanned = current.get("f").unwrap().record.clone();

        let mut older_mtime = scanned.clone();
        older_mtime.mtime -= 1000;
        let previous: Manifest = vec![older_mtime].into_iter().collect();
        assert!(diff(Some(&previous), &current, DiffMode::Incremental).is_empty());

        let mut other_mode = scanned;
        other_mode.mode ^= 0o100;
        let previous: Manifest = vec![other_mode].into_iter().collect();
        let changeset = diff(Some(&previous), &current, DiffMode::Incremental);
        assert_eq!(changeset.entries()[0].change, Change::Modified);
    }

    #[test]
    fn test_previous_tombstone_counts_as_absent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("back.txt"), b"again").unwrap();
        let previous: Manifest = vec![FileRecord::tombstone("back.txt")].into_iter().collect();

        let changeset = diff(Some(&previous), &scan(&dir), DiffMode::Incremental);
        assert_eq!(changeset.entries()[0].change, Change::Added);

        // Old tombstones are not carried into the next manifest.
        let empty = TempDir::new().unwrap();
        let changeset = diff(Some(&previous), &scan(&empty), DiffMode::Incremental);
        assert!(changeset.entries().is_empty());
        assert!(changeset.manifest().is_empty());
    }

    #[test]
    fn test_full_mode_carries_unchanged_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();
        let previous: Manifest = vec![record("keep.txt", b"keep"), record("old.txt", b"o")]
            .into_iter()
            .collect();

        let changeset = diff(Some(&previous), &scan(&dir), DiffMode::Full);
        let keep = &changeset.entries()[0];
        assert_eq!(keep.change, Change::Unchanged);
        assert_eq!(keep.content.as_deref(), Some(&b"keep"[..]));
        assert_eq!(changeset.entries()[1].change, Change::Removed);
        assert!(!changeset.is_empty());
    }

    #[test]
    fn test_unreadable_paths_are_carried_forward() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ok.txt"), b"ok").unwrap();
        let mut current = scan(&dir);
        current.push_issue("locked.txt", "permission denied");
        current.push_issue("private", "permission denied");

        let previous: Manifest = vec![
            record("ok.txt", b"ok"),
            record("locked.txt", b"secret"),
            record("private/inner.txt", b"inner"),
            record("deleted.txt", b"d"),
        ]
        .into_iter()
        .collect();

        let changeset = diff(Some(&previous), &current, DiffMode::Incremental);
        let manifest = changeset.manifest();
        assert_eq!(manifest.get("locked.txt"), previous.get("locked.txt"));
        assert_eq!(manifest.get("private/inner.txt"), previous.get("private/inner.txt"));
        assert!(manifest.get("deleted.txt").unwrap().is_tombstone());

        let removed: Vec<_> = changeset
            .with_change(Change::Removed)
            .map(|e| e.record.path.as_str())
            .collect();
        assert_eq!(removed, vec!["deleted.txt"]);
        let stats = changeset.stats();
        assert_eq!(stats.skipped, 2);
        // Only ok.txt was actually seen unchanged.
        assert_eq!(stats.unchanged, 1);

        // A full changeset cannot vouch for content it could not read.
        let full = diff(Some(&previous), &current, DiffMode::Full);
        assert!(full.manifest().get("locked.txt").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_compare_by_target() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("target-b", dir.path().join("link")).unwrap();
        let current = scan(&dir);

        let mut previous_link = current.get("link").unwrap().record.clone();
        previous_link.link_target = Some("target-a".to_string());
        let previous: Manifest = vec![previous_link].into_iter().collect();

        let changeset = diff(Some(&previous), &current, DiffMode::Incremental);
        let entry = &changeset.entries()[0];
        assert_eq!(entry.change, Change::Modified);
        assert!(entry.content.is_none());
    }
}
