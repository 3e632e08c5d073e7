//! Advisory locks on a backup set's state directory.
//!
//! A backup holds a [`WriteLock`] for its whole run; restores and checks hold
//! a [`ReadLock`]. Any number of readers may coexist, a writer excludes
//! everyone. Locks are released when the guard is dropped, including when
//! the process dies.

use crate::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = "lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    hostname: String,
    pid: u32,
    time: chrono::DateTime<chrono::Utc>,
}

/// Exclusive access to a backup set. Required to publish snapshots.
#[derive(Debug)]
pub struct WriteLock {
    file: File,
    path: PathBuf,
}

/// Shared access to a backup set.
#[derive(Debug)]
pub struct ReadLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(state_dir: &Path) -> Result<(File, PathBuf)> {
    let path = state_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| Error::storage(format!("opening lock file {}", path.display()), e))?;
    Ok((file, path))
}

fn contention_error(file: &mut File, path: &Path, error: std::io::Error) -> Error {
    if error.kind() != fs2::lock_contended_error().kind() {
        return Error::storage(format!("locking {}", path.display()), error);
    }

    let mut holder = String::new();
    let _ = file.read_to_string(&mut holder);
    match serde_json::from_str::<LockInfo>(&holder) {
        Ok(info) => Error::LockConflict(format!(
            "backup set is busy: backup by pid {} on {} since {}",
            info.pid, info.hostname, info.time
        )),
        Err(_) => Error::LockConflict("backup set is busy".to_string()),
    }
}

impl WriteLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let (mut file, path) = open_lock_file(state_dir)?;
        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            return Err(contention_error(&mut file, &path, e));
        }

        let info = LockInfo {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            time: chrono::Utc::now(),
        };
        let record = serde_json::to_vec(&info)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&record))
            .map_err(|e| Error::storage(format!("writing lock file {}", path.display()), e))?;

        debug!(path = %path.display(), "Acquired exclusive lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReadLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        let (mut file, path) = open_lock_file(state_dir)?;
        if let Err(e) = FileExt::try_lock_shared(&file) {
            return Err(contention_error(&mut file, &path, e));
        }
        debug!(path = %path.display(), "Acquired shared lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

impl Drop for ReadLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_writer_is_rejected() {
        let dir = TempDir::new().unwrap();
        let first = WriteLock::acquire(dir.path()).unwrap();

        let err = WriteLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, Error::LockConflict(_)));
        assert!(err.to_string().contains("busy"));

        drop(first);
        WriteLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_readers_share_but_exclude_writer() {
        let dir = TempDir::new().unwrap();
        let r1 = ReadLock::acquire(dir.path()).unwrap();
        let r2 = ReadLock::acquire(dir.path()).unwrap();

        assert!(matches!(
            WriteLock::acquire(dir.path()).unwrap_err(),
            Error::LockConflict(_)
        ));

        drop(r1);
        drop(r2);
        let writer = WriteLock::acquire(dir.path()).unwrap();
        assert!(matches!(
            ReadLock::acquire(dir.path()).unwrap_err(),
            Error::LockConflict(_)
        ));
        drop(writer);
    }
}
