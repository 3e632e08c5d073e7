use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

/// BLAKE3 fingerprint of a regular file's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(blake3::Hash);

impl ContentHash {
    pub fn new(hash: blake3::Hash) -> Self {
        Self(hash)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(blake3::hash(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(hash)
    }
}

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(blake3::Hash::from(array)))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Position of a snapshot in its chain. Ids only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub const GENESIS: SnapshotId = SnapshotId(1);

    pub fn next(self) -> SnapshotId {
        SnapshotId(self.0 + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(SnapshotId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Tombstone,
}

/// State of one path at one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub kind: FileKind,
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub fingerprint: Option<ContentHash>,
    pub link_target: Option<String>,
}

impl FileRecord {
    pub fn tombstone(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Tombstone,
            mode: 0,
            size: 0,
            mtime: 0,
            fingerprint: None,
            link_target: None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, FileKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, FileKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink)
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.kind, FileKind::Tombstone)
    }

    /// Whether two records describe the same content. Modification time is
    /// not compared.
    pub fn same_state(&self, other: &FileRecord) -> bool {
        if self.kind != other.kind || self.mode != other.mode {
            return false;
        }
        match self.kind {
            FileKind::File => self.size == other.size && self.fingerprint == other.fingerprint,
            FileKind::Symlink => self.link_target == other.link_target,
            FileKind::Directory | FileKind::Tombstone => true,
        }
    }
}

/// Turns a path relative to the backup root into its canonical manifest key:
/// `/`-separated, no `.`/`..` components, never absolute, never empty.
pub fn normalize_rel_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::Other(format!("path is not valid UTF-8: {}", path.display()))
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Other(format!(
                    "path escapes the backup root: {}",
                    path.display()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::Other("empty path".to_string()));
    }
    Ok(parts.join("/"))
}

/// Checks that a manifest key read back from an archive is already normalized.
pub fn is_normalized(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains('\\')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_FULL_EVERY: u32 = 7;

/// Per-backup-set settings persisted in the local state directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub version: u32,
    pub id: String,
    pub full_every: u32,
    pub compression: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,
    pub memory: u32,
    pub parallelism: u32,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Cheap parameters for tests and throwaway sets.
    pub fn interactive() -> Self {
        Self {
            iterations: 1,
            memory: 8 * 1024,
            parallelism: 1,
            ..Self::default()
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            full_every: DEFAULT_FULL_EVERY,
            compression: true,
            created_at: chrono::Utc::now(),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        use rand::RngCore;
        let mut salt = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);

        Self {
            algorithm: "argon2id".to_string(),
            iterations: 3,
            memory: 65536,
            parallelism: 4,
            salt,
        }
    }
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path(Path::new("a/./b/c.txt")).unwrap(), "a/b/c.txt");
        assert!(normalize_rel_path(Path::new("../etc/passwd")).is_err());
        assert!(normalize_rel_path(Path::new("/etc/passwd")).is_err());
        assert!(normalize_rel_path(Path::new(".")).is_err());
    }

    #[test]
    fn test_is_normalized() {
        assert!(is_normalized("a/b.txt"));
        assert!(!is_normalized("a//b"));
        assert!(!is_normalized("a/../b"));
        assert!(!is_normalized("/a"));
        assert!(!is_normalized(""));
    }

    #[test]
    fn test_same_state_ignores_mtime() {
        let a = FileRecord {
            path: "x".into(),
            kind: FileKind::File,
            mode: 0o644,
            size: 5,
            mtime: 10,
            fingerprint: Some(ContentHash::from_data(b"hello")),
            link_target: None,
        };
        let mut b = a.clone();
        b.mtime = 99;
        assert!(a.same_state(&b));

        b.mode = 0o600;
        assert!(!a.same_state(&b));
    }

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::from_data(b"cairn");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!("zz".parse::<ContentHash>().is_err());
    }
}
