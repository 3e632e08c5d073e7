use crate::diff::ChangeStats;
use crate::{Error, Result, SnapshotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// The archive holds the whole manifest; restore can start here.
    Full,
    /// The archive holds only the delta against the parent.
    Incremental,
}

/// One entry of the chain index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub parent: Option<SnapshotId>,
    pub kind: SnapshotKind,
    pub time: DateTime<Utc>,
    pub blob_id: String,
    pub key_id: String,
    pub hostname: String,
    pub source: PathBuf,
    #[serde(default)]
    pub stats: ChangeStats,
}

impl Snapshot {
    pub fn new(
        id: SnapshotId,
        parent: Option<SnapshotId>,
        kind: SnapshotKind,
        key_id: impl Into<String>,
        source: PathBuf,
    ) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            id,
            parent,
            kind,
            time: Utc::now(),
            blob_id: blob_id_for(id),
            key_id: key_id.into(),
            hostname,
            source,
            stats: ChangeStats::default(),
        }
    }

    pub fn with_stats(mut self, stats: ChangeStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn is_full(&self) -> bool {
        self.kind == SnapshotKind::Full
    }

    pub fn summary(&self) -> String {
        format!(
            "#{} ({}) {} on {} at {}",
            self.id,
            match self.kind {
                SnapshotKind::Full => "full",
                SnapshotKind::Incremental => "incremental",
            },
            self.source.display(),
            self.hostname,
            self.time.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Remote name of a snapshot's archive. The random suffix keeps a retried
/// snapshot id from colliding with a blob left behind by a cancelled run.
pub fn blob_id_for(id: SnapshotId) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{:010}-{}", BLOB_PREFIX, id.0, &suffix[..12])
}

pub const BLOB_PREFIX: &str = "data/";

/// The parent-linked list of snapshots of one backup set, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChain {
    snapshots: Vec<Snapshot>,
}

impl SnapshotChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a chain from index entries, rejecting any entry that could
    /// not have been appended in that order.
    pub fn from_snapshots(snapshots: Vec<Snapshot>) -> Result<Self> {
        let mut chain = Self::new();
        for snapshot in snapshots {
            chain.append(snapshot)?;
        }
        Ok(chain)
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn get(&self, id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots
            .binary_search_by_key(&id, |s| s.id)
            .ok()
            .map(|idx| &self.snapshots[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Id for a new snapshot on top of `parent`: above both the parent and
    /// every id this chain has ever handed out.
    pub fn next_id(&self, parent: Option<SnapshotId>) -> SnapshotId {
        let floor = self
            .latest()
            .map(|s| s.id.next())
            .unwrap_or(SnapshotId::GENESIS);
        match parent {
            Some(parent) => floor.max(parent.next()),
            None => floor,
        }
    }

    /// Every `full_every`-th snapshot is full, which caps how many archives a
    /// restore has to replay.
    pub fn next_kind(&self, parent: Option<SnapshotId>, full_every: u32) -> Result<SnapshotKind> {
        let Some(parent) = parent else {
            return Ok(SnapshotKind::Full);
        };
        if full_every <= 1 {
            return Ok(SnapshotKind::Full);
        }
        let run = self.resolve_chain(parent)?.len() as u32;
        if run >= full_every {
            Ok(SnapshotKind::Full)
        } else {
            Ok(SnapshotKind::Incremental)
        }
    }

    /// Snapshots needed to rebuild `target`, from its nearest full ancestor up
    /// to and including `target`.
    pub fn resolve_chain(&self, target: SnapshotId) -> Result<Vec<&Snapshot>> {
        let mut current = self
            .get(target)
            .ok_or(Error::SnapshotNotFound { id: target })?;
        let mut chain = vec![current];

        while !current.is_full() {
            let parent_id = current.parent.ok_or_else(|| {
                Error::chain(format!(
                    "incremental snapshot {} has no parent",
                    current.id
                ))
            })?;
            if parent_id >= current.id {
                return Err(Error::chain(format!(
                    "snapshot {} names parent {} which is not older",
                    current.id, parent_id
                )));
            }
            current = self.get(parent_id).ok_or_else(|| {
                Error::chain(format!(
                    "snapshot {} references parent {} which is not in the local index",
                    current.id, parent_id
                ))
            })?;
            chain.push(current);
        }

        chain.reverse();
        Ok(chain)
    }

    pub fn check_append(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(last) = self.latest() {
            if snapshot.id <= last.id {
                return Err(Error::chain(format!(
                    "snapshot id {} does not follow {}",
                    snapshot.id, last.id
                )));
            }
        }
        match snapshot.parent {
            Some(parent) => {
                if parent >= snapshot.id {
                    return Err(Error::chain(format!(
                        "snapshot {} names parent {} which is not older",
                        snapshot.id, parent
                    )));
                }
                if self.get(parent).is_none() {
                    return Err(Error::chain(format!(
                        "snapshot {} references parent {} which is not in the local index",
                        snapshot.id, parent
                    )));
                }
            }
            None if !snapshot.is_full() => {
                return Err(Error::chain(format!(
                    "incremental snapshot {} has no parent",
                    snapshot.id
                )));
            }
            None => {}
        }
        Ok(())
    }

    pub fn append(&mut self, snapshot: Snapshot) -> Result<()> {
        self.check_append(&snapshot)?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// One JSON object per line, oldest first.
    pub fn to_jsonl(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for snapshot in &self.snapshots {
            serde_json::to_writer(&mut out, snapshot)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    pub fn from_jsonl(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| Error::chain(format!("chain index is not UTF-8: {}", e)))?;
        let mut snapshots = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let snapshot: Snapshot = serde_json::from_str(line).map_err(|e| {
                Error::chain(format!("chain index line {} is malformed: {}", lineno + 1, e))
            })?;
            snapshots.push(snapshot);
        }
        Self::from_snapshots(snapshots)
    }
}
