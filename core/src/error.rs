use crate::SnapshotId;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cannot scan {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Local storage failure while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed archive ({context}): {reason}")]
    Format { context: String, reason: String },

    #[error("Authentication failed for {context}: data was tampered with, truncated or sealed under another key")]
    Auth { context: String },

    #[error("Snapshot chain is broken: {reason}")]
    Chain { reason: String },

    #[error("Snapshot {snapshot} is unreachable: blob {blob_id} could not be fetched: {reason}")]
    Unreachable {
        snapshot: SnapshotId,
        blob_id: String,
        reason: String,
    },

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: SnapshotId },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], used for reporting and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Scan,
    Storage,
    Format,
    Auth,
    Chain,
    Transport,
    Other,
}

impl Error {
    pub fn fault(&self) -> Fault {
        match self {
            Error::Scan { .. } => Fault::Scan,
            Error::Io(_) | Error::Serialization(_) | Error::Storage { .. } => Fault::Storage,
            Error::Format { .. } => Fault::Format,
            Error::Auth { .. } | Error::InvalidPassword => Fault::Auth,
            Error::Chain { .. } | Error::SnapshotNotFound { .. } => Fault::Chain,
            Error::Backend(_) | Error::Unreachable { .. } => Fault::Transport,
            Error::RepositoryNotFound { .. }
            | Error::RepositoryExists { .. }
            | Error::InvalidFormatVersion { .. }
            | Error::LockConflict(_)
            | Error::Other(_) => Fault::Other,
        }
    }

    pub(crate) fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Storage {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn format(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Format {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn chain(reason: impl Into<String>) -> Self {
        Error::Chain {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert_eq!(Error::InvalidPassword.fault(), Fault::Auth);
        assert_eq!(Error::format("blob x", "bad magic").fault(), Fault::Format);
        assert_eq!(Error::chain("missing parent").fault(), Fault::Chain);
        assert_eq!(Error::Backend("503".into()).fault(), Fault::Transport);

        let err = Error::Unreachable {
            snapshot: SnapshotId(3),
            blob_id: "data/3".into(),
            reason: "not found".into(),
        };
        assert_eq!(err.fault(), Fault::Transport);
        assert!(err.to_string().contains("Snapshot 3"));
    }
}
