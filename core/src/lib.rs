pub mod archive;
pub mod backend;
pub mod crypto;
pub mod diff;
pub mod error;
pub mod lock;
pub mod manifest;
pub mod repository;
pub mod restore;
pub mod scan;
pub mod snapshot;
pub mod types;

pub use backend::{Backend, BackendType, MemoryBackend};
pub use error::{Error, Fault, Result};
pub use manifest::Manifest;
pub use repository::Repository;
pub use snapshot::{Snapshot, SnapshotKind};
pub use types::*;
