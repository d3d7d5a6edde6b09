use pathfork_io_snapshot::StateError;
use pathfork_storage::DiskError;
use thiserror::Error;

use crate::snapshot::SnapshotId;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("snapshot {0} does not mirror live device state")]
    NotActive(SnapshotId),

    #[error("snapshot {0} has been forked and is read-only")]
    Frozen(SnapshotId),

    #[error("root snapshot already created")]
    RootExists,

    #[error("device registry has not been initialized")]
    RegistryNotInitialized,

    #[error("fork depth {depth} exceeds the configured limit of {limit}")]
    DepthLimit { depth: u32, limit: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SnapshotError {
    /// Whether the whole engine must stop.
    ///
    /// Register-blob corruption and allocation failures threaten state shared through the lineage
    /// tree. Sector I/O failures the storage layer can react to, and lifecycle misuse of a single
    /// snapshot, are left to the caller.
    pub fn is_fatal(&self) -> bool {
        match self {
            SnapshotError::State(err) => err.is_fatal(),
            SnapshotError::Disk(err) => !err.is_recoverable(),
            SnapshotError::NotActive(_)
            | SnapshotError::Frozen(_)
            | SnapshotError::RootExists
            | SnapshotError::RegistryNotInitialized
            | SnapshotError::DepthLimit { .. } => false,
            SnapshotError::InvalidConfig(_) => true,
        }
    }
}
