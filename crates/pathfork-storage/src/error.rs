use thiserror::Error;

use crate::lineage::{DiskHandle, LineageId};

pub type Result<T> = std::result::Result<T, DiskError>;

/// Errors raised by sector I/O and lineage bookkeeping.
///
/// [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error` so base image
/// implementations that are not backed by the host filesystem can report failures too.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiskError {
    #[error("no disk attached as {0}")]
    MissingDevice(DiskHandle),

    #[error("sector {index} out of bounds for {device} ({sector_count} sectors)")]
    OutOfBounds {
        device: DiskHandle,
        index: u64,
        sector_count: u64,
    },

    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("lineage node {0} has been released")]
    StaleNode(LineageId),

    #[error("lineage node {0} has children and is read-only")]
    FrozenNode(LineageId),

    #[error("lineage reference count overflow")]
    RefcountOverflow,

    #[error("out of memory allocating {requested} bytes")]
    AllocationFailure { requested: usize },

    #[error("io error: {0}")]
    Io(String),
}

impl DiskError {
    /// Whether higher-level storage logic can react to the error (e.g. report unavailable media)
    /// without tearing down the engine.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DiskError::MissingDevice(_)
                | DiskError::OutOfBounds { .. }
                | DiskError::UnalignedLength { .. }
                | DiskError::Io(_)
        )
    }
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}
