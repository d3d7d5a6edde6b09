//! Per-path device snapshots for a forking execution engine.
//!
//! A [`DeviceStateEngine`] owns the device registry and the block lineage. Each execution path
//! holds a [`DeviceStateSnapshot`]: a register blob saved from the live devices plus a node in the
//! copy-on-write disk lineage. Forking a snapshot copies the blob and adds two lineage children;
//! sector data is never copied.

#![forbid(unsafe_code)]

mod config;
mod engine;
mod error;
mod snapshot;

pub use config::EngineConfig;
pub use engine::DeviceStateEngine;
pub use error::{Result, SnapshotError};
pub use snapshot::{DeviceStateSnapshot, SnapshotId, SnapshotState};
