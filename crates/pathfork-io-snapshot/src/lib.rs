//! Register-state serialization for emulated devices.
//!
//! Every execution path keeps the register state of all live devices as a flat byte blob. This
//! crate provides the pieces needed to produce and consume that blob:
//!
//! - [`SnapshotStream`]: growable byte buffer with a single cursor and typed put/get helpers
//! - [`SnapshotDevice`]: save/restore contract implemented by each device model
//! - [`DeviceRegistry`]: ordered table of devices; its registration order is the blob schema
//!
//! The blob is only meaningful inside the process that produced it. There is no on-disk format
//! and no versioning.

#![forbid(unsafe_code)]

mod device;
mod error;
mod registry;
mod stream;

pub use device::{DeviceHandle, DeviceId, SnapshotDevice};
pub use error::{Result, StateError};
pub use registry::{DeviceDescriptor, DeviceRegistry};
pub use stream::SnapshotStream;
