//! Copy-on-write sector storage for forked execution paths.
//!
//! Disk images attached to emulated block devices can be gigabytes, while paths fork from a
//! common ancestor far more often than they diverge. This crate keeps only the sectors a path has
//! written, in a tree of overlays over the shared base images:
//!
//! - [`BaseImage`]: read-only sector source backing the root of every lineage tree
//! - [`BlockLineage`]: arena of lineage nodes with O(1) fork and upward-propagating release
//! - [`DiskHandle`]: opaque device handle issued when a disk is attached

#![forbid(unsafe_code)]

mod error;
mod image;
mod lineage;

pub use error::{DiskError, Result};
pub use image::{BaseImage, FileImage, MemImage, ZeroImage};
pub use lineage::{BlockLineage, DiskHandle, LineageId, LineageStats};

/// Size of one addressable sector in bytes.
pub const SECTOR_SIZE: usize = 512;

#[cfg(test)]
mod proptests;
