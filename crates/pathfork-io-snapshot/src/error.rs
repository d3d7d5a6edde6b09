use thiserror::Error;

use crate::device::DeviceId;

pub type Result<T> = std::result::Result<T, StateError>;

/// Errors raised while producing or consuming a register blob.
///
/// Most of these indicate that a device's `save` and `restore` callbacks disagree about the
/// fields they write. Continuing after such a mismatch would silently desynchronize guest-visible
/// device state, so [`StateError::is_fatal`] reports them as fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("out of memory growing register blob to {requested} bytes")]
    AllocationFailure { requested: usize },

    #[error("buffer underrun: requested {requested} bytes, {remaining} remaining")]
    BufferUnderrun { requested: usize, remaining: usize },

    #[error(
        "buffer overrun in {device} section: requested {requested} bytes, {remaining} remaining"
    )]
    BufferOverrun {
        device: DeviceId,
        requested: usize,
        remaining: usize,
    },

    #[error("{device} section length mismatch (expected {expected} bytes, consumed {consumed})")]
    SectionLengthMismatch {
        device: DeviceId,
        expected: usize,
        consumed: usize,
    },

    #[error("unexpected section: expected {expected}, found {found}")]
    UnknownSection { expected: DeviceId, found: DeviceId },

    #[error("register blob has {remaining} trailing bytes after the last device section")]
    TruncatedBlob { remaining: usize },

    #[error("device {0} registered twice with different callbacks")]
    DuplicateRegistration(DeviceId),

    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),

    #[error("device {device} failed: {message}")]
    Device { device: DeviceId, message: String },
}

impl StateError {
    /// Whether the error leaves device state in a condition no path can continue from.
    ///
    /// Only a failure reported by a device callback itself is left to the caller's judgement.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StateError::Device { .. })
    }
}
