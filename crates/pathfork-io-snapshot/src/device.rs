use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use crate::stream::SnapshotStream;

/// Stable identity of a device type or device instance.
///
/// `kind` is a four character code (e.g. `*b"UART"`); `instance` distinguishes multiple devices
/// of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub kind: [u8; 4],
    pub instance: u16,
}

impl DeviceId {
    pub const fn new(kind: [u8; 4], instance: u16) -> Self {
        Self { kind, instance }
    }

    /// Identity for a singleton device.
    pub const fn singleton(kind: [u8; 4]) -> Self {
        Self::new(kind, 0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.kind {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        write!(f, "#{}", self.instance)
    }
}

/// Save/restore contract for an emulated device.
///
/// `restore` must read exactly the fields `save` wrote, in the same order. The registry frames
/// each device's bytes, so a mismatch is detected rather than bleeding into the next device.
pub trait SnapshotDevice {
    fn save(&self, stream: &mut SnapshotStream) -> Result<()>;
    fn restore(&mut self, stream: &mut SnapshotStream) -> Result<()>;
}

/// Shared handle to a live device object.
pub type DeviceHandle = Rc<RefCell<dyn SnapshotDevice>>;
