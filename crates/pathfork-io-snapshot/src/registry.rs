use std::collections::HashMap;
use std::rc::Rc;

use crate::device::{DeviceHandle, DeviceId};
use crate::error::{Result, StateError};
use crate::stream::SnapshotStream;

/// One registered device: its identity plus the live object implementing save/restore.
pub struct DeviceDescriptor {
    id: DeviceId,
    device: DeviceHandle,
    custom: bool,
    /// Framed section captured when a custom device was registered. Blobs saved before that
    /// point have no section for the device and restore it from here.
    registration_state: Option<SnapshotStream>,
}

impl DeviceDescriptor {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Whether the device was discovered after startup registration.
    pub fn is_custom(&self) -> bool {
        self.custom
    }
}

/// Ordered table of snapshot-capable devices.
///
/// Registration order is the implicit schema of every register blob: save and restore both walk
/// the descriptors in that order. Devices known at machine construction are registered once via
/// [`DeviceRegistry::init_once`]; devices discovered later are appended to the end.
#[derive(Default)]
pub struct DeviceRegistry {
    descriptors: Vec<DeviceDescriptor>,
    index: HashMap<DeviceId, usize>,
    initialized: bool,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under `id`.
    ///
    /// Registering the same device object under the same identity again is a no-op; registering a
    /// different object under an existing identity fails with
    /// [`StateError::DuplicateRegistration`].
    pub fn register_device(&mut self, id: DeviceId, device: DeviceHandle) -> Result<()> {
        if let Some(&idx) = self.index.get(&id) {
            let existing = &self.descriptors[idx].device;
            if std::ptr::addr_eq(Rc::as_ptr(existing), Rc::as_ptr(&device)) {
                tracing::trace!(device = %id, "device already registered");
                return Ok(());
            }
            return Err(StateError::DuplicateRegistration(id));
        }

        let custom = self.initialized;
        let registration_state = if custom {
            let mut state = SnapshotStream::new();
            save_section(id, &device, &mut state)?;
            tracing::debug!(
                device = %id,
                position = self.descriptors.len(),
                state_len = state.len(),
                "registered custom device"
            );
            Some(state)
        } else {
            None
        };
        self.index.insert(id, self.descriptors.len());
        self.descriptors.push(DeviceDescriptor {
            id,
            device,
            custom,
            registration_state,
        });
        Ok(())
    }

    /// Run startup registration exactly once.
    ///
    /// Returns `Ok(true)` if `init` ran, `Ok(false)` if the registry was already initialized. A
    /// failing `init` leaves the registry uninitialized.
    pub fn init_once<F>(&mut self, init: F) -> Result<bool>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.initialized {
            return Ok(false);
        }
        init(self)?;
        self.initialized = true;
        tracing::debug!(devices = self.descriptors.len(), "device registry initialized");
        Ok(true)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn is_custom(&self, id: DeviceId) -> bool {
        self.index
            .get(&id)
            .is_some_and(|&idx| self.descriptors[idx].custom)
    }

    /// Identities in registration order.
    pub fn ids(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.descriptors.iter().map(|d| d.id)
    }

    /// Visit every descriptor in registration order, stopping at the first error.
    pub fn for_each_in_order<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(&DeviceDescriptor) -> Result<()>,
    {
        self.descriptors.iter().try_for_each(visitor)
    }

    /// Serialize every device at the stream cursor, one framed section per device.
    pub fn save_devices(&self, stream: &mut SnapshotStream) -> Result<()> {
        self.for_each_in_order(|desc| save_section(desc.id, &desc.device, stream))
    }

    /// Push every device section back into the live device objects, in registration order.
    ///
    /// Each device is confined to its own section and must consume it exactly. Bytes left after
    /// the last section mean the blob was produced under a different registration order.
    ///
    /// A blob saved before a custom device was registered simply ends early; such trailing custom
    /// devices are reset to the state they had when they were registered.
    pub fn restore_devices(&self, stream: &mut SnapshotStream) -> Result<()> {
        self.for_each_in_order(|desc| match &desc.registration_state {
            Some(state) if stream.remaining() == 0 => {
                tracing::trace!(device = %desc.id, "restoring custom device from registration state");
                let mut state = state.try_clone()?;
                restore_section(desc.id, &desc.device, &mut state)
            }
            _ => restore_section(desc.id, &desc.device, stream),
        })?;

        match stream.remaining() {
            0 => Ok(()),
            remaining => Err(StateError::TruncatedBlob { remaining }),
        }
    }
}

fn save_section(id: DeviceId, device: &DeviceHandle, stream: &mut SnapshotStream) -> Result<()> {
    let device = device.try_borrow().map_err(|_| StateError::Device {
        device: id,
        message: "device is mutably borrowed".to_string(),
    })?;
    let payload_start = stream.begin_section(id)?;
    device.save(stream)?;
    stream.end_section(payload_start)
}

fn restore_section(id: DeviceId, device: &DeviceHandle, stream: &mut SnapshotStream) -> Result<()> {
    let mut device = device.try_borrow_mut().map_err(|_| StateError::Device {
        device: id,
        message: "device is already borrowed".to_string(),
    })?;
    stream.enter_section(id)?;
    let restored = device.restore(stream);
    let left = stream.leave_section();
    restored?;
    left
}
