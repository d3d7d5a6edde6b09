use std::fmt;
use std::rc::Rc;

use pathfork_io_snapshot::SnapshotStream;
use pathfork_storage::{DiskHandle, LineageId, SECTOR_SIZE};

use crate::engine::EngineShared;
use crate::error::{Result, SnapshotError};

/// Engine-unique snapshot identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    /// Produced by a fork and not yet restored.
    Created,
    /// Mirrors the live devices.
    Active,
    /// Restored at some point, but another snapshot is active now.
    Suspended,
    /// Forked; read-only until destroyed.
    Frozen,
}

/// Saved device state of one execution path: a register blob plus a node in the block lineage.
///
/// Dropping a snapshot destroys it: its lineage reference is released, and ancestors that no
/// longer have any descendants are freed along with their sector overrides.
pub struct DeviceStateSnapshot {
    id: SnapshotId,
    blob: SnapshotStream,
    node: LineageId,
    frozen: bool,
    restored: bool,
    last_saved_len: Option<usize>,
    stable_saves: u32,
    shared: Rc<EngineShared>,
}

impl DeviceStateSnapshot {
    pub(crate) fn new(shared: Rc<EngineShared>, blob: SnapshotStream, node: LineageId) -> Self {
        Self {
            id: shared.allocate_id(),
            blob,
            node,
            frozen: false,
            restored: false,
            last_saved_len: None,
            stable_saves: 0,
            shared,
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn state(&self) -> SnapshotState {
        if self.frozen {
            SnapshotState::Frozen
        } else if self.is_active() {
            SnapshotState::Active
        } else if self.restored {
            SnapshotState::Suspended
        } else {
            SnapshotState::Created
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active() == Some(self.id)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn lineage_node(&self) -> LineageId {
        self.node
    }

    pub fn depth(&self) -> Result<u32> {
        Ok(self.shared.lineage().depth(self.node)?)
    }

    /// The serialized register state as of the last save (or the fork it was copied from).
    pub fn register_blob(&self) -> &[u8] {
        self.blob.as_bytes()
    }

    pub fn blob_capacity(&self) -> usize {
        self.blob.capacity()
    }

    /// Serialize every registered device into this snapshot's register blob.
    ///
    /// The snapshot must be the active one: saving any other snapshot would overwrite its state
    /// with another path's devices.
    pub fn save_device_state(&mut self) -> Result<()> {
        if self.frozen {
            return Err(SnapshotError::Frozen(self.id));
        }
        if !self.is_active() {
            return Err(SnapshotError::NotActive(self.id));
        }

        let registry = self.shared.registry.borrow();
        self.blob.reset();
        registry.save_devices(&mut self.blob)?;
        self.blob.truncate_at_cursor();
        drop(registry);

        self.note_saved_len();
        tracing::trace!(snapshot = %self.id, len = self.blob.len(), "saved device state");
        Ok(())
    }

    /// Push this snapshot's register blob into the live devices and make it the active snapshot.
    ///
    /// On failure the live devices are partially overwritten and no snapshot is active.
    ///
    /// Restoring the active snapshot before it was ever saved is a no-op: the live devices
    /// already hold its state.
    pub fn restore_device_state(&mut self) -> Result<()> {
        if self.frozen {
            return Err(SnapshotError::Frozen(self.id));
        }
        if self.blob.is_empty() && self.is_active() {
            tracing::trace!(snapshot = %self.id, "active snapshot never saved; nothing to restore");
            return Ok(());
        }

        let registry = self.shared.registry.borrow();
        self.blob.reset();
        let restored = registry.restore_devices(&mut self.blob);
        drop(registry);

        if let Err(err) = restored {
            self.shared.set_active(None);
            tracing::warn!(snapshot = %self.id, %err, "device state restore failed");
            return Err(err.into());
        }

        self.restored = true;
        self.shared.set_active(Some(self.id));
        tracing::trace!(snapshot = %self.id, len = self.blob.len(), "restored device state");
        Ok(())
    }

    /// Split this path in two.
    ///
    /// Each child gets its own copy of the register blob and a fresh lineage node whose parent is
    /// this snapshot's node; no sector data is copied. This snapshot becomes frozen and, if it was
    /// active, stops being active: the caller restores whichever child runs next.
    pub fn fork(&mut self) -> Result<(DeviceStateSnapshot, DeviceStateSnapshot)> {
        if self.frozen {
            return Err(SnapshotError::Frozen(self.id));
        }
        if let Some(limit) = self.shared.config.max_fork_depth {
            let depth = self.depth()? + 1;
            if depth > limit {
                return Err(SnapshotError::DepthLimit { depth, limit });
            }
        }

        let left_blob = self.blob.try_clone()?;
        let right_blob = self.blob.try_clone()?;
        let (left_node, right_node) = self.shared.lineage_mut().fork(self.node)?;

        self.frozen = true;
        self.shared.clear_active_if(self.id);

        let left = Self::new(Rc::clone(&self.shared), left_blob, left_node);
        let right = Self::new(Rc::clone(&self.shared), right_blob, right_node);
        tracing::debug!(
            snapshot = %self.id,
            left = %left.id,
            right = %right.id,
            blob_len = self.blob.len(),
            "forked snapshot"
        );
        Ok((left, right))
    }

    /// Destroy the snapshot. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self);
    }

    /// Store one sector in this path's overlay.
    pub fn write_sector(&mut self, disk: DiskHandle, index: u64, data: &[u8]) -> Result<()> {
        if self.frozen {
            return Err(SnapshotError::Frozen(self.id));
        }
        Ok(self
            .shared
            .lineage_mut()
            .write_sector(self.node, disk, index, data)?)
    }

    pub fn write_sectors(&mut self, disk: DiskHandle, first: u64, data: &[u8]) -> Result<()> {
        if self.frozen {
            return Err(SnapshotError::Frozen(self.id));
        }
        Ok(self
            .shared
            .lineage_mut()
            .write_sectors(self.node, disk, first, data)?)
    }

    /// Read one sector as this path sees it; `fallback` supplies sectors no ancestor overrides.
    pub fn read_sector<F>(&self, disk: DiskHandle, index: u64, fallback: F) -> Result<Vec<u8>>
    where
        F: FnOnce(DiskHandle, u64, &mut [u8]) -> pathfork_storage::Result<()>,
    {
        let mut buf = vec![0u8; SECTOR_SIZE];
        self.read_sector_into(disk, index, &mut buf, fallback)?;
        Ok(buf)
    }

    pub fn read_sector_into<F>(
        &self,
        disk: DiskHandle,
        index: u64,
        buf: &mut [u8],
        fallback: F,
    ) -> Result<()>
    where
        F: FnOnce(DiskHandle, u64, &mut [u8]) -> pathfork_storage::Result<()>,
    {
        Ok(self
            .shared
            .lineage()
            .read_sector(self.node, disk, index, buf, fallback)?)
    }

    /// Read one sector, falling back to the base image the disk was attached with.
    pub fn read_sector_from_base(&self, disk: DiskHandle, index: u64) -> Result<Vec<u8>> {
        let shared = &self.shared;
        self.read_sector(disk, index, |disk, index, buf| {
            shared.read_base(disk, index, buf)
        })
    }

    pub fn read_sectors_from_base(
        &self,
        disk: DiskHandle,
        first: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let shared = &self.shared;
        Ok(self.shared.lineage().read_sectors(
            self.node,
            disk,
            first,
            buf,
            |disk, index, buf| shared.read_base(disk, index, buf),
        )?)
    }

    /// Whether `disk` can bypass the overlay path for this snapshot's reads. See
    /// [`pathfork_storage::BlockLineage::can_transfer_sector`].
    pub fn can_transfer_sector(&self, disk: DiskHandle) -> bool {
        self.shared
            .lineage()
            .can_transfer_sector(self.node, disk)
    }

    fn note_saved_len(&mut self) {
        let len = self.blob.len();
        if self.last_saved_len == Some(len) {
            self.stable_saves = self.stable_saves.saturating_add(1);
        } else {
            self.last_saved_len = Some(len);
            self.stable_saves = 0;
        }

        let threshold = self.shared.config.shrink_stable_saves;
        if threshold == 0 || self.stable_saves < threshold {
            return;
        }
        let floor = len.max(self.shared.config.preferred_state_size);
        if self.blob.capacity() > floor {
            let before = self.blob.capacity();
            self.blob.shrink(floor);
            tracing::trace!(
                snapshot = %self.id,
                before,
                after = self.blob.capacity(),
                "shrank register blob"
            );
        }
    }
}

impl Drop for DeviceStateSnapshot {
    fn drop(&mut self) {
        self.shared.clear_active_if(self.id);
        self.shared.release_node(self.id, self.node);
        tracing::trace!(snapshot = %self.id, "destroyed snapshot");
    }
}

impl fmt::Debug for DeviceStateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStateSnapshot")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("node", &self.node)
            .field("blob_len", &self.blob.len())
            .finish()
    }
}
