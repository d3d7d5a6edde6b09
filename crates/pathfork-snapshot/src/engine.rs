use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use pathfork_io_snapshot::{DeviceHandle, DeviceId, DeviceRegistry, SnapshotStream};
use pathfork_storage::{BaseImage, BlockLineage, DiskError, DiskHandle, LineageId, LineageStats};

use crate::config::EngineConfig;
use crate::error::{Result, SnapshotError};
use crate::snapshot::{DeviceStateSnapshot, SnapshotId};

/// State shared by the engine and every snapshot it hands out.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: RefCell<DeviceRegistry>,
    lineage: RefCell<BlockLineage>,
    /// Nodes of snapshots dropped while the lineage was borrowed. Released on the next access.
    pending_releases: RefCell<Vec<LineageId>>,
    images: RefCell<HashMap<DiskHandle, Box<dyn BaseImage>>>,
    active: Cell<Option<SnapshotId>>,
    next_id: Cell<u64>,
    root_created: Cell<bool>,
}

impl EngineShared {
    pub(crate) fn allocate_id(&self) -> SnapshotId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        SnapshotId::new(id)
    }

    pub(crate) fn active(&self) -> Option<SnapshotId> {
        self.active.get()
    }

    pub(crate) fn set_active(&self, id: Option<SnapshotId>) {
        let previous = self.active.replace(id);
        if previous != id {
            tracing::trace!(?previous, current = ?id, "active snapshot changed");
        }
    }

    pub(crate) fn clear_active_if(&self, id: SnapshotId) {
        if self.active.get() == Some(id) {
            self.set_active(None);
        }
    }

    pub(crate) fn lineage(&self) -> Ref<'_, BlockLineage> {
        if let Ok(mut lineage) = self.lineage.try_borrow_mut() {
            self.release_pending(&mut lineage);
        }
        self.lineage.borrow()
    }

    pub(crate) fn lineage_mut(&self) -> RefMut<'_, BlockLineage> {
        let mut lineage = self.lineage.borrow_mut();
        self.release_pending(&mut lineage);
        lineage
    }

    /// Drop `snapshot`'s reference to `node`, deferring it if the lineage is borrowed right now.
    pub(crate) fn release_node(&self, snapshot: SnapshotId, node: LineageId) {
        match self.lineage.try_borrow_mut() {
            Ok(mut lineage) => {
                self.release_pending(&mut lineage);
                if let Err(err) = lineage.release(node) {
                    tracing::warn!(%snapshot, %node, %err, "failed to release lineage node");
                }
            }
            Err(_) => {
                tracing::debug!(%snapshot, %node, "lineage busy; deferring node release");
                self.pending_releases.borrow_mut().push(node);
            }
        }
    }

    fn release_pending(&self, lineage: &mut BlockLineage) {
        let pending = self.pending_releases.take();
        for node in pending {
            match lineage.release(node) {
                Ok(()) => tracing::trace!(%node, "released deferred lineage node"),
                Err(err) => tracing::warn!(%node, %err, "failed to release lineage node"),
            }
        }
    }

    /// Read sector `index` of `disk` straight from its base image.
    pub(crate) fn read_base(
        &self,
        disk: DiskHandle,
        index: u64,
        buf: &mut [u8],
    ) -> pathfork_storage::Result<()> {
        let mut images = self.images.borrow_mut();
        let image = images
            .get_mut(&disk)
            .ok_or(DiskError::MissingDevice(disk))?;
        image.read_sector(index, buf)
    }
}

/// Owner of the device registry, the block lineage and the attached base images.
///
/// Exactly one snapshot at a time mirrors the live device state; see
/// [`DeviceStateEngine::active`]. The engine is single-threaded: snapshots share its state through
/// reference counting and must stay on the thread that created them.
pub struct DeviceStateEngine {
    shared: Rc<EngineShared>,
}

impl DeviceStateEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            preferred_state_size = config.preferred_state_size,
            shrink_stable_saves = config.shrink_stable_saves,
            max_fork_depth = ?config.max_fork_depth,
            "device state engine created"
        );
        Ok(Self {
            shared: Rc::new(EngineShared {
                config,
                registry: RefCell::new(DeviceRegistry::new()),
                lineage: RefCell::new(BlockLineage::new()),
                pending_releases: RefCell::new(Vec::new()),
                images: RefCell::new(HashMap::new()),
                active: Cell::new(None),
                next_id: Cell::new(0),
                root_created: Cell::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Run startup device registration. Later calls return `Ok(false)` without running `init`.
    pub fn init_devices<F>(&self, init: F) -> Result<bool>
    where
        F: FnOnce(&mut DeviceRegistry) -> pathfork_io_snapshot::Result<()>,
    {
        Ok(self.shared.registry.borrow_mut().init_once(init)?)
    }

    /// Register a device discovered after startup. It is appended to the save order.
    pub fn register_device(&self, id: DeviceId, device: DeviceHandle) -> Result<()> {
        Ok(self
            .shared
            .registry
            .borrow_mut()
            .register_device(id, device)?)
    }

    pub fn registry(&self) -> Ref<'_, DeviceRegistry> {
        self.shared.registry.borrow()
    }

    /// Attach a disk backed by `image`. Every snapshot sees it with no overrides.
    pub fn attach_disk(
        &self,
        name: impl Into<String>,
        image: Box<dyn BaseImage>,
    ) -> Result<DiskHandle> {
        let sector_count = image.sector_count();
        let disk = self
            .shared
            .lineage_mut()
            .attach_disk(name, sector_count)?;
        self.shared.images.borrow_mut().insert(disk, image);
        Ok(disk)
    }

    /// Detach `disk`, dropping its base image and every snapshot's overrides for it.
    pub fn detach_disk(&self, disk: DiskHandle) -> Result<()> {
        self.shared.lineage_mut().detach_disk(disk)?;
        self.shared.images.borrow_mut().remove(&disk);
        Ok(())
    }

    pub fn disk_sector_count(&self, disk: DiskHandle) -> Result<u64> {
        Ok(self.shared.lineage().disk_sector_count(disk)?)
    }

    /// Create the root snapshot for the machine's initial path.
    ///
    /// The root mirrors the live devices from the start, so it is returned active. Its register
    /// blob stays empty until the first save; restoring it before then leaves the devices as they
    /// are. Only one root can ever be created per engine.
    pub fn root_snapshot(&self) -> Result<DeviceStateSnapshot> {
        if !self.shared.registry.borrow().is_initialized() {
            return Err(SnapshotError::RegistryNotInitialized);
        }
        if self.shared.root_created.get() {
            return Err(SnapshotError::RootExists);
        }

        let blob = SnapshotStream::with_capacity(self.shared.config.preferred_state_size)?;
        let node = self.shared.lineage_mut().create_root()?;
        self.shared.root_created.set(true);

        let root = DeviceStateSnapshot::new(Rc::clone(&self.shared), blob, node);
        self.shared.set_active(Some(root.id()));
        tracing::debug!(snapshot = %root.id(), node = %node, "created root snapshot");
        Ok(root)
    }

    /// The snapshot whose register blob currently mirrors the live devices, if any.
    pub fn active(&self) -> Option<SnapshotId> {
        self.shared.active()
    }

    pub fn lineage_stats(&self) -> LineageStats {
        self.shared.lineage().stats()
    }
}

impl std::fmt::Debug for DeviceStateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStateEngine")
            .field("config", &self.shared.config)
            .field("devices", &self.shared.registry.borrow().len())
            .field("active", &self.shared.active())
            .field("lineage", &self.shared.lineage().stats())
            .finish()
    }
}
