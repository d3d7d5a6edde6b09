use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;

use crate::{DiskError, Result, SECTOR_SIZE};

/// Opaque handle for an attached block device.
///
/// Handles are issued by [`BlockLineage::attach_disk`] and never reused, so a handle that outlives
/// its disk fails with [`DiskError::MissingDevice`] instead of aliasing a newer disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskHandle(u32);

impl DiskHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DiskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk{}", self.0)
    }
}

/// Stable address of a node in the lineage arena.
///
/// The generation makes ids of released nodes detectably stale once their slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineageId {
    index: u32,
    generation: u32,
}

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}.{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LineageStats {
    pub live_nodes: usize,
    pub overlay_sectors: u64,
    pub overlay_bytes: u64,
    pub forks: u64,
    pub released_nodes: u64,
}

type Sector = Box<[u8; SECTOR_SIZE]>;

struct LineageNode {
    parent: Option<LineageId>,
    /// Sectors written on this node's path since it was forked, per disk.
    overlay: HashMap<DiskHandle, HashMap<u64, Sector>>,
    /// Owning snapshot plus one per child node.
    refcount: u32,
    depth: u32,
    /// Set once the node has children; its overlay is read-only from then on.
    frozen: bool,
}

impl LineageNode {
    fn new(parent: Option<LineageId>, depth: u32) -> Self {
        Self {
            parent,
            overlay: HashMap::new(),
            refcount: 1,
            depth,
            frozen: false,
        }
    }

    fn overlay_sectors(&self) -> usize {
        self.overlay.values().map(HashMap::len).sum()
    }
}

struct Slot {
    generation: u32,
    node: Option<LineageNode>,
}

struct AttachedDisk {
    name: String,
    sector_count: u64,
}

/// Copy-on-write tree of per-path sector overlays over the attached base images.
///
/// Every node holds only the sectors written on its own path. Reads walk from a node towards the
/// root and fall back to the base image; forking creates two empty children in O(1) regardless
/// of disk or overlay size. Nodes live in an arena addressed by [`LineageId`] and are reference
/// counted: the owning snapshot holds one reference and each child holds one on its parent.
#[derive(Default)]
pub struct BlockLineage {
    slots: Vec<Slot>,
    free: Vec<u32>,
    disks: Vec<Option<AttachedDisk>>,
    stats: LineageStats,
}

impl BlockLineage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> LineageStats {
        self.stats
    }

    /// Register a disk of `sector_count` sectors and issue its handle.
    pub fn attach_disk(
        &mut self,
        name: impl Into<String>,
        sector_count: u64,
    ) -> Result<DiskHandle> {
        let handle = u32::try_from(self.disks.len())
            .map(DiskHandle)
            .map_err(|_| DiskError::AllocationFailure {
                requested: self.disks.len() + 1,
            })?;
        let name = name.into();
        tracing::debug!(device = %handle, %name, sector_count, "attached disk");
        self.disks.push(Some(AttachedDisk { name, sector_count }));
        Ok(handle)
    }

    /// Detach a disk. Overlay sectors written for it are dropped from every node.
    pub fn detach_disk(&mut self, disk: DiskHandle) -> Result<()> {
        let attached = self
            .disks
            .get_mut(disk.index())
            .and_then(Option::take)
            .ok_or(DiskError::MissingDevice(disk))?;

        let mut dropped = 0u64;
        for node in self.slots.iter_mut().filter_map(|slot| slot.node.as_mut()) {
            if let Some(sectors) = node.overlay.remove(&disk) {
                dropped += sectors.len() as u64;
            }
        }
        self.stats.overlay_sectors -= dropped;
        self.stats.overlay_bytes -= dropped * SECTOR_SIZE as u64;

        tracing::debug!(device = %disk, name = %attached.name, dropped, "detached disk");
        Ok(())
    }

    pub fn disk_sector_count(&self, disk: DiskHandle) -> Result<u64> {
        self.disk(disk).map(|d| d.sector_count)
    }

    pub fn disk_name(&self, disk: DiskHandle) -> Option<&str> {
        self.disk(disk).ok().map(|d| d.name.as_str())
    }

    /// Create a parentless node whose reads fall straight through to the base images.
    pub fn create_root(&mut self) -> Result<LineageId> {
        self.ensure_free_slots(1)?;
        let id = self.insert(LineageNode::new(None, 0));
        tracing::debug!(node = %id, "created lineage root");
        Ok(id)
    }

    /// Fork `id` into two children with empty overlays.
    ///
    /// `id` gains one reference per child and becomes read-only. A caller that no longer needs
    /// `id` as its own node drops its reference with [`BlockLineage::release`].
    pub fn fork(&mut self, id: LineageId) -> Result<(LineageId, LineageId)> {
        self.ensure_free_slots(2)?;
        let depth = {
            let node = self.node_mut(id)?;
            node.refcount = node
                .refcount
                .checked_add(2)
                .ok_or(DiskError::RefcountOverflow)?;
            node.frozen = true;
            node.depth + 1
        };

        let left = self.insert(LineageNode::new(Some(id), depth));
        let right = self.insert(LineageNode::new(Some(id), depth));
        self.stats.forks += 1;

        tracing::debug!(parent = %id, %left, %right, depth, "forked lineage node");
        Ok((left, right))
    }

    /// Drop one reference to `id`.
    ///
    /// A node whose count reaches zero frees its overlay and releases the reference it holds on
    /// its parent, so release propagates upward through ancestors nobody else needs. It never
    /// propagates downward: a live node keeps its whole ancestor chain alive.
    pub fn release(&mut self, id: LineageId) -> Result<()> {
        self.node(id)?;

        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node_mut(id)?;
            debug_assert!(node.refcount > 0, "live node with zero refcount");
            node.refcount = node.refcount.saturating_sub(1);
            if node.refcount > 0 {
                break;
            }

            let slot = &mut self.slots[id.index as usize];
            let Some(node) = slot.node.take() else {
                break;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);

            let sectors = node.overlay_sectors() as u64;
            self.stats.live_nodes -= 1;
            self.stats.overlay_sectors -= sectors;
            self.stats.overlay_bytes -= sectors * SECTOR_SIZE as u64;
            self.stats.released_nodes += 1;
            tracing::trace!(node = %id, sectors, "freed lineage node");

            current = node.parent;
        }
        Ok(())
    }

    pub fn is_live(&self, id: LineageId) -> bool {
        self.node(id).is_ok()
    }

    pub fn parent(&self, id: LineageId) -> Result<Option<LineageId>> {
        self.node(id).map(|n| n.parent)
    }

    /// Number of forks between `id` and its root.
    pub fn depth(&self, id: LineageId) -> Result<u32> {
        self.node(id).map(|n| n.depth)
    }

    pub fn refcount(&self, id: LineageId) -> Result<u32> {
        self.node(id).map(|n| n.refcount)
    }

    pub fn is_frozen(&self, id: LineageId) -> Result<bool> {
        self.node(id).map(|n| n.frozen)
    }

    /// Number of sectors held in `id`'s own overlay (ancestors excluded).
    pub fn overlay_len(&self, id: LineageId) -> Result<usize> {
        self.node(id).map(LineageNode::overlay_sectors)
    }

    /// Store `data` as sector `index` of `disk` in `id`'s own overlay.
    pub fn write_sector(
        &mut self,
        id: LineageId,
        disk: DiskHandle,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_sector(disk, index)?;
        check_len(data.len())?;

        let inserted = {
            let node = self.node_mut(id)?;
            if node.frozen {
                return Err(DiskError::FrozenNode(id));
            }
            match node.overlay.entry(disk).or_default().entry(index) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().copy_from_slice(data);
                    false
                }
                Entry::Vacant(entry) => {
                    let mut sector = Box::new([0u8; SECTOR_SIZE]);
                    sector.copy_from_slice(data);
                    entry.insert(sector);
                    true
                }
            }
        };

        if inserted {
            self.stats.overlay_sectors += 1;
            self.stats.overlay_bytes += SECTOR_SIZE as u64;
        }
        Ok(())
    }

    /// Write a run of whole sectors starting at `first`.
    ///
    /// The whole range is validated before any sector is stored.
    pub fn write_sectors(
        &mut self,
        id: LineageId,
        disk: DiskHandle,
        first: u64,
        data: &[u8],
    ) -> Result<()> {
        self.check_run(disk, first, data.len())?;
        if self.is_frozen(id)? {
            return Err(DiskError::FrozenNode(id));
        }
        for (i, chunk) in data.chunks_exact(SECTOR_SIZE).enumerate() {
            self.write_sector(id, disk, first + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Read sector `index` of `disk` as seen from `id`.
    ///
    /// The nearest overlay entry on the path from `id` to the root wins; if there is none,
    /// `fallback` reads the base image.
    pub fn read_sector<F>(
        &self,
        id: LineageId,
        disk: DiskHandle,
        index: u64,
        buf: &mut [u8],
        fallback: F,
    ) -> Result<()>
    where
        F: FnOnce(DiskHandle, u64, &mut [u8]) -> Result<()>,
    {
        self.check_sector(disk, index)?;
        check_len(buf.len())?;

        match self.lookup(id, disk, index)? {
            Some((_, sector)) => {
                buf.copy_from_slice(sector);
                Ok(())
            }
            None => fallback(disk, index, buf),
        }
    }

    /// Read a run of whole sectors starting at `first`.
    pub fn read_sectors<F>(
        &self,
        id: LineageId,
        disk: DiskHandle,
        first: u64,
        buf: &mut [u8],
        mut fallback: F,
    ) -> Result<()>
    where
        F: FnMut(DiskHandle, u64, &mut [u8]) -> Result<()>,
    {
        self.check_run(disk, first, buf.len())?;
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.read_sector(id, disk, first + i as u64, chunk, &mut fallback)?;
        }
        Ok(())
    }

    /// Node whose overlay currently provides sector `index` for `id`, or `None` for the base
    /// image.
    pub fn owner_of(
        &self,
        id: LineageId,
        disk: DiskHandle,
        index: u64,
    ) -> Result<Option<LineageId>> {
        self.check_sector(disk, index)?;
        Ok(self.lookup(id, disk, index)?.map(|(owner, _)| owner))
    }

    /// Whether sectors of `disk` can move between host and guest without the generic copy path.
    ///
    /// True only when no node on `id`'s path overrides any sector of `disk`, i.e. the base image
    /// is exactly what the path sees. Writes must still go through [`BlockLineage::write_sector`].
    pub fn can_transfer_sector(&self, id: LineageId, disk: DiskHandle) -> bool {
        if self.disk(disk).is_err() {
            return false;
        }
        let mut current = Some(id);
        while let Some(id) = current {
            let Ok(node) = self.node(id) else {
                return false;
            };
            if node.overlay.get(&disk).is_some_and(|s| !s.is_empty()) {
                return false;
            }
            current = node.parent;
        }
        true
    }

    fn lookup(
        &self,
        id: LineageId,
        disk: DiskHandle,
        index: u64,
    ) -> Result<Option<(LineageId, &[u8; SECTOR_SIZE])>> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id)?;
            if let Some(sector) = node.overlay.get(&disk).and_then(|s| s.get(&index)) {
                return Ok(Some((id, &**sector)));
            }
            current = node.parent;
        }
        Ok(None)
    }

    fn disk(&self, disk: DiskHandle) -> Result<&AttachedDisk> {
        self.disks
            .get(disk.index())
            .and_then(Option::as_ref)
            .ok_or(DiskError::MissingDevice(disk))
    }

    fn check_sector(&self, disk: DiskHandle, index: u64) -> Result<()> {
        let sector_count = self.disk(disk)?.sector_count;
        if index >= sector_count {
            return Err(DiskError::OutOfBounds {
                device: disk,
                index,
                sector_count,
            });
        }
        Ok(())
    }

    fn check_run(&self, disk: DiskHandle, first: u64, len: usize) -> Result<()> {
        if len % SECTOR_SIZE != 0 {
            return Err(DiskError::UnalignedLength {
                len,
                alignment: SECTOR_SIZE,
            });
        }
        let count = (len / SECTOR_SIZE) as u64;
        if count == 0 {
            return self.disk(disk).map(|_| ());
        }
        let last = first.checked_add(count - 1).unwrap_or(u64::MAX);
        self.check_sector(disk, last)
    }

    fn node(&self, id: LineageId) -> Result<&LineageNode> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
            .ok_or(DiskError::StaleNode(id))
    }

    fn node_mut(&mut self, id: LineageId) -> Result<&mut LineageNode> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
            .ok_or(DiskError::StaleNode(id))
    }

    fn ensure_free_slots(&self, needed: usize) -> Result<()> {
        let fresh = needed.saturating_sub(self.free.len());
        if self.slots.len() + fresh > u32::MAX as usize {
            return Err(DiskError::AllocationFailure {
                requested: self.slots.len() + fresh,
            });
        }
        Ok(())
    }

    fn insert(&mut self, node: LineageNode) -> LineageId {
        self.stats.live_nodes += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.node.is_none(), "free list holds a live slot");
            slot.node = Some(node);
            return LineageId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        LineageId {
            index,
            generation: 0,
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len != SECTOR_SIZE {
        return Err(DiskError::UnalignedLength {
            len,
            alignment: SECTOR_SIZE,
        });
    }
    Ok(())
}
