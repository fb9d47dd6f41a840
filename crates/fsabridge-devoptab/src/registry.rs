//! Fixed-capacity mount registry.
//!
//! Each slot carries a generation counter that is bumped every time the slot
//! is released. A [`SlotId`] names one specific tenancy of a slot, so a
//! device or handle that outlives its mount can tell it is stale.
//!
//! The registry lock only guards slot bookkeeping. It is never held across a
//! call to the filesystem service.

use std::sync::Arc;

use fsabridge_shim::{AlignedBuffer, ClientHandle, DeviceInfo};
use parking_lot::Mutex;

use crate::error::MountError;

/// One tenancy of a mount slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: usize,
    pub generation: u32,
}

/// Bookkeeping for one slot. A free slot is exactly [`MountEntry::free`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Equals the slot index, forever.
    pub id: usize,
    pub name: String,
    pub mount_path: String,
    /// Reserved by an in-flight or completed mount.
    pub claimed: bool,
    /// Fully mounted and registered; reachable by name.
    pub configured: bool,
    /// The bridge attached a device itself and must unmount it.
    pub mounted: bool,
    pub client: Option<ClientHandle>,
    pub device_size_in_sectors: u64,
    pub device_sector_size: u32,
}

impl MountEntry {
    /// The canonical state of an unused slot.
    pub fn free(id: usize) -> Self {
        Self {
            id,
            name: String::new(),
            mount_path: String::new(),
            claimed: false,
            configured: false,
            mounted: false,
            client: None,
            device_size_in_sectors: 0,
            device_sector_size: 0,
        }
    }
}

/// Per-mount state shared with the filesystem adapter.
///
/// Its mutex is the per-mount lock: the adapter holds it for the whole of
/// every operation.
#[derive(Debug)]
pub struct MountContext {
    pub client: ClientHandle,
    pub mount_path: String,
    pub sector_size: u32,
    pub size_in_sectors: u64,
    /// Cleared under the lock when the mount is torn down.
    pub live: bool,
    scratch: Option<AlignedBuffer>,
}

impl MountContext {
    /// The mount's staging buffer, allocated on first use.
    pub fn scratch(&mut self, len: usize) -> Option<&mut AlignedBuffer> {
        if self.scratch.as_ref().is_none_or(|b| b.len() < len) {
            self.scratch = Some(AlignedBuffer::new(len)?);
        }
        self.scratch.as_mut()
    }
}

/// What a successful bring-up hands to the registry.
#[derive(Debug, Clone)]
pub struct MountSetup {
    pub client: ClientHandle,
    pub mount_path: String,
    pub mounted: bool,
    pub info: DeviceInfo,
}

/// What the bridge needs to release a mount.
#[derive(Debug)]
pub struct Teardown {
    pub client: Option<ClientHandle>,
    pub mount_path: String,
    pub mounted: bool,
    pub context: Option<Arc<Mutex<MountContext>>>,
}

/// Point-in-time description of a live mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub slot: SlotId,
    pub name: String,
    pub mount_path: String,
    pub mounted: bool,
    pub sector_size: u32,
    pub size_in_sectors: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: MountEntry,
    context: Option<Arc<Mutex<MountContext>>>,
}

impl Slot {
    fn free(index: usize) -> Self {
        Self {
            generation: 0,
            entry: MountEntry::free(index),
            context: None,
        }
    }

    fn id(&self) -> SlotId {
        SlotId {
            index: self.entry.id,
            generation: self.generation,
        }
    }
}

/// The mount slot arena.
#[derive(Debug)]
pub struct MountRegistry {
    slots: Mutex<Vec<Slot>>,
}

impl MountRegistry {
    /// Create a registry with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new((0..capacity).map(Slot::free).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Claim the first free slot for `name`.
    ///
    /// Fails if another claimed slot already carries `name`, or if every
    /// slot is taken.
    pub fn allocate(&self, name: &str) -> Result<SlotId, MountError> {
        let mut slots = self.slots.lock();
        if slots.iter().any(|s| s.entry.claimed && s.entry.name == name) {
            return Err(MountError::AlreadyExists(name.to_string()));
        }
        let capacity = slots.len();
        let slot = slots
            .iter_mut()
            .find(|s| !s.entry.claimed)
            .ok_or(MountError::SlotsExhausted(capacity))?;
        slot.entry.claimed = true;
        slot.entry.name = name.to_string();
        tracing::trace!(
            slot = slot.entry.id,
            generation = slot.generation,
            name,
            "claimed mount slot"
        );
        Ok(slot.id())
    }

    fn with_slot<R>(&self, id: SlotId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation && s.entry.claimed)
            .map(f)
    }

    /// Record geometry and session for a claimed slot and create its
    /// per-mount context. The slot is not reachable by name until
    /// [`commit`](Self::commit).
    pub fn prepare(&self, id: SlotId, setup: MountSetup) -> Option<Arc<Mutex<MountContext>>> {
        self.with_slot(id, |slot| {
            slot.entry.mount_path = setup.mount_path.clone();
            slot.entry.mounted = setup.mounted;
            slot.entry.client = Some(setup.client);
            slot.entry.device_size_in_sectors = setup.info.device_size_in_sectors;
            slot.entry.device_sector_size = setup.info.device_sector_size;
            let context = Arc::new(Mutex::new(MountContext {
                client: setup.client,
                mount_path: setup.mount_path,
                sector_size: setup.info.device_sector_size,
                size_in_sectors: setup.info.device_size_in_sectors,
                live: true,
                scratch: None,
            }));
            slot.context = Some(context.clone());
            context
        })
    }

    /// Mark a prepared slot configured.
    pub fn commit(&self, id: SlotId) -> bool {
        self.with_slot(id, |slot| slot.entry.configured = true).is_some()
    }

    /// First configured slot named `name`.
    pub fn find_by_name(&self, name: &str) -> Option<SlotId> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.entry.configured && s.entry.name == name)
            .map(Slot::id)
    }

    /// Whether `id` still names a configured tenancy.
    pub fn is_current(&self, id: SlotId) -> bool {
        self.slots
            .lock()
            .get(id.index)
            .is_some_and(|s| s.generation == id.generation && s.entry.configured)
    }

    /// Make a configured slot unreachable by name and hand back what is
    /// needed to release it. The name stays reserved until [`release`](Self::release).
    ///
    /// Only one caller wins a given tenancy; later calls get `None`.
    pub fn begin_teardown(&self, id: SlotId) -> Option<Teardown> {
        self.with_slot(id, |slot| {
            if !slot.entry.configured {
                return None;
            }
            slot.entry.configured = false;
            Some(Teardown {
                client: slot.entry.client,
                mount_path: slot.entry.mount_path.clone(),
                mounted: slot.entry.mounted,
                context: slot.context.clone(),
            })
        })
        .flatten()
    }

    /// Return a slot to its canonical free state and advance its generation.
    pub fn release(&self, id: SlotId) {
        let released = self.with_slot(id, |slot| {
            slot.entry = MountEntry::free(id.index);
            slot.context = None;
            slot.generation = slot.generation.wrapping_add(1);
        });
        if released.is_some() {
            tracing::trace!(slot = id.index, "released mount slot");
        }
    }

    /// Snapshot of a slot's bookkeeping.
    pub fn entry(&self, index: usize) -> Option<MountEntry> {
        self.slots.lock().get(index).map(|s| s.entry.clone())
    }

    /// Current generation of a slot.
    pub fn generation(&self, index: usize) -> Option<u32> {
        self.slots.lock().get(index).map(|s| s.generation)
    }

    /// Snapshot of the configured mount named `name`.
    pub fn info(&self, name: &str) -> Option<MountInfo> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.entry.configured && s.entry.name == name)
            .map(|s| MountInfo {
                slot: s.id(),
                name: s.entry.name.clone(),
                mount_path: s.entry.mount_path.clone(),
                mounted: s.entry.mounted,
                sector_size: s.entry.device_sector_size,
                size_in_sectors: s.entry.device_size_in_sectors,
            })
    }

    /// Number of claimed slots.
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.entry.claimed).count()
    }
}
