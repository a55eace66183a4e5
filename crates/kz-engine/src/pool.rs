//! Fixed-capacity object pool with reclaimable, generation-tagged IDs.
//!
//! Every slot is constructed once when the pool is created. Allocation
//! hands out an existing slot for reuse, so objects that own scratch
//! buffers keep them across lifetimes and the audio thread never touches
//! the allocator.

use alloc::vec::Vec;

/// Bits of a [`PoolId`] holding the slot index.
const INDEX_BITS: u32 = 20;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Bits holding the reincarnation counter. Bit 31 stays clear so callers
/// can use it as a type tag.
const GENERATION_BITS: u32 = 11;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Largest capacity a pool may be created with.
pub const MAX_POOL_CAPACITY: usize = INDEX_MASK as usize + 1;

/// Handle to a pooled object.
///
/// Packs the slot index with the slot's reincarnation counter, so a handle
/// to a freed and reused slot no longer resolves. The raw value is never 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(u32);

impl PoolId {
    fn pack(index: usize, generation: u32) -> Self {
        PoolId((generation << INDEX_BITS) | index as u32)
    }

    /// Rebuild a handle from its raw value; 0 and tagged values are rejected.
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 || raw & (1 << 31) != 0 || (raw >> INDEX_BITS) & GENERATION_MASK == 0 {
            None
        } else {
            Some(PoolId(raw))
        }
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> INDEX_BITS) & GENERATION_MASK
    }
}

#[derive(Clone, Copy, Debug)]
struct SlotMeta {
    generation: u32,
    live: bool,
}

/// A fixed-capacity arena with a free list.
pub struct Pool<T> {
    items: Vec<T>,
    meta: Vec<SlotMeta>,
    /// Free slot indices in descending order, so the lowest one is popped.
    free: Vec<u32>,
}

impl<T> Pool<T> {
    /// Create a pool of `capacity` slots, each built by `init`.
    pub fn with_capacity(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let capacity = capacity.min(MAX_POOL_CAPACITY);
        let items = (0..capacity).map(|_| init()).collect();
        let meta = (0..capacity).map(|_| SlotMeta { generation: 1, live: false }).collect();
        let free = (0..capacity as u32).rev().collect();
        Self { items, meta, free }
    }

    /// Claim a free slot. Returns `None` when the pool is exhausted.
    ///
    /// The slot still holds whatever its previous owner left behind;
    /// callers reset the fields they use.
    pub fn allocate(&mut self) -> Option<PoolId> {
        let index = self.free.pop()? as usize;
        let meta = &mut self.meta[index];
        meta.live = true;
        Some(PoolId::pack(index, meta.generation))
    }

    /// Release a slot. Stale or unknown handles are ignored.
    pub fn free(&mut self, id: PoolId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let meta = &mut self.meta[id.index()];
        meta.live = false;
        meta.generation = (meta.generation % GENERATION_MASK) + 1;
        // Cannot grow: one entry per slot was reserved at construction.
        let index = id.index() as u32;
        let at = self.free.partition_point(|&i| i > index);
        self.free.insert(at, index);
        true
    }

    /// True if `id` refers to a currently allocated slot.
    pub fn is_live(&self, id: PoolId) -> bool {
        self.meta
            .get(id.index())
            .is_some_and(|m| m.live && m.generation == id.generation())
    }

    pub fn get(&self, id: PoolId) -> Option<&T> {
        if self.is_live(id) {
            self.items.get(id.index())
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, id: PoolId) -> Option<&mut T> {
        if self.is_live(id) {
            self.items.get_mut(id.index())
        } else {
            None
        }
    }

    /// Handle of the live object in slot `index`, if any.
    pub fn id_at(&self, index: usize) -> Option<PoolId> {
        self.meta
            .get(index)
            .filter(|m| m.live)
            .map(|m| PoolId::pack(index, m.generation))
    }

    /// Iterate over live objects with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (PoolId, &T)> {
        self.meta
            .iter()
            .zip(self.items.iter())
            .enumerate()
            .filter(|(_, (m, _))| m.live)
            .map(|(i, (m, item))| (PoolId::pack(i, m.generation), item))
    }

    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.items.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Free every slot.
    pub fn clear(&mut self) {
        for i in 0..self.meta.len() {
            if let Some(id) = self.id_at(i) {
                self.free(id);
            }
        }
    }
}
