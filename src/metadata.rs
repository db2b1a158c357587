//! Storage for the allocator's own bookkeeping.
//!
//! Nothing in here goes through `alloc`: every table lives in memory the
//! [`HeapGrower`] maps for it, so the allocator never depends on another
//! allocator and can itself be installed as the global one.
//!
//! Tables only grow when asked to [`reserve`](MetaVec::reserve) room, which
//! is the one place that needs the grower. Callers reserve up front for
//! everything an operation might insert, so the inserts themselves can't fail.

use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use core::slice;

use log::{debug, warn};
use static_assertions::const_assert;

use crate::allocators::HeapGrower;
use crate::blocklist::{BlockId, HEADER_SIZE};
use crate::error::MallocError;

/// Smallest mapping requested for a table.
const MIN_TABLE_BYTES: usize = 4096;

/// A vector of `Copy` values in grower-mapped memory.
///
/// The memory is not released on drop, since that needs the grower; owners
/// call [`release`](MetaVec::release) during their own teardown.
pub struct MetaVec<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    cap: usize,
    // Length of the mapping behind `ptr`; zero while nothing is mapped.
    mapped: usize,
}

impl<T: Copy> MetaVec<T> {
    pub const fn new() -> Self {
        MetaVec {
            ptr: NonNull::dangling(),
            len: 0,
            cap: 0,
            mapped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Append `value`, or hand it back if the vector is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        if self.len == self.cap {
            return Err(value);
        }
        unsafe { self.ptr.as_ptr().add(self.len).write(value) };
        self.len += 1;
        Ok(())
    }

    /// Make room for at least `additional` more elements. A new mapping at
    /// least doubles the capacity; the old one goes back to the grower.
    pub fn reserve<G: HeapGrower>(
        &mut self,
        grower: &mut G,
        additional: usize,
    ) -> Result<(), MallocError> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or(MallocError::SizeOverflow { size: additional })?;
        if needed <= self.cap {
            return Ok(());
        }
        let wanted = needed.max(self.cap.saturating_mul(2));
        let bytes = wanted
            .checked_mul(size_of::<T>())
            .ok_or(MallocError::SizeOverflow { size: wanted })?
            .max(MIN_TABLE_BYTES);

        let (base, len) = unsafe { grower.map_metadata(bytes) }.map_err(|err| {
            warn!("mapping {} bytes of metadata failed: {:?}", bytes, err);
            MallocError::OutOfMemory { size: bytes }
        })?;
        if len < bytes || base.as_ptr() as usize % align_of::<T>() != 0 {
            warn!("heap grower returned an unusable metadata mapping {:p}+{}", base, len);
            if let Err(err) = unsafe { grower.unmap_metadata(base, len) } {
                warn!("unmapping {:p} failed: {:?}", base, err);
            }
            return Err(MallocError::OutOfMemory { size: bytes });
        }

        let fresh = base.cast::<T>();
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr(), fresh.as_ptr(), self.len) };
        let (old, old_len) = (self.ptr, self.mapped);
        self.ptr = fresh;
        self.cap = len / size_of::<T>();
        self.mapped = len;
        Self::unmap(grower, old, old_len);
        debug!("metadata table now holds {} entries in {} bytes", self.cap, len);
        Ok(())
    }

    /// Give the memory back to `grower`, leaving an empty vector.
    pub fn release<G: HeapGrower>(&mut self, grower: &mut G) {
        Self::unmap(grower, self.ptr, self.mapped);
        *self = MetaVec::new();
    }

    fn unmap<G: HeapGrower>(grower: &mut G, ptr: NonNull<T>, len: usize) {
        if len == 0 {
            return;
        }
        if let Err(err) = unsafe { grower.unmap_metadata(ptr.cast(), len) } {
            warn!("unmapping metadata at {:p} failed: {:?}", ptr, err);
        }
    }
}

impl<T: Copy> Default for MetaVec<T> {
    fn default() -> Self {
        MetaVec::new()
    }
}

impl<T: Copy> Deref for MetaVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // A dangling pointer is fine for an empty slice.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Copy> DerefMut for MetaVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[derive(Clone, Copy)]
struct Entry {
    // Zero marks an empty slot; no payload lives at address zero.
    payload: usize,
    id: BlockId,
}

const EMPTY: Entry = Entry {
    payload: 0,
    id: BlockId(0),
};

const_assert!(align_of::<Entry>() <= HEADER_SIZE);

/// Maps payload addresses to the handles of their blocks.
///
/// Open addressing with a linear search over a power-of-two number of slots,
/// kept at most three quarters full. Removal shifts later entries back
/// instead of leaving tombstones, so a release never needs new memory.
pub struct PayloadIndex {
    entries: MetaVec<Entry>,
    len: usize,
}

fn hash(payload: usize) -> usize {
    // Payloads are 16-aligned; drop the bits that never vary.
    ((payload as u64 >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize
}

impl PayloadIndex {
    pub const fn new() -> Self {
        PayloadIndex {
            entries: MetaVec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    fn has_room_for(&self, count: usize) -> bool {
        count.saturating_mul(4) <= self.entries.len().saturating_mul(3)
    }

    /// Position of `payload`, or of the empty slot where it would go.
    fn find_slot(&self, payload: usize) -> usize {
        let mask = self.mask();
        let mut slot = hash(payload) & mask;
        loop {
            let entry = self.entries[slot];
            if entry.payload == payload || entry.payload == 0 {
                return slot;
            }
            slot = (slot + 1) & mask;
        }
    }

    pub fn get(&self, payload: usize) -> Option<BlockId> {
        if self.entries.is_empty() || payload == 0 {
            return None;
        }
        let entry = self.entries[self.find_slot(payload)];
        (entry.payload == payload).then_some(entry.id)
    }

    /// Make sure `additional` more payloads can be inserted without mapping
    /// anything.
    pub fn reserve<G: HeapGrower>(
        &mut self,
        grower: &mut G,
        additional: usize,
    ) -> Result<(), MallocError> {
        let needed = self
            .len
            .checked_add(additional)
            .ok_or(MallocError::SizeOverflow { size: additional })?;
        if self.has_room_for(needed) {
            return Ok(());
        }

        let mut slots = (self.entries.len() * 2).max(64);
        while needed.saturating_mul(4) > slots.saturating_mul(3) {
            slots = slots
                .checked_mul(2)
                .ok_or(MallocError::SizeOverflow { size: needed })?;
        }
        let mut fresh = MetaVec::new();
        fresh.reserve(grower, slots)?;
        while fresh.len() < slots && fresh.push(EMPTY).is_ok() {}

        let mut old = core::mem::replace(&mut self.entries, fresh);
        for entry in old.iter().filter(|e| e.payload != 0) {
            let slot = self.find_slot(entry.payload);
            self.entries[slot] = *entry;
        }
        old.release(grower);
        Ok(())
    }

    /// Map `payload` to `id`, returning the handle it mapped to before.
    ///
    /// # Panics
    ///
    /// If room was not [`reserve`](Self::reserve)d first.
    pub fn insert(&mut self, payload: usize, id: BlockId) -> Option<BlockId> {
        debug_assert_ne!(payload, 0);
        if self.entries.is_empty() || !self.has_room_for(self.len + 1) {
            panic!("payload index is full; reserve before inserting");
        }
        let slot = self.find_slot(payload);
        let previous = self.entries[slot];
        self.entries[slot] = Entry { payload, id };
        if previous.payload == payload {
            return Some(previous.id);
        }
        self.len += 1;
        None
    }

    pub fn remove(&mut self, payload: usize) -> Option<BlockId> {
        if self.entries.is_empty() || payload == 0 {
            return None;
        }
        let mut hole = self.find_slot(payload);
        let removed = self.entries[hole];
        if removed.payload != payload {
            return None;
        }

        // Pull back any entry whose search walked past the hole, so lookups
        // never stop early at it.
        let mask = self.mask();
        let mut slot = hole;
        loop {
            slot = (slot + 1) & mask;
            let entry = self.entries[slot];
            if entry.payload == 0 {
                break;
            }
            let home = hash(entry.payload) & mask;
            if slot.wrapping_sub(home) & mask >= slot.wrapping_sub(hole) & mask {
                self.entries[hole] = entry;
                hole = slot;
            }
        }
        self.entries[hole] = EMPTY;
        self.len -= 1;
        Some(removed.id)
    }

    pub fn release<G: HeapGrower>(&mut self, grower: &mut G) {
        self.entries.release(grower);
        self.len = 0;
    }
}

impl Default for PayloadIndex {
    fn default() -> Self {
        PayloadIndex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    use crate::allocators::ToyHeap;

    #[test]
    fn vec_grows_by_remapping() {
        let mut heap = ToyHeap::default();
        let mut values: MetaVec<u64> = MetaVec::new();
        assert_eq!(values.push(1), Err(1));

        values.reserve(&mut heap, 1).unwrap();
        assert_eq!(values.capacity(), MIN_TABLE_BYTES / 8);
        for i in 0..values.capacity() as u64 {
            values.push(i).unwrap();
        }
        assert!(values.push(0).is_err());

        values.reserve(&mut heap, 1).unwrap();
        assert_eq!(values.capacity(), MIN_TABLE_BYTES / 4);
        assert_eq!(values[511], 511);
        assert_eq!(heap.live_tables, 1);

        values.release(&mut heap);
        assert_eq!(heap.live_tables, 0);
        assert!(values.is_empty());
    }

    #[test]
    fn index_survives_removals_and_growth() {
        let mut heap = ToyHeap::default();
        let mut index = PayloadIndex::new();
        assert_eq!(index.get(0x1000), None);
        assert_eq!(index.remove(0x1000), None);

        let payload = |i: usize| 0x10_0000 + i * 48;
        for i in 0..1000 {
            index.reserve(&mut heap, 1).unwrap();
            assert_eq!(index.insert(payload(i), BlockId(i)), None);
        }
        assert_eq!(index.len(), 1000);
        assert_eq!(index.insert(payload(7), BlockId(70)), Some(BlockId(7)));

        for i in (0..1000).step_by(3) {
            assert!(index.remove(payload(i)).is_some());
        }
        for i in 0..1000 {
            let expected = match i {
                7 => Some(BlockId(70)),
                _ if i % 3 == 0 => None,
                _ => Some(BlockId(i)),
            };
            assert_eq!(index.get(payload(i)), expected, "payload {}", i);
        }
        assert_eq!(index.get(payload(2000)), None);
        index.release(&mut heap);
        assert_eq!(heap.live_tables, 0);
    }
}
