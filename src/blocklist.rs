//! Block metadata and the arena chain.
//!
//! Block records live in a slot table and refer to each other by [`BlockId`]
//! rather than by raw pointer. Arena blocks are linked in the order the arena
//! grew, which (with a contiguous arena) is also address order. A side table
//! maps each payload address back to the handle of its block, so recovering a
//! block from a pointer never involves trusting the memory in front of it.
//!
//! Every block still reserves [`HEADER_SIZE`] bytes in front of its payload.
//! Those bytes hold a guard (a canary and the block's handle), which is checked
//! before a live block is released. When two blocks merge, the header of the
//! second one becomes part of the first one's payload.
//!
//! ```text
//! Arena block:
//! ┌──────────────┬───────────────┬──────────────┬─────────────────────┐
//! │ header (16)  │ padding (≥ 0) │ guard (16)*  │ payload ...         │
//! └──────────────┴───────────────┴──────────────┴─────────────────────┘
//!                └────────────────────── size ────────────────────────┘
//! * with no padding the guard lives in the header itself
//! ```

use core::fmt;
use core::ops::{Index, IndexMut, Range};
use core::ptr::{self, NonNull};

use log::trace;
use static_assertions::{const_assert, const_assert_eq};

use crate::allocators::HeapGrower;
use crate::bins::Bins;
use crate::config::align_up;
use crate::error::MallocError;
use crate::metadata::{MetaVec, PayloadIndex};

/// Bytes reserved in front of every payload.
pub const HEADER_SIZE: usize = 16;

const CANARY: usize = 0xB10C_CA5E;

/// The in-band part of a block header.
#[repr(C, align(16))]
struct Guard {
    canary: usize,
    id: usize,
}

const_assert_eq!(core::mem::align_of::<Guard>(), HEADER_SIZE);
const_assert!(core::mem::size_of::<Guard>() <= HEADER_SIZE);

impl Guard {
    fn new(payload: usize, id: BlockId) -> Guard {
        Guard {
            canary: CANARY ^ payload,
            id: id.0,
        }
    }
}

/// A stable handle to a block record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

/// An OS mapping owned by a single large block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub base: NonNull<u8>,
    pub len: usize,
}

/// The record describing one block.
///
/// `size` counts the bytes after the header up to the end of the block, so it
/// never includes header bytes; for aligned allocations the first `padding` of
/// those bytes sit in front of the payload.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    header: NonNull<u8>,
    size: usize,
    padding: usize,
    align: usize,
    is_free: bool,
    mapping: Option<Mapping>,
    next: Option<BlockId>,
    pub(crate) bin: Option<usize>,
    pub(crate) bin_prev: Option<BlockId>,
    pub(crate) bin_next: Option<BlockId>,
}

impl Block {
    pub(crate) fn new_free(header: NonNull<u8>, size: usize) -> Block {
        Block {
            header,
            size,
            padding: 0,
            align: HEADER_SIZE,
            is_free: true,
            mapping: None,
            next: None,
            bin: None,
            bin_prev: None,
            bin_next: None,
        }
    }

    pub fn header_addr(&self) -> usize {
        self.header.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes available to the caller starting at the payload address.
    pub fn usable(&self) -> usize {
        self.size - self.padding
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    /// The alignment the block was last allocated with.
    pub fn alignment(&self) -> usize {
        self.align
    }

    pub fn is_free(&self) -> bool {
        self.is_free
    }

    pub fn is_mapped_independently(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn next(&self) -> Option<BlockId> {
        self.next
    }

    pub fn is_binned(&self) -> bool {
        self.bin.is_some()
    }

    pub fn payload(&self) -> NonNull<u8> {
        // The payload lies inside the block's own range, which is non-null.
        unsafe { NonNull::new_unchecked(self.header.as_ptr().add(HEADER_SIZE + self.padding)) }
    }

    pub fn payload_addr(&self) -> usize {
        self.header_addr() + HEADER_SIZE + self.padding
    }

    /// First byte after the header.
    fn data_start(&self) -> usize {
        self.header_addr() + HEADER_SIZE
    }

    /// The address range covered by the block, header included.
    pub fn as_range(&self) -> Range<usize> {
        self.header_addr()..(self.data_start() + self.size)
    }

    /// How many bytes of padding an allocation with alignment `align` would
    /// need if it were carved from this block, provided `size` bytes still fit
    /// after it.
    pub fn fits(&self, size: usize, align: usize) -> Option<usize> {
        let start = self.data_start();
        let padding = align_up(start, align)? - start;
        if padding.checked_add(size)? <= self.size {
            Some(padding)
        } else {
            None
        }
    }

    fn guard_ptr(&self) -> *mut Guard {
        // padding < size, so the guard sits within the block.
        unsafe { self.header.as_ptr().add(self.padding).cast::<Guard>() }
    }

    unsafe fn write_guard(&self, id: BlockId) {
        ptr::write(self.guard_ptr(), Guard::new(self.payload_addr(), id));
    }

    unsafe fn guard_intact(&self, id: BlockId) -> bool {
        let guard = ptr::read(self.guard_ptr());
        guard.canary == CANARY ^ self.payload_addr() && guard.id == id.0
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Occupied(Block),
    // Links to the next vacated slot.
    Vacant(Option<usize>),
}

/// Slot storage for block records. Vacated slots are reused.
///
/// The slots live in grower-mapped memory. [`reserve`](BlockTable::reserve)
/// must have made room before a record is inserted.
pub struct BlockTable {
    slots: MetaVec<Slot>,
    vacant: Option<usize>,
    len: usize,
}

const_assert!(core::mem::align_of::<Slot>() <= HEADER_SIZE);

impl BlockTable {
    pub const fn new() -> Self {
        BlockTable {
            slots: MetaVec::new(),
            vacant: None,
            len: 0,
        }
    }

    /// Make sure `additional` records can be inserted without mapping more
    /// memory.
    pub fn reserve<G: HeapGrower>(
        &mut self,
        grower: &mut G,
        additional: usize,
    ) -> Result<(), MallocError> {
        let vacancies = self.slots.len() - self.len;
        let spare = vacancies + (self.slots.capacity() - self.slots.len());
        if spare >= additional {
            return Ok(());
        }
        self.slots.reserve(grower, additional - vacancies)
    }

    pub(crate) fn insert(&mut self, block: Block) -> BlockId {
        let id = match self.vacant {
            Some(index) => {
                if let Slot::Vacant(next) = self.slots[index] {
                    self.vacant = next;
                }
                self.slots[index] = Slot::Occupied(block);
                BlockId(index)
            }
            None => {
                if self.slots.push(Slot::Occupied(block)).is_err() {
                    panic!("block table is full; reserve before inserting");
                }
                BlockId(self.slots.len() - 1)
            }
        };
        self.len += 1;
        id
    }

    pub(crate) fn remove(&mut self, id: BlockId) -> Option<Block> {
        let block = *self.get(id)?;
        self.slots[id.0] = Slot::Vacant(self.vacant);
        self.vacant = Some(id.0);
        self.len -= 1;
        Some(block)
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        match self.slots.get(id.0)? {
            Slot::Occupied(block) => Some(block),
            Slot::Vacant(_) => None,
        }
    }

    fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        match self.slots.get_mut(id.0)? {
            Slot::Occupied(block) => Some(block),
            Slot::Vacant(_) => None,
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied(block) => Some((BlockId(i), block)),
                Slot::Vacant(_) => None,
            })
    }

    pub(crate) fn release<G: HeapGrower>(&mut self, grower: &mut G) {
        self.slots.release(grower);
        *self = BlockTable::new();
    }
}

impl Default for BlockTable {
    fn default() -> Self {
        BlockTable::new()
    }
}

impl Index<BlockId> for BlockTable {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        match self.get(id) {
            Some(block) => block,
            None => panic!("stale block handle {:?}", id),
        }
    }
}

impl IndexMut<BlockId> for BlockTable {
    fn index_mut(&mut self, id: BlockId) -> &mut Block {
        match self.get_mut(id) {
            Some(block) => block,
            None => panic!("stale block handle {:?}", id),
        }
    }
}

/// All blocks known to one allocator: the arena chain, the standalone
/// mappings, the payload index and the small-object bins.
///
/// It maintains these invariants between operations:
///
/// - The arena chain starts at `head`, ends at `tail`, and visits every arena
///   block exactly once.
/// - Each block's payload address maps to its handle, and to nothing else.
/// - No two free arena blocks that are next to each other in the chain are
///   also next to each other in memory; those get merged.
/// - A free arena block is in a bin exactly when its size is in bin range.
/// - Standalone blocks are never linked, binned, split or merged.
pub struct BlockList {
    table: BlockTable,
    head: Option<BlockId>,
    tail: Option<BlockId>,
    payloads: PayloadIndex,
    bins: Bins,
    min_split_payload: usize,
}

// The list holds raw pointers into memory it exclusively manages, so moving it
// to another thread is fine. It is not Sync; shared use needs a lock around it.
unsafe impl Send for BlockList {}

pub struct BlockIter<'list> {
    table: &'list BlockTable,
    next: Option<BlockId>,
    remaining: usize,
}

impl<'list> BlockIter<'list> {
    /// True if the walk stopped because it visited more blocks than exist,
    /// which means the chain contains a cycle.
    pub fn truncated(&self) -> bool {
        self.remaining == 0 && self.next.is_some()
    }
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = (BlockId, &'list Block);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.next.take()?;
        self.remaining -= 1;
        let block = &self.table[id];
        self.next = block.next;
        Some((id, block))
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = (BlockId, &'list Block);
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl Index<BlockId> for BlockList {
    type Output = Block;

    fn index(&self, id: BlockId) -> &Block {
        &self.table[id]
    }
}

impl BlockList {
    pub const fn new(bin_width: usize, bin_count: usize, min_split_payload: usize) -> Self {
        BlockList {
            table: BlockTable::new(),
            head: None,
            tail: None,
            payloads: PayloadIndex::new(),
            bins: Bins::new(bin_width, bin_count),
            min_split_payload,
        }
    }

    /// Make sure the next `additional` blocks can be created without
    /// mapping more metadata. Every operation that can create blocks needs
    /// this first.
    pub fn reserve<G: HeapGrower>(
        &mut self,
        grower: &mut G,
        additional: usize,
    ) -> Result<(), MallocError> {
        self.table.reserve(grower, additional)?;
        self.payloads.reserve(grower, additional)
    }

    /// Give all metadata memory back to `grower` and forget every block.
    pub(crate) fn release_metadata<G: HeapGrower>(&mut self, grower: &mut G) {
        self.table.release(grower);
        self.payloads.release(grower);
        self.bins.clear();
        self.head = None;
        self.tail = None;
    }

    pub fn tail(&self) -> Option<BlockId> {
        self.tail
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.table.get(id)
    }

    pub fn table(&self) -> &BlockTable {
        &self.table
    }

    pub fn bins(&self) -> &Bins {
        &self.bins
    }

    /// Walk the arena chain in link order. The walk always terminates.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            table: &self.table,
            next: self.head,
            remaining: self.table.len(),
        }
    }

    /// Blocks that own a standalone mapping.
    pub fn standalone(&self) -> impl Iterator<Item = (BlockId, &Block)> + '_ {
        self.table
            .iter()
            .filter(|(_, block)| block.is_mapped_independently())
    }

    /// Number of arena blocks.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Recover the block owning the payload at `ptr`.
    ///
    /// The guard in front of a live payload must be intact. Free blocks are
    /// returned without looking at their memory; callers decide what a free
    /// block means for them.
    pub fn locate(&self, ptr: usize) -> Result<BlockId, MallocError> {
        let id = self
            .payloads
            .get(ptr)
            .ok_or(MallocError::UnknownPointer { ptr })?;
        let block = &self.table[id];
        if !block.is_free && !unsafe { block.guard_intact(id) } {
            return Err(MallocError::CorruptHeader { ptr });
        }
        Ok(id)
    }

    ////////////////////////////////////////////////////////////
    // Building blocks

    /// Append a fresh range of `len` bytes at `header` to the arena chain as a
    /// single free block.
    ///
    /// # Safety
    ///
    /// The range must be writable, aligned to `HEADER_SIZE`, at least
    /// `2 * HEADER_SIZE` long, and owned by this list from now on.
    pub(crate) unsafe fn append_arena(&mut self, header: NonNull<u8>, len: usize) -> BlockId {
        debug_assert!(len >= 2 * HEADER_SIZE);
        debug_assert_eq!(header.as_ptr() as usize % HEADER_SIZE, 0);

        let id = self.table.insert(Block::new_free(header, len - HEADER_SIZE));
        match self.tail {
            Some(tail) => self.table[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.register_payload(id);
        self.table[id].write_guard(id);
        self.bins.push(&mut self.table, id);
        id
    }

    /// Grow the free tail block by `len` bytes that directly follow it.
    ///
    /// # Safety
    ///
    /// The `len` bytes after the tail must be writable and owned by this list
    /// from now on.
    pub(crate) unsafe fn extend_tail(&mut self, len: usize) -> Option<BlockId> {
        let tail = self.tail?;
        if !self.table[tail].is_free {
            return None;
        }
        self.bins.remove(&mut self.table, tail);
        self.table[tail].size += len;
        self.bins.push(&mut self.table, tail);
        Some(tail)
    }

    /// Register a live block that owns its own mapping.
    ///
    /// # Safety
    ///
    /// `mapping` must be writable and owned by this list until the block is
    /// removed again; `padding + size + HEADER_SIZE` must fit within it.
    pub(crate) unsafe fn insert_standalone(
        &mut self,
        mapping: Mapping,
        padding: usize,
        align: usize,
    ) -> BlockId {
        let mut block = Block::new_free(mapping.base, mapping.len - HEADER_SIZE);
        block.padding = padding;
        block.align = align;
        block.is_free = false;
        block.mapping = Some(mapping);
        debug_assert!(block.padding < block.size);

        let id = self.table.insert(block);
        self.register_payload(id);
        self.table[id].write_guard(id);
        id
    }

    /// Forget a standalone block, returning the mapping it owned.
    pub(crate) fn remove_standalone(&mut self, id: BlockId) -> Option<Mapping> {
        let mapping = self.table[id].mapping?;
        self.unregister_payload(id);
        self.table.remove(id);
        Some(mapping)
    }

    fn register_payload(&mut self, id: BlockId) {
        let payload = self.table[id].payload_addr();
        let previous = self.payloads.insert(payload, id);
        debug_assert!(previous.is_none(), "payload {:#x} indexed twice", payload);
    }

    fn unregister_payload(&mut self, id: BlockId) {
        let payload = self.table[id].payload_addr();
        self.payloads.remove(payload);
    }

    fn set_padding(&mut self, id: BlockId, padding: usize) {
        if self.table[id].padding == padding {
            return;
        }
        self.unregister_payload(id);
        self.table[id].padding = padding;
        self.register_payload(id);
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// First-fit search of the arena chain for a free block that can hold
    /// `size` bytes at alignment `align`. Returns the block and the padding
    /// that alignment requires.
    pub fn find_fit(&self, size: usize, align: usize) -> Option<(BlockId, usize)> {
        self.iter()
            .filter(|(_, block)| block.is_free)
            .find_map(|(id, block)| block.fits(size, align).map(|padding| (id, padding)))
    }

    /// Pop a binned block that can hold `size` bytes at alignment `align`.
    pub fn pop_bin(&mut self, size: usize, align: usize) -> Option<(BlockId, usize)> {
        self.bins.pop(&mut self.table, size, align)
    }

    /// Hand out `size` bytes of the free block `id`, starting `padding` bytes
    /// after its header. The surplus is split off when it is large enough.
    pub(crate) fn claim(
        &mut self,
        id: BlockId,
        padding: usize,
        size: usize,
        align: usize,
    ) -> NonNull<u8> {
        debug_assert!(self.table[id].is_free);
        debug_assert!(padding + size <= self.table[id].size);

        self.bins.remove(&mut self.table, id);
        self.set_padding(id, padding);
        self.split(id, padding + size);

        let block = &mut self.table[id];
        block.is_free = false;
        block.align = align;
        unsafe { block.write_guard(id) };
        trace!(
            "claimed {:?} at {:#x}: {} bytes (+{} padding)",
            id,
            block.payload_addr(),
            size,
            padding
        );
        block.payload()
    }

    /// Shrink `id` to `needed` bytes, turning the remainder into a new free
    /// block right behind it, if the remainder can hold a header plus the
    /// minimum split payload.
    pub(crate) fn split(&mut self, id: BlockId, needed: usize) -> Option<BlockId> {
        let block = &self.table[id];
        let surplus = block.size.checked_sub(needed)?;
        if surplus < HEADER_SIZE + self.min_split_payload || block.mapping.is_some() {
            return None;
        }

        // needed is a multiple of HEADER_SIZE, so the new header is aligned.
        let header =
            unsafe { NonNull::new_unchecked(block.header.as_ptr().add(HEADER_SIZE + needed)) };
        let mut tail = Block::new_free(header, surplus - HEADER_SIZE);
        tail.next = block.next;

        let was_binned = block.is_binned();
        if was_binned {
            self.bins.remove(&mut self.table, id);
        }
        self.table[id].size = needed;

        let tail_id = self.table.insert(tail);
        self.table[id].next = Some(tail_id);
        if self.tail == Some(id) {
            self.tail = Some(tail_id);
        }
        self.register_payload(tail_id);
        unsafe { self.table[tail_id].write_guard(tail_id) };
        self.bins.push(&mut self.table, tail_id);
        if was_binned {
            self.bins.push(&mut self.table, id);
        }

        trace!(
            "split {:?} at {} bytes, {} bytes free in {:?}",
            id,
            needed,
            surplus - HEADER_SIZE,
            tail_id
        );
        Some(tail_id)
    }

    /// Try to extend the live arena block `id` in place so it holds `size`
    /// bytes after its padding, by absorbing a free block directly behind it.
    pub(crate) fn grow_in_place(&mut self, id: BlockId, size: usize) -> bool {
        let block = &self.table[id];
        if block.mapping.is_some() {
            return false;
        }
        let needed = match block.padding.checked_add(size) {
            Some(n) => n,
            None => return false,
        };
        if needed <= block.size {
            return true;
        }

        let next_id = match block.next {
            Some(n) => n,
            None => return false,
        };
        let next = &self.table[next_id];
        if !next.is_free
            || block.as_range().end != next.header_addr()
            || block.size + HEADER_SIZE + next.size < needed
        {
            return false;
        }

        self.absorb_next(id);
        self.split(id, needed);
        true
    }

    ////////////////////////////////////////////////////////////
    // Deallocation

    /// Mark a live arena block free. Aligned blocks lose their padding, so the
    /// payload goes back to sitting right after the header.
    pub(crate) fn mark_free(&mut self, id: BlockId) {
        debug_assert!(!self.table[id].is_free);
        debug_assert!(self.table[id].mapping.is_none());

        self.set_padding(id, 0);
        let block = &mut self.table[id];
        block.is_free = true;
        block.align = HEADER_SIZE;
        unsafe { block.write_guard(id) };
        self.bins.push(&mut self.table, id);
    }

    /// Merge every pair of chain neighbours that are both free and touch in
    /// memory. After a merge the same block is tested again, since it may now
    /// touch a third free block. Returns the number of merges.
    pub fn coalesce(&mut self) -> usize {
        let mut merges = 0;
        let mut cursor = self.head;
        let mut steps = self.table.len();

        while let Some(id) = cursor {
            if steps == 0 {
                break;
            }
            let block = &self.table[id];
            let next = block.next;
            let mergeable = match next {
                Some(next_id) => {
                    let following = &self.table[next_id];
                    block.is_free
                        && following.is_free
                        && block.as_range().end == following.header_addr()
                }
                None => false,
            };

            if mergeable {
                self.absorb_next(id);
                merges += 1;
            } else {
                cursor = next;
                steps -= 1;
            }
        }
        merges
    }

    /// Fold the block after `id` into `id`: its header and payload become part
    /// of `id`'s payload and it is unlinked from the chain.
    fn absorb_next(&mut self, id: BlockId) {
        let next_id = match self.table[id].next {
            Some(n) => n,
            None => return,
        };
        self.bins.remove(&mut self.table, next_id);
        self.unregister_payload(next_id);
        let absorbed = match self.table.remove(next_id) {
            Some(b) => b,
            None => return,
        };

        let is_free = self.table[id].is_free;
        if is_free {
            self.bins.remove(&mut self.table, id);
        }
        let block = &mut self.table[id];
        block.size += HEADER_SIZE + absorbed.size;
        block.next = absorbed.next;
        if self.tail == Some(next_id) {
            self.tail = Some(id);
        }
        if is_free {
            self.bins.push(&mut self.table, id);
        }
        trace!("merged {:?} into {:?}", next_id, id);
    }

    ////////////////////////////////////////////////////////////
    // Consistency

    /// Check the invariants and gather totals.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        let mut previous: Option<&Block> = None;
        let mut walk = self.iter();
        for (id, block) in walk.by_ref() {
            if let Some(prev) = previous {
                let (prev_range, range) = (prev.as_range(), block.as_range());
                if prev_range.end > range.start && prev_range.start < range.end {
                    validity.overlaps += 1;
                } else if range.start < prev_range.start {
                    validity.out_of_orders += 1;
                }
                if prev.is_free && block.is_free && prev_range.end == range.start {
                    validity.adjacents += 1;
                }
            }
            if block.mapping.is_some() {
                validity.misplaced_mappings += 1;
            }
            if self.payloads.get(block.payload_addr()) != Some(id) {
                validity.unindexed += 1;
            }
            let should_bin = block.is_free && self.bins.class_of(block.size).is_some();
            if should_bin != block.is_binned() {
                validity.bin_mismatches += 1;
            }

            stats.length += 1;
            stats.arena_size += HEADER_SIZE + block.size;
            if block.is_free {
                stats.free_blocks += 1;
                stats.free_size += block.size;
            } else {
                stats.used_blocks += 1;
                stats.used_size += block.size;
            }
            previous = Some(block);
        }
        validity.cycle = walk.truncated();

        for (id, block) in self.standalone() {
            if block.is_binned() || block.is_free {
                validity.bin_mismatches += 1;
            }
            if self.payloads.get(block.payload_addr()) != Some(id) {
                validity.unindexed += 1;
            }
            stats.standalone_blocks += 1;
            stats.standalone_size += block.size;
        }

        stats.binned = self.bins.len(&self.table);
        if self.payloads.len() != self.table.len() {
            validity.unindexed += 1;
        }

        (validity, stats)
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for (_, block) in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let state = if block.is_free { "free" } else { "used" };
            write!(f, "Block({:#x}, {}, {})", block.header_addr(), block.size, state)?;
        }
        write!(f, ")")
    }
}

/// Counts of every invariant violation found in a `BlockList`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Arena blocks overlapping their chain predecessor. Corruption.
    pub overlaps: usize,
    /// Free chain neighbours that touch in memory but were not merged.
    pub adjacents: usize,
    /// Blocks whose address is below their chain predecessor's.
    pub out_of_orders: usize,
    /// Standalone blocks found in the arena chain.
    pub misplaced_mappings: usize,
    /// Blocks whose payload does not map back to them.
    pub unindexed: usize,
    /// Blocks whose bin membership does not match their state and size.
    pub bin_mismatches: usize,
    /// The arena chain loops back on itself.
    pub cycle: bool,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Arena blocks in the chain.
    pub length: usize,
    /// Bytes of arena covered by the chain, headers included.
    pub arena_size: usize,
    pub free_blocks: usize,
    pub free_size: usize,
    pub used_blocks: usize,
    pub used_size: usize,
    pub standalone_blocks: usize,
    pub standalone_size: usize,
    /// Free blocks currently filed in a bin.
    pub binned: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::vec;
    use alloc::vec::Vec;

    use test_log::test;

    use crate::allocators::ToyHeap;

    #[derive(Clone, Copy)]
    #[repr(C, align(16))]
    struct Chunk([u8; 16]);

    struct Region {
        chunks: Vec<Chunk>,
    }

    impl Region {
        fn new(bytes: usize) -> Self {
            Region {
                chunks: vec![Chunk([0; 16]); bytes / 16],
            }
        }

        fn at(&mut self, offset: usize) -> NonNull<u8> {
            assert!(offset < self.chunks.len() * 16);
            NonNull::new(self.chunks.as_mut_ptr().cast::<u8>().wrapping_add(offset)).unwrap()
        }
    }

    fn list(heap: &mut ToyHeap) -> BlockList {
        let mut list = BlockList::new(16, 16, 16);
        list.reserve(heap, 64).unwrap();
        list
    }

    fn assert_valid(list: &BlockList) {
        let (validity, _) = list.stats();
        assert!(validity.is_valid(), "{:?} in {}", validity, list);
    }

    #[test]
    fn split_leaves_free_tail() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let id = unsafe { list.append_arena(region.at(0), 1024) };
        assert_eq!(list[id].size(), 1024 - HEADER_SIZE);

        let payload = list.claim(id, 0, 64, 16);
        assert_eq!(payload, region.at(HEADER_SIZE));
        assert_eq!(list[id].size(), 64);
        assert!(!list[id].is_free());

        let tail = list[id].next().unwrap();
        assert!(list[tail].is_free());
        assert_eq!(list[tail].header_addr(), region.at(HEADER_SIZE + 64).as_ptr() as usize);
        assert_eq!(list[tail].size(), 1024 - HEADER_SIZE - 64 - HEADER_SIZE);
        assert_eq!(list.tail(), Some(tail));
        assert_valid(&list);
    }

    #[test]
    fn small_surplus_is_not_split() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let id = unsafe { list.append_arena(region.at(0), 96) };
        assert_eq!(list[id].size(), 80);

        // 16 bytes left over is less than a header plus the minimum payload.
        list.claim(id, 0, 64, 16);
        assert_eq!(list[id].size(), 80);
        assert_eq!(list.len(), 1);
        assert_valid(&list);
    }

    #[test]
    fn locate_checks_guard() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let id = unsafe { list.append_arena(region.at(0), 1024) };
        let payload = list.claim(id, 0, 64, 16);
        let addr = payload.as_ptr() as usize;

        assert_eq!(list.locate(addr), Ok(id));
        assert_eq!(
            list.locate(addr + 16),
            Err(MallocError::UnknownPointer { ptr: addr + 16 })
        );

        // Scribble over the header, as an underflowing write would.
        unsafe { region.at(0).as_ptr().write_bytes(0xAA, 8) };
        assert_eq!(
            list.locate(addr),
            Err(MallocError::CorruptHeader { ptr: addr })
        );
    }

    #[test]
    fn coalesce_out_of_order() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let first = unsafe { list.append_arena(region.at(0), 4096) };

        let a = list.claim(first, 0, 64, 16);
        let b_id = list[first].next().unwrap();
        let b = list.claim(b_id, 0, 64, 16);
        let c_id = list[b_id].next().unwrap();
        let c = list.claim(c_id, 0, 64, 16);
        let rest = list[c_id].next().unwrap();
        // Keep the trailing remainder out of the picture.
        let rest_size = list[rest].size();
        list.claim(rest, 0, rest_size, 16);
        assert_eq!(list.len(), 4);

        for ptr in [a, c, b] {
            let id = list.locate(ptr.as_ptr() as usize).unwrap();
            list.mark_free(id);
            list.coalesce();
            assert_valid(&list);
        }

        assert_eq!(list.len(), 2);
        assert!(list[first].is_free());
        assert_eq!(list[first].size(), 64 * 3 + HEADER_SIZE * 2);
        // Refiled under its merged size.
        assert!(list[first].is_binned());
        assert_eq!(list.bins().members(list.table(), 13).collect::<Vec<_>>(), [first]);
    }

    #[test]
    fn aligned_claim_rekeys_payload() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let id = unsafe { list.append_arena(region.at(0), 2048) };

        let (found, padding) = list.find_fit(112, 256).unwrap();
        assert_eq!(found, id);
        let payload = list.claim(found, padding, 112, 256);
        let addr = payload.as_ptr() as usize;
        assert_eq!(addr % 256, 0);
        assert_eq!(list.locate(addr), Ok(id));
        assert_eq!(list[id].usable(), 112);

        list.mark_free(id);
        assert_eq!(list[id].padding(), 0);
        if padding != 0 {
            assert!(list.locate(addr).is_err());
        }
        assert_eq!(list.locate(list[id].payload_addr()), Ok(id));
        list.coalesce();
        assert_eq!(list.len(), 1);
        assert_valid(&list);
    }

    #[test]
    fn grow_in_place_absorbs_free_neighbour() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let id = unsafe { list.append_arena(region.at(0), 1024) };
        list.claim(id, 0, 64, 16);

        assert!(list.grow_in_place(id, 512));
        assert_eq!(list[id].size(), 512);
        let tail = list[id].next().unwrap();
        assert!(list[tail].is_free());
        assert_valid(&list);

        // Nothing left behind the block that could hold this much.
        assert!(!list.grow_in_place(id, 4096));
    }

    #[test]
    fn metadata_goes_back_to_the_grower() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        // One mapping for the block table, one for the payload index.
        assert_eq!(heap.live_tables, 2);

        let id = unsafe { list.append_arena(region.at(0), 1024) };
        let payload = list.claim(id, 0, 64, 16);
        assert_eq!(list.table().len(), 2);

        list.release_metadata(&mut heap);
        assert_eq!(heap.live_tables, 0);
        assert!(list.is_empty());
        assert_eq!(list.table().len(), 0);
        assert_eq!(
            list.locate(payload.as_ptr() as usize),
            Err(MallocError::UnknownPointer {
                ptr: payload.as_ptr() as usize
            })
        );
    }

    #[test]
    fn traversal_is_bounded() {
        let mut region = Region::new(4096);
        let mut heap = ToyHeap::default();
        let mut list = list(&mut heap);
        let a = unsafe { list.append_arena(region.at(0), 64) };
        let b = unsafe { list.append_arena(region.at(1024), 64) };
        assert_eq!(list.iter().map(|(id, _)| id).collect::<Vec<_>>(), [a, b]);

        // Corrupt the chain into a loop; walks still finish.
        list.table[b].next = Some(a);
        let mut walk = list.iter();
        assert_eq!(walk.by_ref().count(), 2);
        assert!(walk.truncated());
        assert!(list.stats().0.cycle);
        list.coalesce();
    }
}
