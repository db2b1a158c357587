//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager. It owns the arena chain, the
//! small-object bins and the standalone mappings, and implements `malloc`,
//! `free`, `realloc`, aligned allocation and friends on top of a
//! [`HeapGrower`].
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` in a spin lock so one instance can be
//! shared process-wide. Every operation holds the lock for its whole duration.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the calls to the OS: extending the arena, and
//! creating or destroying standalone mappings for large objects.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a pair of fixed buffers that pretend to be the OS, implementing
//! `HeapGrower`. It is deterministic, which makes it useful for testing.
//!
//! Block metadata lives in memory from the `HeapGrower` too, so nothing here
//! calls into another allocator, and a `GenericAllocator` can be installed as
//! the `#[global_allocator]`.

use alloc::boxed::Box;
use alloc::vec;
use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use log::{debug, error, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::blocklist::{BlockId, BlockList, Mapping, Stats, Validity, HEADER_SIZE};
use crate::config::{align_up, Config};
use crate::error::MallocError;
use crate::unix::LibcHeapGrower;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    ((value - 1) / increment + 1).checked_mul(increment)
}

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Extend the arena by at least `size` bytes. Returns a pointer and the
    /// size of the memory available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this module:
    ///
    /// - The returned range must be at least `size` bytes, aligned to
    ///   `HEADER_SIZE`, a multiple of `HEADER_SIZE` long, readable and
    ///   writable, and untracked by any other code, including the allocator
    ///   itself.
    /// - Successive ranges should follow each other directly in memory, so
    ///   free space at the end of the arena can merge with the next extension.
    ///   This is not required for correctness.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Create an independent mapping of at least `size` bytes.
    ///
    /// # Safety
    ///
    /// The same requirements as `grow_heap` apply, except for contiguity.
    unsafe fn map_standalone(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Return a mapping created by `map_standalone`.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly as returned by `map_standalone`, and
    /// nothing may touch the memory afterwards.
    unsafe fn unmap_standalone(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err>;

    /// Map at least `size` bytes for the allocator's own tables.
    ///
    /// # Safety
    ///
    /// The same requirements as `map_standalone` apply.
    unsafe fn map_metadata(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Return a mapping created by `map_metadata`.
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must be exactly as returned by `map_metadata`, and
    /// nothing may touch the memory afterwards.
    unsafe fn unmap_metadata(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Self::Err>;
}

/// A raw allocator, capable of growing the heap, returning pointers to new
/// allocations, and tracking and reusing freed memory.
///
/// Arena memory is never returned to the OS; large objects get their own
/// mappings, which are returned as soon as they are released.
pub struct RawAlloc<G: HeapGrower> {
    pub grower: G,
    pub blocks: BlockList,
    config: Config,
    live: usize,
}

impl<G: HeapGrower> Drop for RawAlloc<G> {
    fn drop(&mut self) {
        loop {
            let next = self.blocks.standalone().next().map(|(id, _)| id);
            let mapping = match next.and_then(|id| self.blocks.remove_standalone(id)) {
                Some(mapping) => mapping,
                None => break,
            };
            let result = unsafe { self.grower.unmap_standalone(mapping.base, mapping.len) };
            if let Err(err) = result {
                warn!("unmapping {:p} on teardown failed: {:?}", mapping.base, err);
            }
        }
        if self.live != 0 {
            debug!("allocator dropped with {} live blocks", self.live);
        }
        self.blocks.release_metadata(&mut self.grower);
    }
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Create a new `RawAlloc` with the default configuration.
    pub const fn new(grower: G) -> Self {
        let config = Config::DEFAULT;
        RawAlloc {
            grower,
            blocks: BlockList::new(
                config.small_object_bin_width,
                config.bin_count,
                config.min_split_payload,
            ),
            config,
            live: 0,
        }
    }

    pub fn with_config(grower: G, config: Config) -> Result<Self, MallocError> {
        config.validate()?;
        Ok(RawAlloc {
            grower,
            blocks: BlockList::new(
                config.small_object_bin_width,
                config.bin_count,
                config.min_split_payload,
            ),
            config,
            live: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of allocations handed out and not yet released.
    pub fn count_live_blocks(&self) -> usize {
        self.live
    }

    /// Get statistics on this allocator, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    ////////////////////////////////////////////////////////////
    // Allocation

    /// Allocate `size` bytes at the base alignment.
    ///
    /// A zero-sized request succeeds with no pointer.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, MallocError> {
        if size == 0 {
            return Ok(None);
        }
        let align = self.config.base_alignment;
        self.allocate_with(size, align).map(Some)
    }

    /// Allocate `size` bytes at an address that is a multiple of `alignment`,
    /// which must be a power of two. The result is released with
    /// [`release`](Self::release) like any other allocation.
    pub fn allocate_aligned(
        &mut self,
        alignment: usize,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, MallocError> {
        if !alignment.is_power_of_two() {
            return Err(MallocError::InvalidAlignment { alignment });
        }
        if size == 0 {
            return Ok(None);
        }
        let align = alignment.max(self.config.base_alignment);
        self.allocate_with(size, align).map(Some)
    }

    /// Allocate room for `count` objects of `size` bytes each, zero-filled.
    pub fn allocate_zeroed(
        &mut self,
        count: usize,
        size: usize,
    ) -> Result<Option<NonNull<u8>>, MallocError> {
        let total = count
            .checked_mul(size)
            .ok_or(MallocError::CountOverflow { count, size })?;
        let ptr = self.allocate(total)?;
        if let Some(p) = ptr {
            unsafe { p.as_ptr().write_bytes(0, total) };
        }
        Ok(ptr)
    }

    /// The `posix_memalign` contract: 0 on success with the pointer stored in
    /// `out`, otherwise an errno value with `out` untouched. The alignment
    /// must also be a multiple of the pointer size.
    pub fn posix_memalign(&mut self, out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
        if !alignment.is_power_of_two() || alignment % core::mem::size_of::<*mut u8>() != 0 {
            return libc::EINVAL;
        }
        match self.allocate_aligned(alignment, size) {
            Ok(ptr) => {
                *out = ptr.map_or(null_mut(), NonNull::as_ptr);
                0
            }
            Err(err) => err.errno(),
        }
    }

    fn allocate_with(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MallocError> {
        let rounded =
            align_up(size, self.config.base_alignment).ok_or(MallocError::SizeOverflow { size })?;
        // At most one block for fresh arena space and one split remainder.
        self.blocks.reserve(&mut self.grower, 2)?;

        let ptr = if size >= self.config.large_object_threshold {
            self.map_standalone(rounded, align)?
        } else {
            self.allocate_arena(rounded, align)?
        };
        self.live += 1;
        Ok(ptr)
    }

    fn allocate_arena(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MallocError> {
        if let Some((id, padding)) = self.blocks.pop_bin(size, align) {
            trace!("bin hit for {} bytes", size);
            return Ok(self.blocks.claim(id, padding, size, align));
        }

        let (id, padding) = match self.blocks.find_fit(size, align) {
            Some(found) => found,
            None => self.extend_arena(size, align)?,
        };
        Ok(self.blocks.claim(id, padding, size, align))
    }

    /// Grow the arena enough to carve out `size` bytes at alignment `align`,
    /// returning the free block to carve from and the padding it needs.
    fn extend_arena(&mut self, size: usize, align: usize) -> Result<(BlockId, usize), MallocError> {
        let request = size
            .checked_add(align - HEADER_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(MallocError::SizeOverflow { size })?;

        let (ptr, len) = unsafe { self.grower.grow_heap(request) }.map_err(|err| {
            warn!("growing the arena by {} bytes failed: {:?}", request, err);
            MallocError::OutOfMemory { size }
        })?;
        if len < request || ptr.as_ptr() as usize % HEADER_SIZE != 0 || len % HEADER_SIZE != 0 {
            error!("heap grower returned an unusable range {:p}+{}", ptr, len);
            return Err(MallocError::OutOfMemory { size });
        }
        debug!("arena grew by {} bytes at {:p}", len, ptr);

        let start = ptr.as_ptr() as usize;
        let contiguous = match self.blocks.tail() {
            Some(tail) => {
                let block = &self.blocks[tail];
                block.is_free() && block.as_range().end == start
            }
            None => false,
        };
        let extended = if contiguous {
            unsafe { self.blocks.extend_tail(len) }
        } else {
            None
        };
        let id = match extended {
            Some(id) => id,
            None => unsafe { self.blocks.append_arena(ptr, len) },
        };

        self.blocks[id]
            .fits(size, align)
            .map(|padding| (id, padding))
            .ok_or(MallocError::OutOfMemory { size })
    }

    /// Give a large object its own mapping.
    fn map_standalone(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, MallocError> {
        let request = size
            .checked_add(align - HEADER_SIZE)
            .and_then(|n| n.checked_add(HEADER_SIZE))
            .ok_or(MallocError::SizeOverflow { size })?;

        let (base, len) = unsafe { self.grower.map_standalone(request) }.map_err(|err| {
            warn!("mapping {} bytes failed: {:?}", request, err);
            MallocError::OutOfMemory { size }
        })?;

        let start = base.as_ptr() as usize + HEADER_SIZE;
        let aligned_base = base.as_ptr() as usize % HEADER_SIZE == 0;
        let padding = align_up(start, align).map(|aligned| aligned - start);
        let padding = match padding {
            Some(p) if aligned_base && p + size + HEADER_SIZE <= len => p,
            _ => {
                error!("heap grower returned an unusable mapping {:p}+{}", base, len);
                if let Err(err) = unsafe { self.grower.unmap_standalone(base, len) } {
                    warn!("unmapping {:p} failed: {:?}", base, err);
                }
                return Err(MallocError::OutOfMemory { size });
            }
        };

        let id = unsafe { self.blocks.insert_standalone(Mapping { base, len }, padding, align) };
        let payload = self.blocks[id].payload();
        debug!("mapped {} bytes at {:p} for {:p}", len, base, payload);
        Ok(payload)
    }

    ////////////////////////////////////////////////////////////
    // Deallocation

    /// Release an allocation. Null is ignored.
    ///
    /// Releasing anything that is not a live allocation from this allocator
    /// (a double free, a pointer into the middle of a block, a block whose
    /// header was overwritten) is refused without touching any state, and
    /// logged as an error.
    pub fn release(&mut self, ptr: *mut u8) -> Result<(), MallocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let id = self.live_block(ptr)?;

        if let Some(mapping) = self.blocks.remove_standalone(id) {
            let result = unsafe { self.grower.unmap_standalone(mapping.base, mapping.len) };
            match result {
                Ok(()) => debug!("unmapped {} bytes at {:p}", mapping.len, mapping.base),
                Err(err) => warn!("unmapping {:p} failed: {:?}", mapping.base, err),
            }
        } else {
            self.blocks.mark_free(id);
            self.blocks.coalesce();
        }
        self.live -= 1;
        Ok(())
    }

    /// Same as [`release`](Self::release); aligned allocations need no special
    /// treatment.
    pub fn release_aligned(&mut self, ptr: *mut u8) -> Result<(), MallocError> {
        self.release(ptr)
    }

    /// Resize an allocation, moving it if it cannot grow in place.
    ///
    /// A null `ptr` behaves like [`allocate`](Self::allocate); a zero
    /// `new_size` releases `ptr` and returns no pointer. Moved allocations keep
    /// their alignment and their first `min(old, new)` bytes.
    pub fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, MallocError> {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }

        let id = self.live_block(ptr)?;
        let block = &self.blocks[id];
        let (usable, align) = (block.usable(), block.alignment());
        if new_size <= usable {
            return Ok(NonNull::new(ptr));
        }

        let rounded = align_up(new_size, self.config.base_alignment)
            .ok_or(MallocError::SizeOverflow { size: new_size })?;
        if new_size < self.config.large_object_threshold {
            self.blocks.reserve(&mut self.grower, 1)?;
            if self.blocks.grow_in_place(id, rounded) {
                trace!("grew {:p} in place to {} bytes", ptr, rounded);
                return Ok(NonNull::new(ptr));
            }
        }

        let moved = self.allocate_with(new_size, align)?;
        unsafe { ptr::copy_nonoverlapping(ptr, moved.as_ptr(), usable) };
        self.release(ptr)?;
        Ok(Some(moved))
    }

    /// Bytes usable at a live payload.
    pub fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        let id = self.blocks.locate(ptr as usize).ok()?;
        let block = &self.blocks[id];
        if block.is_free() {
            return None;
        }
        Some(block.usable())
    }

    /// Find the live block behind `ptr`, logging anything that indicates
    /// corruption.
    fn live_block(&self, ptr: *mut u8) -> Result<BlockId, MallocError> {
        let addr = ptr as usize;
        let id = self.blocks.locate(addr).map_err(|err| {
            error!("rejecting {:#x}: {}", addr, err);
            err
        })?;
        if self.blocks[id].is_free() {
            let err = MallocError::DoubleFree { ptr: addr };
            error!("rejecting {:#x}: {}", addr, err);
            return Err(err);
        }
        Ok(id)
    }
}

/// A thread-safe allocator, using a spin lock around a RawAlloc.
///
/// The lock is coarse: splitting and coalescing touch state shared by every
/// block, so the whole of each operation runs under it.
pub struct GenericAllocator<G: HeapGrower> {
    raw: Mutex<RawAlloc<G>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        GenericAllocator::new(RawAlloc::default())
    }
}

impl<G: HeapGrower> GenericAllocator<G> {
    pub const fn new(raw: RawAlloc<G>) -> Self {
        GenericAllocator {
            raw: Mutex::new(raw),
        }
    }

    /// Lock the underlying RawAlloc. Allocation through this allocator blocks
    /// while the guard is alive.
    pub fn lock(&self) -> MutexGuard<'_, RawAlloc<G>> {
        self.raw.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().stats()
    }
}

/// Log records are written while the lock is held, so a `GenericAllocator`
/// installed as the `#[global_allocator]` needs a logger that doesn't
/// allocate, or none at all.
unsafe impl<G: HeapGrower> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = self.lock().allocate_aligned(layout.align(), layout.size());
        result.ok().flatten().map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.lock().release(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        // Moved blocks keep the alignment they were allocated with.
        let result = self.lock().reallocate(ptr, new_size);
        result.ok().flatten().map_or(null_mut(), NonNull::as_ptr)
    }
}

/// The process-wide allocator type, backed by the OS.
///
/// ```no_run
/// use basic_malloc::UnixAllocator;
///
/// #[global_allocator]
/// static GLOBAL: UnixAllocator = UnixAllocator::new();
///
/// fn main() {
///     let numbers: Vec<u32> = (0..100).collect();
///     assert!(GLOBAL.lock().count_live_blocks() >= 1);
///     drop(numbers);
/// }
/// ```
pub struct UnixAllocator {
    alloc: GenericAllocator<LibcHeapGrower>,
}

impl Default for UnixAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(RawAlloc::new(LibcHeapGrower::new())),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RawAlloc<LibcHeapGrower>> {
        self.alloc.lock()
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

const TOY_PAGE: usize = 64;
const TOY_TABLE_CAPACITY: usize = 1024 * 1024;

#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct ToyPage([u8; TOY_PAGE]);

/// An in-memory stand-in for the OS: one buffer for the arena, handed out
/// front to back in `page_size` steps, one for standalone mappings and one for
/// metadata tables. Mappings are counted but never reused.
pub struct ToyHeap {
    /// Growth granularity; a multiple of `HEADER_SIZE`.
    pub page_size: usize,
    /// Bytes of arena handed out so far.
    pub size: usize,
    /// Bytes of mapping space handed out so far.
    pub mapped_size: usize,
    pub live_mappings: usize,
    pub unmapped_size: usize,
    /// Bytes of table space handed out so far.
    pub table_size: usize,
    pub live_tables: usize,
    arena: Box<[ToyPage]>,
    mapped: Box<[ToyPage]>,
    tables: Box<[ToyPage]>,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256 * 1024, 1024 * 1024)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToyHeapError {
    Overflow,
    NotMapped,
}

impl ToyHeap {
    pub fn new(arena_capacity: usize, mapping_capacity: usize) -> Self {
        let pages =
            |bytes: usize| vec![ToyPage([0; TOY_PAGE]); bytes / TOY_PAGE].into_boxed_slice();
        ToyHeap {
            page_size: TOY_PAGE,
            size: 0,
            mapped_size: 0,
            live_mappings: 0,
            unmapped_size: 0,
            table_size: 0,
            live_tables: 0,
            arena: pages(arena_capacity),
            mapped: pages(mapping_capacity),
            tables: pages(TOY_TABLE_CAPACITY),
        }
    }

    fn carve(
        pages: &mut [ToyPage],
        used: &mut usize,
        page_size: usize,
        size: usize,
    ) -> Result<(NonNull<u8>, usize), ToyHeapError> {
        let allocating = round_up(size, page_size).ok_or(ToyHeapError::Overflow)?;
        let capacity = pages.len() * TOY_PAGE;
        let end = used
            .checked_add(allocating)
            .filter(|&end| allocating != 0 && end <= capacity)
            .ok_or(ToyHeapError::Overflow)?;
        let ptr = pages.as_mut_ptr().cast::<u8>().wrapping_add(*used);
        *used = end;
        NonNull::new(ptr)
            .map(|p| (p, allocating))
            .ok_or(ToyHeapError::Overflow)
    }

    fn handed_out(pages: &[ToyPage], used: usize, ptr: NonNull<u8>, len: usize) -> bool {
        let start = pages.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr.checked_add(len).map_or(false, |end| end <= start + used)
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ToyHeapError> {
        ToyHeap::carve(&mut self.arena, &mut self.size, self.page_size, size)
    }

    unsafe fn map_standalone(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ToyHeapError> {
        let mapping =
            ToyHeap::carve(&mut self.mapped, &mut self.mapped_size, self.page_size, size)?;
        self.live_mappings += 1;
        Ok(mapping)
    }

    unsafe fn unmap_standalone(
        &mut self,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Result<(), ToyHeapError> {
        if !ToyHeap::handed_out(&self.mapped, self.mapped_size, ptr, len) || self.live_mappings == 0
        {
            return Err(ToyHeapError::NotMapped);
        }
        self.live_mappings -= 1;
        self.unmapped_size += len;
        Ok(())
    }

    unsafe fn map_metadata(&mut self, size: usize) -> Result<(NonNull<u8>, usize), ToyHeapError> {
        let mapping =
            ToyHeap::carve(&mut self.tables, &mut self.table_size, self.page_size, size)?;
        self.live_tables += 1;
        Ok(mapping)
    }

    unsafe fn unmap_metadata(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), ToyHeapError> {
        if !ToyHeap::handed_out(&self.tables, self.table_size, ptr, len) || self.live_tables == 0 {
            return Err(ToyHeapError::NotMapped);
        }
        self.live_tables -= 1;
        Ok(())
    }
}
