#![no_std]

//! A basic memory allocator.
//!
//! Small and medium requests are carved out of a contiguous arena that only
//! ever grows. Free space is found first-fit, with size-classed bins in front
//! for small sizes, and free neighbours merge as soon as a block is released.
//! Large requests get a mapping of their own, returned to the OS on release.
//!
//! The engine is [`RawAlloc`], generic over where memory comes from
//! ([`HeapGrower`]). This module also exposes a process-wide instance through
//! C-style free functions:
//!
//! ```no_run
//! let p = basic_malloc::malloc(100);
//! assert!(!p.is_null());
//! basic_malloc::free(p);
//! assert_eq!(basic_malloc::count_live_blocks(), 0);
//! ```
//!
//! Block metadata lives in memory the allocator maps for itself, so it never
//! leans on another allocator. [`UnixAllocator`] also implements
//! `GlobalAlloc` and can be installed as the `#[global_allocator]`.

extern crate alloc;
#[cfg(test)]
extern crate std;

use core::ptr::{null_mut, NonNull};

pub mod allocators;
pub mod bins;
pub mod blocklist;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod metadata;
pub mod unix;

pub use allocators::{GenericAllocator, HeapGrower, RawAlloc, ToyHeap, UnixAllocator};
pub use blocklist::{BlockList, Stats, Validity, HEADER_SIZE};
pub use config::Config;
pub use diagnostics::{HexDump, LeakReport};
pub use error::{ErrorKind, MallocError};
pub use unix::LibcHeapGrower;

/// The process-wide allocator behind the free functions in this module.
pub static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Failures are logged where they happen; the C-style surface only reports null.
fn into_raw(result: Result<Option<NonNull<u8>>, MallocError>) -> *mut u8 {
    match result {
        Ok(Some(ptr)) => ptr.as_ptr(),
        Ok(None) | Err(_) => null_mut(),
    }
}

/// Allocate `size` bytes aligned to 16. Returns null for a zero size or when
/// memory is exhausted.
pub fn malloc(size: usize) -> *mut u8 {
    into_raw(ALLOCATOR.lock().allocate(size))
}

/// Release memory from any allocating function here. Null is ignored, and so
/// is anything that is not a live allocation (after logging it).
pub fn free(ptr: *mut u8) {
    let _ = ALLOCATOR.lock().release(ptr);
}

/// Allocate zeroed room for `count` objects of `size` bytes.
pub fn calloc(count: usize, size: usize) -> *mut u8 {
    into_raw(ALLOCATOR.lock().allocate_zeroed(count, size))
}

/// Resize an allocation. On failure the original allocation is untouched and
/// null is returned.
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    into_raw(ALLOCATOR.lock().reallocate(ptr, size))
}

/// Allocate `size` bytes aligned to `alignment`, a power of two.
pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    into_raw(ALLOCATOR.lock().allocate_aligned(alignment, size))
}

/// Release memory from `aligned_alloc` or `posix_memalign`.
pub fn aligned_free(ptr: *mut u8) {
    let _ = ALLOCATOR.lock().release_aligned(ptr);
}

/// Returns 0 and stores the allocation in `out`, or returns `EINVAL`/`ENOMEM`.
pub fn posix_memalign(out: &mut *mut u8, alignment: usize, size: usize) -> i32 {
    ALLOCATOR.lock().posix_memalign(out, alignment, size)
}

/// Usable bytes at `ptr`; 0 for null or unknown pointers.
pub fn malloc_usable_size(ptr: *mut u8) -> usize {
    ALLOCATOR.lock().usable_size(ptr).unwrap_or(0)
}

/// Number of allocations not yet released.
pub fn count_live_blocks() -> usize {
    ALLOCATOR.lock().count_live_blocks()
}

/// Log and return a summary of what is still allocated.
pub fn report_leaks() -> LeakReport {
    ALLOCATOR.lock().report_leaks()
}

/// Hex dump of `len` bytes at `ptr`, for `Display`ing.
///
/// # Safety
///
/// The range must be readable while the dump is alive.
pub unsafe fn dump_bytes<'a>(ptr: *const u8, len: usize) -> HexDump<'a> {
    diagnostics::dump_bytes(ptr, len)
}
