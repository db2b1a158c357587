//! Getting memory from a Unix OS through libc.

use core::ptr::{null_mut, NonNull};

use errno::{errno, Errno};
use log::{debug, warn};

use crate::allocators::HeapGrower;

/// Address space reserved for the arena the first time it grows. None of it is
/// backed by memory until it is handed out.
pub const ARENA_RESERVATION: usize = 1 << 30;

/// LibcHeapGrower uses virtual memory to grow the heap upon request.
///
/// The arena lives in one reservation made with `PROT_NONE` and is made
/// accessible a few pages at a time, front to back, so successive growths are
/// contiguous the way a program break is. Large objects get anonymous mappings
/// of their own.
pub struct LibcHeapGrower {
    reservation: usize,
    base: Option<NonNull<u8>>,
    committed: usize,
    page_size: usize,
    // Just for tracking, not really needed
    pub pages: usize,
    pub growths: usize,
    pub mappings: usize,
    /// Live mappings holding the allocator's own tables.
    pub tables: usize,
}

// The reservation is owned exclusively by this grower.
unsafe impl Send for LibcHeapGrower {}

impl Default for LibcHeapGrower {
    fn default() -> Self {
        LibcHeapGrower::new()
    }
}

impl LibcHeapGrower {
    pub const fn new() -> Self {
        LibcHeapGrower::with_reservation(ARENA_RESERVATION)
    }

    /// A grower whose arena can never exceed `reservation` bytes (rounded up
    /// to whole pages).
    pub const fn with_reservation(reservation: usize) -> Self {
        LibcHeapGrower {
            reservation,
            base: None,
            committed: 0,
            page_size: 0,
            pages: 0,
            growths: 0,
            mappings: 0,
            tables: 0,
        }
    }

    pub fn page_size(&mut self) -> usize {
        if self.page_size == 0 {
            self.page_size = sysconf::page::pagesize();
        }
        self.page_size
    }

    /// Bytes of the arena made accessible so far.
    pub fn committed(&self) -> usize {
        self.committed
    }

    fn round_to_pages(&mut self, size: usize) -> Result<usize, Errno> {
        let page = self.page_size();
        size.checked_add(page - 1)
            .map(|n| n / page * page)
            .ok_or(Errno(libc::ENOMEM))
    }

    unsafe fn reserve(&mut self) -> Result<NonNull<u8>, Errno> {
        if let Some(base) = self.base {
            return Ok(base);
        }
        let reservation = self.round_to_pages(self.reservation)?;
        let ptr = libc::mmap(
            null_mut(),
            reservation,
            // Nothing is accessible until it is committed.
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(errno());
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Errno(libc::ENOMEM))?;
        debug!("reserved {} bytes of address space at {:p}", reservation, base);

        self.reservation = reservation;
        self.base = Some(base);
        Ok(base)
    }

    unsafe fn map_anonymous(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        let len = self.round_to_pages(size.max(1))?;
        let ptr = libc::mmap(
            null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(errno());
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(Errno(libc::ENOMEM))?;
        Ok((ptr, len))
    }
}

impl HeapGrower for LibcHeapGrower {
    type Err = Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        let base = self.reserve()?;
        let to_allocate = self.round_to_pages(size.max(1))?;
        if to_allocate > self.reservation - self.committed {
            warn!(
                "arena reservation exhausted: {} of {} bytes in use",
                self.committed, self.reservation
            );
            return Err(Errno(libc::ENOMEM));
        }

        let start = base.as_ptr().add(self.committed);
        if libc::mprotect(
            start.cast(),
            to_allocate,
            libc::PROT_READ | libc::PROT_WRITE,
        ) != 0
        {
            return Err(errno());
        }

        self.committed += to_allocate;
        self.pages += to_allocate / self.page_size;
        self.growths += 1;
        Ok((NonNull::new_unchecked(start), to_allocate))
    }

    unsafe fn map_standalone(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        let mapping = self.map_anonymous(size)?;
        self.mappings += 1;
        Ok(mapping)
    }

    unsafe fn unmap_standalone(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr().cast(), len) != 0 {
            return Err(errno());
        }
        self.mappings -= 1;
        Ok(())
    }

    unsafe fn map_metadata(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        let mapping = self.map_anonymous(size)?;
        self.tables += 1;
        Ok(mapping)
    }

    unsafe fn unmap_metadata(&mut self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        if libc::munmap(ptr.as_ptr().cast(), len) != 0 {
            return Err(errno());
        }
        self.tables -= 1;
        Ok(())
    }
}

impl Drop for LibcHeapGrower {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            if unsafe { libc::munmap(base.as_ptr().cast(), self.reservation) } != 0 {
                warn!("releasing the arena reservation failed: {}", errno());
            }
        }
    }
}
