//! End-to-end behaviour of the allocator on real OS memory.

use core::ptr::{self, null_mut};

use basic_malloc::{ErrorKind, LibcHeapGrower, MallocError, RawAlloc, HEADER_SIZE};

use test_log::test;

fn os_alloc() -> RawAlloc<LibcHeapGrower> {
    RawAlloc::new(LibcHeapGrower::with_reservation(64 * 1024 * 1024))
}

fn alloc(allocator: &mut RawAlloc<LibcHeapGrower>, size: usize) -> *mut u8 {
    allocator.allocate(size).unwrap().unwrap().as_ptr()
}

fn assert_valid(allocator: &RawAlloc<LibcHeapGrower>) {
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid(), "{:?}: {}", validity, allocator.blocks);
    assert_eq!(stats.arena_size, allocator.grower.committed());
}

#[test]
fn allocations_are_aligned_and_writable() {
    let mut allocator = os_alloc();
    let base = allocator.config().base_alignment;

    let mut live = Vec::new();
    for size in (1..2000).step_by(37).chain([4095, 4096, 4097, 200_000]) {
        let p = alloc(&mut allocator, size);
        assert_eq!(p as usize % base, 0, "size {}", size);
        unsafe { p.write_bytes(0xC3, size) };
        live.push(p);
    }
    assert_valid(&allocator);
    for p in live {
        allocator.release(p).unwrap();
    }
    assert_eq!(allocator.count_live_blocks(), 0);
}

#[test]
fn aligned_allocations_honour_alignment() {
    let mut allocator = os_alloc();
    let mut live = Vec::new();
    for shift in 0..=16 {
        let align = 1usize << shift;
        for &size in &[1, 18, 100, 5000] {
            let p = allocator.allocate_aligned(align, size).unwrap().unwrap().as_ptr();
            assert_eq!(p as usize % align, 0, "{}@{}", size, align);
            unsafe { p.write_bytes(0x7E, size) };
            live.push(p);
        }
    }
    assert_valid(&allocator);
    for p in live {
        allocator.release_aligned(p).unwrap();
    }
    assert_eq!(allocator.blocks.len(), 1);
    assert_valid(&allocator);
}

#[test]
fn aligned_32_round_trips_18_bytes() {
    let mut allocator = os_alloc();
    let p = allocator.allocate_aligned(32, 18).unwrap().unwrap().as_ptr();
    assert_eq!(p as usize % 32, 0);

    let written: Vec<u8> = (0..18).map(|i| 200 - i).collect();
    let mut read = [0u8; 18];
    unsafe {
        ptr::copy_nonoverlapping(written.as_ptr(), p, 18);
        ptr::copy_nonoverlapping(p, read.as_mut_ptr(), 18);
    }
    assert_eq!(&read[..], &written[..]);
    allocator.release(p).unwrap();
}

#[test]
fn round_trip_leaves_counter_unchanged() {
    let mut allocator = os_alloc();
    let _held = alloc(&mut allocator, 64);
    for &size in &[1, 64, 1000, 128 * 1024 - 1, 128 * 1024, 1 << 20] {
        let before = allocator.count_live_blocks();
        let p = alloc(&mut allocator, size);
        allocator.release(p).unwrap();
        assert_eq!(allocator.count_live_blocks(), before);
    }
}

#[test]
fn double_release_is_detected() {
    let mut allocator = os_alloc();
    let a = alloc(&mut allocator, 48);
    let _b = alloc(&mut allocator, 48);
    allocator.release(a).unwrap();

    let err = allocator.release(a).unwrap_err();
    assert_eq!(err, MallocError::DoubleFree { ptr: a as usize });
    assert_eq!(err.kind(), ErrorKind::CorruptionDetected);
    assert_valid(&allocator);

    // A released standalone mapping is forgotten entirely.
    let big = alloc(&mut allocator, 1 << 20);
    allocator.release(big).unwrap();
    assert_eq!(
        allocator.release(big),
        Err(MallocError::UnknownPointer { ptr: big as usize })
    );
}

#[test]
fn freeing_a_c_b_leaves_one_span() {
    let mut allocator = os_alloc();
    let a = alloc(&mut allocator, 100);
    let b = alloc(&mut allocator, 200);
    let c = alloc(&mut allocator, 300);

    allocator.release(a).unwrap();
    allocator.release(c).unwrap();
    assert!(allocator.blocks.len() >= 2);
    allocator.release(b).unwrap();

    // Everything, including the unused tail of the arena, is one free block.
    let blocks: Vec<_> = allocator.blocks.iter().collect();
    assert_eq!(blocks.len(), 1);
    let (_, block) = blocks[0];
    assert!(block.is_free());
    assert_eq!(block.payload_addr(), a as usize);
    assert_eq!(block.size() + HEADER_SIZE, allocator.grower.committed());
    assert_valid(&allocator);
}

#[test]
fn split_creates_reachable_remainder() {
    let mut allocator = os_alloc();
    let s = 256 * 3;
    let k = 4096;
    let big = alloc(&mut allocator, s + k);
    let _fence = alloc(&mut allocator, 16);
    allocator.release(big).unwrap();

    let used = alloc(&mut allocator, s);
    assert_eq!(used, big);
    let id = allocator.blocks.locate(used as usize).unwrap();
    assert_eq!(allocator.blocks[id].size(), s);

    let rest = allocator.blocks[id].next().unwrap();
    assert!(allocator.blocks[rest].is_free());
    assert_eq!(allocator.blocks[rest].size(), k - HEADER_SIZE);
    assert!(allocator.blocks.iter().any(|(found, _)| found == rest));
    assert_valid(&allocator);
}

#[test]
fn large_object_threshold_boundary() {
    let mut allocator = os_alloc();
    let threshold = allocator.config().large_object_threshold;

    let below = alloc(&mut allocator, threshold - 1);
    let id = allocator.blocks.locate(below as usize).unwrap();
    assert!(!allocator.blocks[id].is_mapped_independently());
    assert_eq!(allocator.grower.mappings, 0);

    let at = alloc(&mut allocator, threshold);
    let id = allocator.blocks.locate(at as usize).unwrap();
    assert!(allocator.blocks[id].is_mapped_independently());
    assert_eq!(allocator.grower.mappings, 1);

    let arena = allocator.stats().1;
    allocator.release(at).unwrap();
    assert_eq!(allocator.grower.mappings, 0);
    let after = allocator.stats().1;
    assert_eq!(after.standalone_blocks, 0);
    // Nothing went back into the arena.
    assert_eq!(after.length, arena.length);
    assert_eq!(after.free_size, arena.free_size);
    allocator.release(below).unwrap();
}

#[test]
fn freed_small_blocks_are_reused() {
    let mut allocator = os_alloc();
    let a = alloc(&mut allocator, 10);
    let b = alloc(&mut allocator, 20);
    let c = alloc(&mut allocator, 30);

    let ranges = [(a, 10), (b, 20), (c, 30)];
    for (i, &(p, n)) in ranges.iter().enumerate() {
        for &(q, m) in &ranges[i + 1..] {
            let (p, q) = (p as usize, q as usize);
            assert!(p + n <= q || q + m <= p, "overlap");
        }
    }

    allocator.release(a).unwrap();
    allocator.release(b).unwrap();
    allocator.release(c).unwrap();
    let committed = allocator.grower.committed();

    let d = alloc(&mut allocator, 55);
    assert_eq!(d, a);
    assert_eq!(allocator.grower.committed(), committed);
    assert_eq!(allocator.grower.growths, 1);
}

#[test]
fn zero_size_is_benign() {
    let mut allocator = os_alloc();
    let before = allocator.count_live_blocks();
    assert_eq!(allocator.allocate(0), Ok(None));
    assert_eq!(allocator.count_live_blocks(), before);

    let mut out = null_mut();
    assert_eq!(allocator.posix_memalign(&mut out, 64, 0), 0);
    assert!(out.is_null());
}

#[test]
fn reallocation_moves_data() {
    let mut allocator = os_alloc();
    let p = alloc(&mut allocator, 32);
    for i in 0..32 {
        unsafe { *p.add(i) = i as u8 };
    }
    let _fence = alloc(&mut allocator, 32);

    let q = allocator.reallocate(p, 3000).unwrap().unwrap().as_ptr();
    let r = allocator.reallocate(q, 300_000).unwrap().unwrap().as_ptr();
    let s = allocator.reallocate(r, 300_001).unwrap().unwrap().as_ptr();
    assert_eq!(r, s);
    for i in 0..32 {
        assert_eq!(unsafe { *s.add(i) }, i as u8);
    }
    assert_eq!(allocator.reallocate(s, 0), Ok(None));
    assert_eq!(allocator.count_live_blocks(), 1);
}

#[test]
fn exhausting_the_arena_is_recoverable() {
    let mut allocator = RawAlloc::new(LibcHeapGrower::with_reservation(64 * 1024));
    let p = alloc(&mut allocator, 1000);
    let err = allocator.allocate(100_000).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    assert!(allocator.usable_size(p).unwrap() >= 1000);

    // Large objects don't come from the arena at all.
    let big = alloc(&mut allocator, 1 << 20);
    allocator.release(big).unwrap();
    allocator.release(p).unwrap();
}
