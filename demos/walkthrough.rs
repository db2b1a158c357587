//! Drives the process-wide allocator through a mix of allocations, printing
//! the heap, a few hex dumps and the leak report along the way.
//!
//! Run with `RUST_LOG=debug` to see arena growth and mapping traffic.

use basic_malloc::{
    aligned_alloc, count_live_blocks, dump_bytes, free, malloc, realloc, report_leaks, ALLOCATOR,
};

use rand::distributions::{Distribution, Uniform};
use rand::{RngCore, SeedableRng};

// Total number of allocations / deallocations
const ALLOCATIONS: usize = 8 * 1024;
// Log_2 of the maximum sized object to allocate
const LOG2_MAX_SIZE: u32 = 18;

fn print_state(label: &str) {
    let (validity, stats) = ALLOCATOR.stats();
    println!("{}:", label);
    println!("    live blocks: {}", count_live_blocks());
    println!("    stats:       {:?}", stats);
    assert!(validity.is_valid(), "{:?}", validity);
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [ALLOCATIONS] [LOG2_MAX_SIZE]", args[0]);
        return;
    }
    let allocations: usize = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(ALLOCATIONS);
    let log2_max_size: u32 = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE)
        .clamp(4, 24);

    env_logger::init();

    let greeting = malloc(32);
    let text = b"Hello from basic_malloc!";
    unsafe { greeting.copy_from_nonoverlapping(text.as_ptr(), text.len()) };
    println!("{}", unsafe { dump_bytes(greeting, 32) });

    let aligned = aligned_alloc(4096, 100);
    println!("aligned_alloc(4096, 100) = {:p}", aligned);
    let greeting = realloc(greeting, 300_000);
    println!("realloc to 300000 bytes moved the greeting to {:p}:", greeting);
    println!("{}", unsafe { dump_bytes(greeting, text.len()) });
    print_state("After setup");

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let exponent = Uniform::new_inclusive(0, log2_max_size);
    let coin = Uniform::new(0u8, 3);

    let mut live: Vec<*mut u8> = Vec::new();
    for i in 1..=allocations {
        if live.is_empty() || coin.sample(&mut rng) != 0 {
            let size = 1usize << exponent.sample(&mut rng);
            let p = malloc(size);
            assert!(!p.is_null());
            unsafe { p.write_bytes(i as u8, size) };
            live.push(p);
        } else {
            let ix = Uniform::new(0, live.len()).sample(&mut rng);
            free(live.swap_remove(ix));
        }
        if i % 2048 == 0 {
            print_state(&format!("Step {} / {}", i, allocations));
        }
    }

    for p in live {
        free(p);
    }
    free(aligned);
    print_state("After freeing the random objects");

    // The greeting is deliberately still live here.
    println!("{}", report_leaks());
    free(greeting);
    println!("{}", report_leaks());
    print_state("Finished");
}
