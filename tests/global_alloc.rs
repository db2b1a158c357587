//! `UnixAllocator` installed as the program's global allocator.
//!
//! Everything in this binary, the test harness included, allocates through
//! it. No logger is set up: records are written under the allocator's lock,
//! so a logger that allocates would deadlock.

use std::collections::{BTreeMap, HashMap};
use std::thread;

use basic_malloc::UnixAllocator;

#[global_allocator]
static GLOBAL: UnixAllocator = UnixAllocator::new();

#[test]
fn collections_run_on_the_allocator() {
    {
        let mut numbers: Vec<u64> = (0..10_000).collect();
        numbers.retain(|n| n % 3 == 0);
        let text: String = numbers.iter().map(|n| n.to_string()).collect();
        assert!(text.starts_with("036912"));

        let mut by_length: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for word in text.split('9') {
            by_length.entry(word.len()).or_default().push(word.to_owned());
        }
        assert!(!by_length.is_empty());

        // Large enough for a standalone mapping.
        let big = vec![0xA5u8; 1 << 20];
        assert!(big.iter().all(|&b| b == 0xA5));

        #[repr(align(4096))]
        struct Page([u8; 4096]);
        let page = Box::new(Page([1; 4096]));
        assert_eq!(&*page as *const Page as usize % 4096, 0);
        assert_eq!(page.0[4095], 1);
    }

    let (validity, _) = GLOBAL.stats();
    assert!(validity.is_valid(), "{:?}", validity);
    assert!(GLOBAL.lock().count_live_blocks() > 0);
}

#[test]
fn threads_share_the_allocator() {
    let workers: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                let mut map = HashMap::new();
                for i in 0..2000u32 {
                    map.insert(i, vec![t as u8; (i % 97) as usize + 1]);
                    if i % 5 == 0 {
                        map.remove(&(i / 2));
                    }
                }
                map.values().map(Vec::len).sum::<usize>()
            })
        })
        .collect();

    for worker in workers {
        assert!(worker.join().unwrap() > 0);
    }
    assert!(GLOBAL.stats().0.is_valid());
}
