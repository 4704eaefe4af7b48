//
// Copyright 2018 yvt, all rights reserved.
//
// Licensed under the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>. This file may
// not be copied, modified,or distributed except
// according to those terms.
//
extern crate fitalloc;

use std::mem;
use std::ops;
use std::ptr::NonNull;
use std::sync::Arc;

use fitalloc::{
    AllocConfig, AllocError, BlockIntrospection, FitMode, MemorySink, MemoryResource, Severity,
    SortedListAlloc, WithFitMode, MAX_ALIGN,
};

/// Size of the per-block descriptor.
const D: usize = 2 * mem::size_of::<usize>();

struct Xorshift32(u32);

impl Xorshift32 {
    /// Returns a random integer in `[0, 0xfffffffe]`
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        !self.0
    }
    fn next_range(&mut self, range: ops::Range<u32>) -> u32 {
        let len = range.end - range.start;
        let mut mask = len - 1;
        mask |= mask >> 1;
        mask |= mask >> 2;
        mask |= mask >> 4;
        mask |= mask >> 8;
        mask |= mask >> 16;

        // Let's not care about the unbounded execution time :)
        let mut value = self.next() & mask;
        while value >= len {
            value = self.next() & mask;
        }

        value + range.start
    }
}

fn assert_coverage(al: &SortedListAlloc, payload: usize) {
    let blocks = al.blocks_info();
    let total: usize = blocks.iter().map(|b| b.size).sum();
    assert_eq!(total, payload, "coverage broken: {:?}", blocks);
}

fn assert_coalesced(al: &SortedListAlloc) {
    let blocks = al.blocks_info();
    for pair in blocks.windows(2) {
        assert!(
            pair[0].occupied || pair[1].occupied,
            "two adjacent free blocks: {:?}",
            blocks
        );
    }
}

#[test]
fn create() {
    for i in 0..64 {
        let result = SortedListAlloc::new(i);
        if i >= D + MAX_ALIGN {
            assert!(result.is_ok(), "new({}) should succeed", i);
        } else {
            assert!(
                matches!(result, Err(AllocError::InvalidSize { .. })),
                "new({}) should fail",
                i
            );
        }
    }
}

#[test]
fn requests_round_to_alignment() {
    let al = SortedListAlloc::new(1024).unwrap();
    let p = al.allocate(10).unwrap();
    assert_eq!(p.as_ptr() as usize % MAX_ALIGN, 0);

    let sizes: Vec<_> = al
        .blocks_info()
        .iter()
        .map(|b| (b.size, b.occupied))
        .collect();
    assert_eq!(sizes, vec![(MAX_ALIGN + D, true), (1024 - MAX_ALIGN - D, false)]);
    assert_coverage(&al, 1024);
    al.deallocate(p).unwrap();
}

#[test]
fn allocate_two() {
    for i in 1..32 {
        for k in 1..i {
            let size = 3 * D + 16 * i + 16;
            println!("new({})", size);
            let al = SortedListAlloc::new(size).unwrap();
            println!("  alloc({})", 16 * k);
            let result1 = al.allocate(16 * k);
            assert!(result1.is_ok());
            println!("  alloc({})", 16 * (i - k));
            let result2 = al.allocate(16 * (i - k));
            assert!(result2.is_ok());
            assert_coverage(&al, size);
        }
    }
}

/// Carve the arena into alternating holes: frees of 96, 192 and 48
/// payload bytes separated by occupied pads, with the tail fully
/// occupied.
fn three_holes(
    al: &SortedListAlloc,
) -> (NonNull<u8>, NonNull<u8>, NonNull<u8>) {
    let a = al.allocate(96).unwrap();
    let _b = al.allocate(16).unwrap();
    let c = al.allocate(192).unwrap();
    let _d = al.allocate(16).unwrap();
    let e = al.allocate(48).unwrap();
    let _f = al.allocate(16).unwrap();
    // Exactly the tail: 1024 minus six blocks (384 payload + 6 D) minus
    // the tail's own descriptor.
    let _g = al.allocate(1024 - 384 - 7 * D).unwrap();
    al.deallocate(a).unwrap();
    al.deallocate(c).unwrap();
    al.deallocate(e).unwrap();
    (a, c, e)
}

#[test]
fn first_fit_takes_lowest_hole() {
    let al = SortedListAlloc::new(1024).unwrap();
    let (a, _c, _e) = three_holes(&al);
    al.set_fit_mode(FitMode::First);
    let p = al.allocate(30).unwrap();
    assert_eq!(p, a);
    assert_coverage(&al, 1024);
}

#[test]
fn best_fit_takes_tightest_hole() {
    let al = SortedListAlloc::new(1024).unwrap();
    let (_a, _c, e) = three_holes(&al);
    al.set_fit_mode(FitMode::Best);
    // Of the 96/192/48 holes, 48 is the tightest fit for 30 -> 32 bytes.
    let p = al.allocate(30).unwrap();
    assert_eq!(p, e);
    assert_coverage(&al, 1024);
}

#[test]
fn worst_fit_takes_largest_hole() {
    let al = SortedListAlloc::new(1024).unwrap();
    let (_a, c, _e) = three_holes(&al);
    al.set_fit_mode(FitMode::Worst);
    // Of the 96/192/48 holes, the 192-byte one wins.
    let p = al.allocate(30).unwrap();
    assert_eq!(p, c);
    assert_coverage(&al, 1024);
}

#[test]
fn coalesces_in_both_directions() {
    let al = SortedListAlloc::new(1024).unwrap();
    let x = al.allocate(96).unwrap();
    let y = al.allocate(96).unwrap();
    let z = al.allocate(96).unwrap();

    // Freeing y then x merges backwards into one hole.
    al.deallocate(y).unwrap();
    al.deallocate(x).unwrap();
    let sizes: Vec<_> = al
        .blocks_info()
        .iter()
        .map(|b| (b.size, b.occupied))
        .collect();
    assert_eq!(
        sizes,
        vec![
            (2 * (96 + D), false),
            (96 + D, true),
            (1024 - 3 * (96 + D), false),
        ]
    );
    assert_coalesced(&al);

    // Freeing z merges with both neighbours at once.
    al.deallocate(z).unwrap();
    let sizes: Vec<_> = al
        .blocks_info()
        .iter()
        .map(|b| (b.size, b.occupied))
        .collect();
    assert_eq!(sizes, vec![(1024, false)]);
}

#[test]
fn round_trip_restores_state() {
    let al = SortedListAlloc::new(1024).unwrap();
    let _keep = al.allocate(64).unwrap();
    let snapshot = al.blocks_info();

    let p = al.allocate(100).unwrap();
    unsafe {
        std::ptr::write_bytes(p.as_ptr(), 0x5a, 100);
    }
    al.deallocate(p).unwrap();

    assert_eq!(al.blocks_info(), snapshot);
}

#[test]
fn realloc_same_size_returns_same_block() {
    let al = SortedListAlloc::new(1024).unwrap();
    let p = al.allocate(128).unwrap();
    al.deallocate(p).unwrap();
    let q = al.allocate(128).unwrap();
    assert_eq!(p, q);
}

#[test]
fn usable_as_trait_object() {
    let al = SortedListAlloc::new(1024).unwrap();
    let resource: &dyn MemoryResource = &al;
    let p = resource.allocate(50).unwrap();
    resource.deallocate(p).unwrap();
}

#[test]
fn exhausted_leaves_state_untouched() {
    let al = SortedListAlloc::new(1024).unwrap();
    let snapshot = al.blocks_info();
    assert!(matches!(
        al.allocate(2048),
        Err(AllocError::Exhausted { requested: 2048 })
    ));
    assert_eq!(al.blocks_info(), snapshot);
}

#[test]
fn invalid_pointer_is_rejected() {
    let al = SortedListAlloc::new(1024).unwrap();
    let p = al.allocate(100).unwrap();

    let mut foreign = 0u8;
    let foreign = NonNull::from(&mut foreign);
    assert!(matches!(
        al.deallocate(foreign),
        Err(AllocError::InvalidPointer { .. })
    ));

    let inside = unsafe { NonNull::new_unchecked(p.as_ptr().add(16)) };
    assert!(matches!(
        al.deallocate(inside),
        Err(AllocError::InvalidPointer { .. })
    ));

    al.deallocate(p).unwrap();

    // A stale pointer is rejected once the block is back on the list.
    assert!(matches!(
        al.deallocate(p),
        Err(AllocError::InvalidPointer { .. })
    ));
}

#[test]
fn take_leaves_empty_allocator() {
    let mut al = SortedListAlloc::new(1024).unwrap();
    let p = al.allocate(100).unwrap();
    let moved = al.take();

    assert!(al.blocks_info().is_empty());
    assert!(matches!(al.allocate(10), Err(AllocError::InvalidState)));
    assert!(matches!(al.deallocate(p), Err(AllocError::InvalidState)));

    moved.deallocate(p).unwrap();
    assert_eq!(moved.blocks_info().len(), 1);
}

#[test]
fn clone_relocates_free_list() {
    let al = SortedListAlloc::new(1024).unwrap();
    let (_a, c, _e) = three_holes(&al);

    let copy = al.clone();
    assert_eq!(copy.blocks_info(), al.blocks_info());
    assert_ne!(copy, al);
    assert_eq!(al, al);

    // Identical layouts: first-fit probes land at the same offset, so
    // their distance is the base delta.
    let probe_a = al.allocate(16).unwrap();
    al.deallocate(probe_a).unwrap();
    let probe_c = copy.allocate(16).unwrap();
    copy.deallocate(probe_c).unwrap();
    let delta = probe_c.as_ptr() as isize - probe_a.as_ptr() as isize;

    // The copy's free list was rewritten: worst fit walks it and picks
    // the relocated 192-byte hole.
    copy.set_fit_mode(FitMode::Worst);
    let p = copy.allocate(30).unwrap();
    assert_eq!(
        p.as_ptr() as isize,
        c.as_ptr() as isize + delta,
        "copy picked a block at the wrong offset"
    );
    copy.deallocate(p).unwrap();
    assert_eq!(copy.blocks_info(), al.blocks_info());
}

#[test]
fn sink_records_transitions() {
    let sink = Arc::new(MemorySink::new());
    let config = AllocConfig {
        sink: Some(sink.clone() as _),
        ..AllocConfig::default()
    };
    let al = SortedListAlloc::with_config(1024, config).unwrap();

    let p = al.allocate(100).unwrap();
    assert!(sink.contains("allocate(100)"));
    assert!(sink.contains("rounded from 100 to 112"));
    assert!(sink.contains("split"));
    assert!(sink.count_at(Severity::Information) >= 2);

    al.deallocate(p).unwrap();
    assert!(sink.contains("coalescing"));

    assert!(al.allocate(5000).is_err());
    assert!(sink.count_at(Severity::Error) >= 1);
}

#[test]
fn silent_without_sink() {
    // No sink attached: operations must not record anywhere (and, more to
    // the point, must not panic trying).
    let al = SortedListAlloc::new(1024).unwrap();
    let p = al.allocate(100).unwrap();
    al.deallocate(p).unwrap();
}

#[test]
fn stress() {
    let al = SortedListAlloc::new(8192).unwrap();
    let mut allocated: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut r = Xorshift32(0x11451419u32);
    for _ in 0..2000 {
        let len = (1 + (r.next() & 127)) as usize;
        println!("alloc({})", len);
        match al.allocate(len) {
            Ok(p) => {
                let tag = (r.next() & 0xff) as u8;
                unsafe {
                    std::ptr::write_bytes(p.as_ptr(), tag, len);
                }
                println!("  success: {:?}", p);
                allocated.push((p, len, tag));
            }
            Err(_) => {
                assert!(allocated.len() > 0);
                let i = r.next_range(0..allocated.len() as u32) as usize;
                let (p, len, tag) = allocated.swap_remove(i);
                println!("  failed, deallocating {:?}", p);
                unsafe {
                    for k in 0..len {
                        assert_eq!(*p.as_ptr().add(k), tag, "payload clobbered");
                    }
                }
                al.deallocate(p).unwrap();
            }
        }
        assert_coverage(&al, 8192);
        assert_coalesced(&al);
    }
    for (p, len, tag) in allocated {
        unsafe {
            for k in 0..len {
                assert_eq!(*p.as_ptr().add(k), tag, "payload clobbered");
            }
        }
        al.deallocate(p).unwrap();
    }

    // Try the full allocation
    println!("alloc({})", 8192 - D);
    let p = al.allocate(8192 - D);
    assert!(p.is_ok());
}

#[test]
fn concurrent_allocations() {
    use std::thread;

    let al = Arc::new(SortedListAlloc::new(16384).unwrap());
    let mut handles = Vec::new();
    for t in 0..4 {
        let al = Arc::clone(&al);
        handles.push(thread::spawn(move || {
            let mut r = Xorshift32(0x9e3779b9 ^ (t as u32));
            for _ in 0..50 {
                let mut ptrs = Vec::new();
                for _ in 0..8 {
                    let len = (1 + (r.next() & 31)) as usize;
                    if let Ok(p) = al.allocate(len) {
                        ptrs.push(p);
                    }
                }
                for p in ptrs {
                    al.deallocate(p).unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let blocks = al.blocks_info();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].occupied);
    assert_eq!(blocks[0].size, 16384);
}
