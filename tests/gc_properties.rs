//! Property tests: the §-style universal invariants, checked by the
//! built-in verifier after mixed workloads, plus pinned immovability
//! across collections.

mod common;

use common::{GcFixture, KB, MB, BYTES_MT, LEAF_MT, NODE_MT};
use rgc::{AllocFlags, GcConfig, HandleType, HeapVerifyLevel};

/// Fixture with the full verifier running on entry and exit of every
/// collection; any invariant violation fails the collection.
fn verified_fixture() -> GcFixture {
    GcFixture::new(GcConfig {
        concurrent_gc: false,
        regions_range: 256 * MB,
        regions_size: 4 * MB,
        gen0_size: 64 * KB,
        heap_verify_level: HeapVerifyLevel::Full,
        ..Default::default()
    })
}

/// Mixed workload under the full verifier: reference closure, dangling
/// pointers, card coverage, bricks, free lists, handle ages,
/// finalization liveness and budgets are all checked by every
/// collection's entry/exit walk.
#[test]
fn test_invariants_hold_across_mixed_workload() {
    let fixture = verified_fixture();

    // A linked structure with some garbage salted in.
    let head = fixture.alloc(&NODE_MT);
    let head_root = fixture.env.push_root(head);
    let mut tail = head;
    for i in 0..64 {
        if i % 3 == 0 {
            fixture.alloc(&LEAF_MT); // garbage
        }
        let next = fixture.alloc(&NODE_MT);
        fixture.link(tail, next);
        tail = next;
    }

    // Handles of several kinds.
    let strong = fixture.create_handle(HandleType::Strong, fixture.alloc(&LEAF_MT));
    let weak = fixture.create_handle(HandleType::WeakShort, fixture.alloc(&LEAF_MT));
    let _fin = fixture.alloc_flags(&LEAF_MT, AllocFlags::FINALIZE);
    let big = fixture.alloc_array(&BYTES_MT, 100_000);
    let big_root = fixture.env.push_root(big);

    fixture.collect(0);
    fixture.collect(1);
    fixture.collect(2);

    // The chain is intact end to end after three collections.
    let mut node = fixture.env.root(head_root);
    let mut len = 0;
    while node != 0 {
        node = fixture.linked(node);
        len += 1;
    }
    assert_eq!(len, 65);

    assert_ne!(fixture.gc.handle_fetch(strong), 0);
    assert_eq!(fixture.gc.handle_fetch(weak), 0);
    assert_ne!(fixture.env.root(big_root), 0);

    fixture.gc.verify_heap_now().unwrap();
}

/// Pinned immovability (between two consecutive GCs the address of any
/// object referenced by a pinned handle does not change), checked
/// across several compacting collections.
#[test]
fn test_pinned_objects_never_move() {
    let fixture = GcFixture::new(GcConfig {
        concurrent_gc: false,
        regions_range: 256 * MB,
        regions_size: 4 * MB,
        gen0_size: 64 * KB,
        force_compact: true,
        ..Default::default()
    });

    // Garbage on both sides so compaction has a reason to slide.
    fixture.alloc_many(&LEAF_MT, 100);
    let pinned = fixture.alloc(&LEAF_MT);
    let h = fixture.create_handle(HandleType::Pinned, pinned);
    fixture.alloc_many(&LEAF_MT, 100);

    for gen in [0usize, 1, 2, 0, 1] {
        fixture.collect(gen);
        assert_eq!(
            fixture.gc.handle_fetch(h),
            pinned,
            "pinned object moved during a gen{} collection",
            gen
        );
    }
}

/// Budget monotonicity: the remaining budget never exceeds the desired
/// allocation, and a collection resets it to equality.
#[test]
fn test_budget_monotonicity() {
    let fixture = GcFixture::with_defaults();
    fixture.alloc_many(&LEAF_MT, 500);

    {
        let core = fixture.gc.core().heaps[0].core.lock();
        let dd = &core.generations[0].dd;
        assert!(dd.new_allocation <= dd.desired_allocation as isize);
        assert!(dd.new_allocation < dd.desired_allocation as isize,
            "allocation must have consumed budget");
    }

    fixture.collect(0);

    let core = fixture.gc.core().heaps[0].core.lock();
    let dd = &core.generations[0].dd;
    assert_eq!(dd.new_allocation, dd.desired_allocation as isize);
}

/// Region-allocator coverage: allocate/delete roundtrips restore the
/// map exactly (checked by the sum-of-runs walk).
#[test]
fn test_region_allocator_coverage_after_collections() {
    let fixture = GcFixture::with_defaults();

    for _ in 0..5 {
        fixture.alloc_many(&LEAF_MT, 2000);
        fixture.collect(0);
    }
    fixture.collect(2);

    assert!(fixture
        .gc
        .core()
        .shared
        .region_allocator
        .check_map_coverage());
}

/// Compaction preserves object contents bit for bit.
#[test]
fn test_compaction_preserves_payload() {
    let fixture = GcFixture::new(GcConfig {
        concurrent_gc: false,
        regions_range: 256 * MB,
        regions_size: 4 * MB,
        gen0_size: 64 * KB,
        force_compact: true,
        ..Default::default()
    });

    // Garbage, then a survivor with a recognizable payload.
    fixture.alloc_many(&LEAF_MT, 200);
    let obj = fixture.alloc(&LEAF_MT);
    unsafe {
        std::ptr::write((obj + common::WORD) as *mut usize, 0xFEED_F00D);
        std::ptr::write((obj + 2 * common::WORD) as *mut usize, 0xDEAD_BEEF);
    }
    let root = fixture.env.push_root(obj);

    fixture.collect(0);

    let moved = fixture.env.root(root);
    unsafe {
        assert_eq!(std::ptr::read((moved + common::WORD) as *const usize), 0xFEED_F00D);
        assert_eq!(
            std::ptr::read((moved + 2 * common::WORD) as *const usize),
            0xDEAD_BEEF
        );
    }
}

/// The allocator never hands out overlapping memory across a GC cycle.
#[test]
fn test_no_overlap_across_collections() {
    let fixture = GcFixture::with_defaults();

    let first = fixture.alloc_many(&NODE_MT, 300);
    let roots: Vec<usize> = first.iter().map(|&o| fixture.env.push_root(o)).collect();
    fixture.collect(0);

    // Survivors plus fresh allocations must not overlap.
    let survivors: Vec<usize> = roots.iter().map(|&r| fixture.env.root(r)).collect();
    let fresh = fixture.alloc_many(&NODE_MT, 300);

    let mut all = survivors.clone();
    all.extend(&fresh);
    common::assert_all_addresses_unique(&all, "survivors + fresh");

    for window in [&survivors, &fresh] {
        for &obj in window {
            unsafe {
                assert_eq!(rgc::object::object_size(obj), 4 * common::WORD);
            }
        }
    }
}
