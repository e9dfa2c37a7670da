//! Blocking collection scenarios: gen0 with no survivors, promotion,
//! and the old-to-young remembered set through the write barrier.

mod common;

use common::{
    assert_address_aligned, assert_address_in_bounds, assert_all_addresses_unique, GcFixture,
    LEAF_MT, NODE_MT, WORD,
};

/// A gen0 collection with no surviving objects reclaims everything and
/// the mutator resumes at the start of a fresh region.
///
/// **Bug this finds:** survivors invented from stale roots, regions
/// leaking after a full reclaim, the fast path resuming mid-region.
#[test]
fn test_gen0_no_survivors_reclaims_everything() {
    let fixture = GcFixture::with_defaults();

    let addresses = fixture.alloc_many(&LEAF_MT, 1000);
    assert_all_addresses_unique(&addresses, "gen0 bulk allocation");
    for &addr in &addresses {
        assert_address_aligned(addr, "gen0 allocation");
        assert_address_in_bounds(&fixture, addr, "gen0 allocation");
    }

    // No roots reference them: everything dies.
    let settings = fixture.collect(0);
    assert_eq!(settings.condemned_generation, 0);
    assert_eq!(fixture.gc.collection_count(0), 1);

    // The whole budget's worth of space came back.
    {
        let core = fixture.gc.core().heaps[0].core.lock();
        assert_eq!(
            core.generations[0].allocated_size(),
            0,
            "gen0 must be empty after a no-survivor collection"
        );
    }

    // The fast path resumes at the start of the fresh gen0 region.
    let obj = fixture.alloc(&LEAF_MT);
    let region = fixture
        .gc
        .core()
        .shared
        .region_map
        .region_of(obj)
        .expect("allocation outside any region");
    assert_eq!(region.generation(), 0);
    assert_eq!(
        obj,
        region.mem() + WORD,
        "first allocation after GC must sit at the region start"
    );
}

/// Rooted objects survive a gen0 collection and are promoted to gen1.
#[test]
fn test_rooted_objects_promote() {
    let fixture = GcFixture::with_defaults();

    let obj = fixture.alloc(&NODE_MT);
    let root = fixture.env.push_root(obj);
    assert_eq!(fixture.generation_of(obj), 0);

    fixture.collect(0);

    let promoted = fixture.env.root(root);
    assert_ne!(promoted, 0);
    assert_eq!(
        fixture.generation_of(promoted),
        1,
        "survivor of a gen0 collection must be gen1"
    );
}

/// An unreachable object chain dies with its head; a reachable chain
/// survives in full.
#[test]
fn test_reference_chains_follow_reachability() {
    let fixture = GcFixture::with_defaults();

    // head -> middle -> tail, head rooted.
    let head = fixture.alloc(&NODE_MT);
    let root = fixture.env.push_root(head);
    let middle = fixture.alloc(&NODE_MT);
    fixture.link(fixture.env.root(root), middle);
    let tail = fixture.alloc(&NODE_MT);
    fixture.link(middle, tail);

    fixture.collect(0);

    // The whole chain survived and the links were relocated together.
    let head = fixture.env.root(root);
    let middle = fixture.linked(head);
    let tail = fixture.linked(middle);
    assert_ne!(middle, 0);
    assert_ne!(tail, 0);
    assert_eq!(fixture.generation_of(middle), 1);
    assert_eq!(fixture.generation_of(tail), 1);

    // Drop the root: the chain dies as one.
    fixture.env.clear_roots();
    fixture.collect(1);
    let core = fixture.gc.core().heaps[0].core.lock();
    assert_eq!(core.generations[0].allocated_size(), 0);
}

/// Old-to-young stores are covered by cards; the collector retires a
/// card once its references are no longer old-to-young, and quiet cards
/// stay clear.
#[test]
fn test_write_barrier_card_lifecycle() {
    let fixture = GcFixture::with_defaults();

    // Promote A to gen1 with one collection.
    let a = fixture.alloc(&NODE_MT);
    let root_a = fixture.env.push_root(a);
    fixture.collect(0);
    let a = fixture.env.root(root_a);
    assert_eq!(fixture.generation_of(a), 1);

    // Store a gen0 reference into A: the card covering the slot is set.
    let b = fixture.alloc(&NODE_MT);
    fixture.link(a, b);
    let cards = &fixture.gc.core().shared.cards;
    assert!(
        cards.is_card_set(a + WORD),
        "barrier must set the card covering the written slot"
    );

    // The gen0 collection finds B through the card and promotes it;
    // A.field -> gen1 is no longer old-to-young, so the card retires.
    fixture.collect(0);
    let b = fixture.linked(a);
    assert_ne!(b, 0);
    assert_eq!(fixture.generation_of(b), 1);
    assert!(
        !cards.is_card_set(a + WORD),
        "card must be retired once the reference is no longer old-to-young"
    );

    // Another gen0 with no new stores leaves the card clear.
    fixture.collect(0);
    assert_eq!(fixture.linked(a), b, "B must not move in a gen0 collection");
    assert!(!cards.is_card_set(a + WORD));
}

/// Large objects land on the LOH and survive through gen2 collections.
#[test]
fn test_loh_allocation_and_collection() {
    let fixture = GcFixture::with_defaults();

    let big = fixture.alloc_array(&common::BYTES_MT, 200_000);
    assert_eq!(fixture.generation_of(big), rgc::heap::LOH_GENERATION);
    let root = fixture.env.push_root(big);

    // A full collection keeps the rooted large object.
    fixture.collect(2);
    let big = fixture.env.root(root);
    assert_eq!(fixture.generation_of(big), rgc::heap::LOH_GENERATION);
    unsafe {
        assert_eq!(rgc::object::array_length(big), 200_000);
    }

    // Dropping the root reclaims it at the next full collection.
    fixture.env.clear_roots();
    fixture.collect(2);
    let core = fixture.gc.core().heaps[0].core.lock();
    let loh = &core.generations[rgc::heap::LOH_GENERATION];
    assert!(
        loh.allocated_size() == 0 || loh.free_space() > 0,
        "dead LOH space must be reclaimed or threaded to the free list"
    );
}

/// The parallel server configuration collects across several heaps.
#[test]
fn test_server_configuration_basic_collection() {
    let fixture = GcFixture::server(2);
    assert_eq!(fixture.gc.core().heaps.len(), 2);

    let objs = fixture.alloc_many(&NODE_MT, 500);
    let root = fixture.env.push_root(objs[0]);

    fixture.collect(0);
    let survivor = fixture.env.root(root);
    assert_ne!(survivor, 0);
    assert_eq!(fixture.generation_of(survivor), 1);
}

/// A no-GC region defers collections until its budget is spent.
#[test]
fn test_no_gc_region_defers_collection() {
    let fixture = GcFixture::with_defaults();

    fixture.gc.try_begin_no_gc_region(512 * common::KB).unwrap();
    let before = fixture.gc.collection_count(0);

    // Far more than the gen0 budget, well within the region budget.
    fixture.alloc_many(&LEAF_MT, 2000);
    assert_eq!(
        fixture.gc.collection_count(0),
        before,
        "no collection may run inside the no-GC region"
    );

    fixture.gc.end_no_gc_region().unwrap();
}
