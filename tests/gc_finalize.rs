//! Finalization scenarios: re-promotion of unreachable finalizable
//! objects, finalizer-thread draining, suppression.

mod common;

use common::{GcFixture, FINALIZABLE_MT, LEAF_MT, NODE_MT};
use rgc::AllocFlags;

/// An unreachable finalizable object moves to the ready partition, is
/// re-promoted (still live), has its finalizer run, and only then is
/// actually reclaimed.
#[test]
fn test_finalization_repromotes_then_reclaims() {
    let fixture = GcFixture::with_defaults();

    let _f = fixture.alloc(&FINALIZABLE_MT);
    assert_eq!(fixture.gc.pending_finalizer_count(), 0);

    // Drop the only reference and collect gen0.
    let settings = fixture.collect(0);
    assert!(
        settings.found_finalizers,
        "the finalizer pass must report found finalizers"
    );
    assert_eq!(fixture.gc.pending_finalizer_count(), 1);
    assert_eq!(fixture.env.finalized_count(), 0, "finalizers run outside GC");

    // The object was re-promoted, not reclaimed; the queue knows its
    // (possibly relocated) address.
    let mut queued = 0;
    fixture.gc.core().finalize.for_each(&mut |obj, ready| {
        assert!(ready);
        assert_eq!(fixture.generation_of(obj), 1);
        queued += 1;
    });
    assert_eq!(queued, 1);

    // Drain the ready partition on this thread.
    fixture.gc.run_finalizers();
    assert_eq!(fixture.env.finalized_count(), 1);
    assert_eq!(fixture.gc.pending_finalizer_count(), 0);

    // The next collection of its generation reclaims it for real.
    let settings = fixture.collect(1);
    assert!(!settings.found_finalizers);
    assert!(fixture.gc.core().finalize.is_empty());
}

/// A reachable finalizable object stays in its generation partition and
/// never reaches the finalizer thread.
#[test]
fn test_reachable_finalizable_not_queued() {
    let fixture = GcFixture::with_defaults();

    let f = fixture.alloc(&FINALIZABLE_MT);
    let root = fixture.env.push_root(f);

    let settings = fixture.collect(0);
    assert!(!settings.found_finalizers);
    assert_eq!(fixture.gc.pending_finalizer_count(), 0);
    assert_eq!(fixture.env.finalized_count(), 0);

    // The queue entry followed the object's promotion.
    let promoted = fixture.env.root(root);
    let mut seen = Vec::new();
    fixture.gc.core().finalize.for_each(&mut |obj, ready| {
        assert!(!ready);
        seen.push(obj);
    });
    assert_eq!(seen, vec![promoted]);
}

/// Suppression removes the queue entry; the object then dies like any
/// other.
#[test]
fn test_suppress_finalization() {
    let fixture = GcFixture::with_defaults();

    let f = fixture.alloc(&FINALIZABLE_MT);
    assert!(fixture.gc.suppress_finalization(f));
    assert!(!fixture.gc.suppress_finalization(f), "second suppress is a no-op");

    fixture.collect(0);
    assert_eq!(fixture.gc.pending_finalizer_count(), 0);
    assert_eq!(fixture.env.finalized_count(), 0);
    assert!(fixture.gc.core().finalize.is_empty());
}

/// The FINALIZE allocation flag registers non-finalizable types too.
#[test]
fn test_alloc_flag_registration() {
    let fixture = GcFixture::with_defaults();

    let obj = fixture.alloc_flags(&LEAF_MT, AllocFlags::FINALIZE);
    unsafe {
        assert!(rgc::object::object_header(obj).is_finalize_registered());
    }

    fixture.collect(0);
    assert_eq!(fixture.gc.pending_finalizer_count(), 1);
    fixture.gc.run_finalizers();
    assert_eq!(fixture.env.finalized_count(), 1);
}

/// Objects transitively reachable from a dying finalizable object are
/// re-promoted with it.
#[test]
fn test_finalizer_keeps_referents_alive() {
    let fixture = GcFixture::with_defaults();

    // A finalizable node holding a child reference.
    let parent = fixture.alloc_flags(&NODE_MT, AllocFlags::FINALIZE);
    let child = fixture.alloc(&LEAF_MT);
    fixture.link(parent, child);

    fixture.collect(0);

    // Both survived: the parent via the ready partition, the child via
    // the parent's re-promotion.
    let mut parent_now = 0;
    fixture.gc.core().finalize.for_each(&mut |obj, ready| {
        assert!(ready);
        parent_now = obj;
    });
    assert_ne!(parent_now, 0);
    let child_now = fixture.linked(parent_now);
    assert_ne!(child_now, 0);
    assert_eq!(fixture.generation_of(child_now), 1);
}
