//! Compact Phase
//!
//! Physically moves each plug to its planned address. Cards covering a
//! moved plug travel with it (an old-to-young reference stays
//! old-to-young after the move), gaps in front of pinned plugs become
//! free objects, mark and pin bits of survivors are retired, and the
//! region's brick table is rebuilt for the new layout.

use super::plan::{compacted_end, RegionFate, RegionPlan};
use crate::heap::card_table::CardSnapshot;
use crate::heap::SharedHeap;
use crate::object;

/// Free gaps produced while compacting a region (to be threaded onto
/// the owning generation's free list by the caller).
pub struct CompactedRegion {
    pub gaps: Vec<(usize, usize)>,
    pub new_allocated: usize,
}

/// Compact one planned region.
///
/// # Safety
/// EE suspended; relocation of all references has already run.
pub unsafe fn compact_region(shared: &SharedHeap, plan: &RegionPlan) -> CompactedRegion {
    debug_assert_eq!(plan.fate, RegionFate::Compact);
    let region = &plan.region;

    // Snapshot the card state of every plug before clearing the
    // region's cards; the move re-establishes them at the destination.
    let card_snapshots: Vec<CardSnapshot> = plan
        .plugs
        .iter()
        .map(|p| shared.cards.snapshot_cards(p.old_start, p.old_end))
        .collect();

    shared.cards.clear_range(region.mem(), region.allocated());
    shared.bricks.clear_range(region.mem(), region.reserved_end());

    let mut gaps = Vec::new();
    let mut cursor = region.mem();

    for (plug, snapshot) in plan.plugs.iter().zip(&card_snapshots) {
        // Gap between the previous destination and this plug's target.
        if plug.new_start > cursor {
            let gap = plug.new_start - cursor;
            object::make_free_object(cursor, gap);
            gaps.push((cursor, gap));
        }

        if plug.new_start != plug.old_start {
            // Slide left; ranges may overlap, copy handles that.
            std::ptr::copy(
                plug.old_start as *const u8,
                plug.new_start as *mut u8,
                plug.len(),
            );
        }

        // Restore the plug's cards at its new location.
        shared.cards.restore_cards(snapshot, plug.new_start);

        // Retire mark/pin bits and index the new layout.
        let mut obj = object::obj_at(plug.new_start);
        let plug_end = plug.new_start + plug.len();
        while obj < object::obj_at(plug_end) {
            object::clear_marked(obj);
            object::object_header(obj).clear_pinned();
            let p = object::plug_start(obj);
            let size = object::object_size(obj);
            shared.bricks.set_for_plug(p);
            shared.bricks.set_skips(p, p + size);
            obj += size;
        }

        cursor = plug_end;
    }

    let new_allocated = compacted_end(plan);
    debug_assert_eq!(cursor, new_allocated);
    region.set_allocated(new_allocated);
    region.set_used(new_allocated);

    CompactedRegion {
        gaps,
        new_allocated,
    }
}
