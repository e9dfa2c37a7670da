//! Sweep Phase
//!
//! For regions that keep their objects in place: dead runs become free
//! objects (returned to the caller for free-list threading), survivor
//! mark and pin bits are retired, and the brick table is rebuilt for
//! the surviving layout.

use super::plan::{RegionFate, RegionPlan};
use crate::heap::SharedHeap;
use crate::object;

/// Free gaps produced while sweeping a region.
pub struct SweptRegion {
    pub gaps: Vec<(usize, usize)>,
    pub live_bytes: usize,
}

/// Sweep one planned region in place.
///
/// # Safety
/// EE suspended (or the region quiescent), marks valid.
pub unsafe fn sweep_region(shared: &SharedHeap, plan: &RegionPlan) -> SweptRegion {
    debug_assert_eq!(plan.fate, RegionFate::SweepInPlace);
    let region = &plan.region;

    let mut gaps: Vec<(usize, usize)> = Vec::new();
    let mut live_bytes = 0usize;
    let mut open_gap: Option<(usize, usize)> = None;

    region.walk_objects(|obj| {
        let plug = object::plug_start(obj);
        let size = object::object_size(obj);
        if object::is_marked(obj) {
            object::clear_marked(obj);
            object::object_header(obj).clear_pinned();
            live_bytes += size;
            if let Some((s, e)) = open_gap.take() {
                gaps.push((s, e - s));
            }
        } else {
            match &mut open_gap {
                Some((_, e)) if *e == plug => *e += size,
                _ => {
                    if let Some((s, e)) = open_gap.take() {
                        gaps.push((s, e - s));
                    }
                    open_gap = Some((plug, plug + size));
                }
            }
        }
    });
    if let Some((s, e)) = open_gap.take() {
        gaps.push((s, e - s));
    }

    // Coalesce each dead run into one free object.
    for &(start, len) in &gaps {
        object::make_free_object(start, len);
    }

    region.set_used(region.allocated());
    shared.bricks.rebuild_for_region(region);

    SweptRegion { gaps, live_bytes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::plan::plan_region;
    use crate::config::GcConfig;
    use crate::object::{is_free_object, make_free_object, obj_at, set_marked};
    use std::sync::Arc;

    fn shared() -> Arc<SharedHeap> {
        let config = Arc::new(GcConfig {
            regions_range: 64 * 1024 * 1024,
            regions_size: 4 * 1024 * 1024,
            ..Default::default()
        });
        Arc::new(SharedHeap::new(config).unwrap())
    }

    #[test]
    fn test_sweep_coalesces_dead_runs() {
        let shared = shared();
        let region = shared.new_region(2, 0, false, 0).unwrap();
        unsafe {
            shared
                .ensure_committed(&region, region.mem() + 4096)
                .unwrap();
            // live(64), dead(64), dead(128), live(64)
            let mut plug = region.mem();
            for (i, size) in [64usize, 64, 128, 64].into_iter().enumerate() {
                make_free_object(plug, size);
                if i == 0 || i == 3 {
                    set_marked(obj_at(plug));
                }
                plug += size;
            }
            region.set_allocated(plug);

            let plan = plan_region(&region, false);
            assert_eq!(plan.fate, RegionFate::SweepInPlace);
            let swept = sweep_region(&shared, &plan);

            assert_eq!(swept.live_bytes, 128);
            assert_eq!(swept.gaps, vec![(region.mem() + 64, 192)]);

            // The dead run is one walkable free object now.
            let free = obj_at(region.mem() + 64);
            assert!(is_free_object(free));
            assert_eq!(crate::object::object_size(free), 192);

            // Survivors are unmarked.
            assert!(!crate::object::is_marked(obj_at(region.mem())));
        }
    }
}
