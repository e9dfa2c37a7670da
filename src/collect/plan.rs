//! Plan Phase
//!
//! Walks every condemned region, coalescing runs of adjacent live
//! objects into *plugs* separated by *gaps* of dead bytes, and decides
//! each region's fate:
//!
//! - **Compact**: plugs get new addresses, densely packed from the
//!   region's start; pinned plugs anchor and their neighbors slide
//!   around them.
//! - **Sweep in place**: survivors stay; gaps become free-list items.
//!   Chosen for regions that barely fragmented (moving them buys
//!   nothing) and for every region of a sweeping collection.
//! - **Free**: no survivors; the region is demoted to a free region.
//!
//! Relocation deltas live in the per-region plug table (sorted by old
//! address), so plugs of any size carry no in-object relocation state.

use crate::heap::{HeapRegion, POH_GENERATION};
use crate::object;
use std::sync::Arc;

/// One plug: a run of adjacent live objects.
#[derive(Debug, Clone, Copy)]
pub struct PlugInfo {
    /// First byte of the plug (plug start of its first object).
    pub old_start: usize,
    /// One past the last byte.
    pub old_end: usize,
    /// Planned new first byte (== `old_start` for pinned plugs and
    /// sweeping regions).
    pub new_start: usize,
    /// The plug must not move.
    pub pinned: bool,
}

impl PlugInfo {
    #[inline]
    pub fn len(&self) -> usize {
        self.old_end - self.old_start
    }

    #[inline]
    pub fn delta(&self) -> isize {
        self.new_start as isize - self.old_start as isize
    }
}

/// Fate of one condemned region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionFate {
    Compact,
    SweepInPlace,
    Free,
}

/// Plan output for one region.
pub struct RegionPlan {
    pub region: Arc<HeapRegion>,
    pub fate: RegionFate,
    /// Plugs in address order.
    pub plugs: Vec<PlugInfo>,
    pub live_bytes: usize,
    pub pinned_bytes: usize,
    /// Free bytes between and after plugs.
    pub dead_bytes: usize,
}

impl RegionPlan {
    /// New address of an object reference inside this region.
    /// Meaningful only for `Compact` regions.
    pub fn relocate_obj(&self, obj: usize) -> usize {
        let plug_addr = object::plug_start(obj);
        match self
            .plugs
            .binary_search_by(|p| {
                if plug_addr < p.old_start {
                    std::cmp::Ordering::Greater
                } else if plug_addr >= p.old_end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            }) {
            Ok(idx) => {
                let p = &self.plugs[idx];
                (obj as isize + p.delta()) as usize
            }
            Err(_) => obj,
        }
    }
}

/// Sweep-in-plan threshold: regions whose dead share is below 1/8 of
/// the allocated bytes are not worth compacting.
const SWEEP_IN_PLAN_DENOMINATOR: usize = 8;

/// Plan a single condemned region.
///
/// # Safety
/// The region's object space must be walkable and marked (post-mark,
/// EE suspended).
pub unsafe fn plan_region(region: &Arc<HeapRegion>, compacting: bool) -> RegionPlan {
    let mut plugs: Vec<PlugInfo> = Vec::new();
    let mut live_bytes = 0usize;
    let mut pinned_bytes = 0usize;

    let mut current: Option<(usize, usize)> = None; // (start, end) of open plug
    region.walk_objects(|obj| {
        let size = object::object_size(obj);
        let plug_addr = object::plug_start(obj);
        let live = object::is_marked(obj);
        if !live {
            if let Some((s, e)) = current.take() {
                plugs.push(PlugInfo {
                    old_start: s,
                    old_end: e,
                    new_start: s,
                    pinned: false,
                });
            }
            return;
        }
        live_bytes += size;
        let pinned = object::is_pinned(obj);
        if pinned {
            pinned_bytes += size;
            // Close the open plug; the pinned object is its own plug.
            if let Some((s, e)) = current.take() {
                plugs.push(PlugInfo {
                    old_start: s,
                    old_end: e,
                    new_start: s,
                    pinned: false,
                });
            }
            plugs.push(PlugInfo {
                old_start: plug_addr,
                old_end: plug_addr + size,
                new_start: plug_addr,
                pinned: true,
            });
            return;
        }
        match &mut current {
            Some((_, e)) if *e == plug_addr => *e += size,
            _ => {
                if let Some((s, e)) = current.take() {
                    plugs.push(PlugInfo {
                        old_start: s,
                        old_end: e,
                        new_start: s,
                        pinned: false,
                    });
                }
                current = Some((plug_addr, plug_addr + size));
            }
        }
    });
    if let Some((s, e)) = current.take() {
        plugs.push(PlugInfo {
            old_start: s,
            old_end: e,
            new_start: s,
            pinned: false,
        });
    }

    let allocated = region.allocated() - region.mem();
    let dead_bytes = allocated - live_bytes;

    let fate = decide_fate(region, compacting, live_bytes, dead_bytes, allocated);

    let mut plan = RegionPlan {
        region: region.clone(),
        fate,
        plugs,
        live_bytes,
        pinned_bytes,
        dead_bytes,
    };
    if plan.fate == RegionFate::Compact {
        assign_new_addresses(&mut plan);
    }
    plan
}

fn decide_fate(
    region: &HeapRegion,
    compacting: bool,
    live_bytes: usize,
    dead_bytes: usize,
    allocated: usize,
) -> RegionFate {
    if live_bytes == 0 {
        return RegionFate::Free;
    }
    if region.generation() == POH_GENERATION {
        // Pinned heap never moves objects.
        return RegionFate::SweepInPlace;
    }
    if !compacting {
        return RegionFate::SweepInPlace;
    }
    // Barely-fragmented regions are swept in plan.
    if dead_bytes * SWEEP_IN_PLAN_DENOMINATOR < allocated {
        return RegionFate::SweepInPlace;
    }
    RegionFate::Compact
}

/// Compute relocation targets: pack plugs from `mem`, anchoring pinned
/// plugs in place.
fn assign_new_addresses(plan: &mut RegionPlan) {
    let mut to = plan.region.mem();
    for plug in &mut plan.plugs {
        if plug.pinned {
            // The anchor leaves any space before it as a gap.
            to = plug.old_end.max(to);
            plug.new_start = plug.old_start;
        } else {
            plug.new_start = to;
            to += plug.len();
        }
    }
}

/// Final frontier of a compacted region (one past the last moved byte).
pub fn compacted_end(plan: &RegionPlan) -> usize {
    plan.plugs
        .iter()
        .map(|p| p.new_start + p.len())
        .max()
        .unwrap_or(plan.region.mem())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{make_free_object, obj_at, set_marked};

    /// Lay out `sizes` free objects back to back, marking those whose
    /// index is in `live`, pinning those in `pinned`.
    unsafe fn build_region(
        backing: &mut Vec<u8>,
        sizes: &[usize],
        live: &[usize],
        pinned: &[usize],
    ) -> Arc<HeapRegion> {
        let base = crate::util::align_up(backing.as_mut_ptr() as usize, 8);
        let total: usize = sizes.iter().sum();
        let region = Arc::new(HeapRegion::new(base, base + total + 4096, 0, 0));
        let mut plug = base;
        for (i, &size) in sizes.iter().enumerate() {
            make_free_object(plug, size);
            if live.contains(&i) {
                set_marked(obj_at(plug));
            }
            if pinned.contains(&i) {
                object::object_header(obj_at(plug)).set_pinned();
            }
            plug += size;
        }
        region.set_allocated(plug);
        region
    }

    #[test]
    fn test_empty_region_freed() {
        let mut backing = vec![0u8; 8192];
        unsafe {
            let region = build_region(&mut backing, &[64, 64], &[], &[]);
            let plan = plan_region(&region, true);
            assert_eq!(plan.fate, RegionFate::Free);
            assert_eq!(plan.live_bytes, 0);
        }
    }

    #[test]
    fn test_adjacent_live_objects_coalesce() {
        let mut backing = vec![0u8; 8192];
        unsafe {
            // live, live, dead, live
            let region = build_region(&mut backing, &[64, 96, 128, 64], &[0, 1, 3], &[]);
            let plan = plan_region(&region, true);
            assert_eq!(plan.plugs.len(), 2);
            assert_eq!(plan.plugs[0].len(), 160);
            assert_eq!(plan.live_bytes, 224);
            assert_eq!(plan.dead_bytes, 128);
        }
    }

    #[test]
    fn test_compaction_slides_past_gap() {
        let mut backing = vec![0u8; 8192];
        unsafe {
            // dead, live: the live plug slides to the region start.
            let region = build_region(&mut backing, &[256, 64], &[1], &[]);
            let plan = plan_region(&region, true);
            assert_eq!(plan.fate, RegionFate::Compact);
            assert_eq!(plan.plugs.len(), 1);
            assert_eq!(plan.plugs[0].new_start, region.mem());
            assert_eq!(plan.plugs[0].delta(), -256);

            // relocate_obj maps an object ref through the delta.
            let obj = obj_at(region.mem() + 256);
            assert_eq!(plan.relocate_obj(obj), obj_at(region.mem()));
        }
    }

    #[test]
    fn test_pinned_plug_anchors() {
        let mut backing = vec![0u8; 8192];
        unsafe {
            // dead(256), pinned(64), dead(128), live(64)
            let region = build_region(&mut backing, &[256, 64, 128, 64], &[1, 3], &[1]);
            let plan = plan_region(&region, true);
            assert_eq!(plan.fate, RegionFate::Compact);
            assert_eq!(plan.plugs.len(), 2);

            let pin = &plan.plugs[0];
            assert!(pin.pinned);
            assert_eq!(pin.new_start, pin.old_start, "pinned plug must not move");

            // The trailing plug slides to just after the pin.
            let tail = &plan.plugs[1];
            assert_eq!(tail.new_start, pin.old_end);
        }
    }

    #[test]
    fn test_low_fragmentation_swept_in_plan() {
        let mut backing = vec![0u8; 8192];
        unsafe {
            // 1 dead 24-byte object out of ~4KB: not worth compacting.
            let region = build_region(&mut backing, &[2048, 24, 2048], &[0, 2], &[]);
            let plan = plan_region(&region, true);
            assert_eq!(plan.fate, RegionFate::SweepInPlace);
        }
    }
}
