//! Relocate Phase
//!
//! With new addresses planned, every reference in the system is
//! adjusted: roots, handles (values and dependent secondaries), the
//! finalization queue, reference fields of condemned live objects, and
//! old-generation fields found through the card scan. The brick table
//! locates the containing object of any interior address; the per-region
//! plug table supplies the delta.

use super::mark::{scan_cards, Marker};
use super::plan::{RegionFate, RegionPlan};
use crate::barrier;
use crate::ee::ExecutionEnv;
use crate::finalize::FinalizeQueue;
use crate::handles::HandleStore;
use crate::heap::SharedHeap;
use crate::object;
use std::collections::HashMap;

/// Address translation over the plan set.
pub struct RelocationMap<'a> {
    /// Keyed by region start for O(1) region-to-plan lookup.
    by_region: HashMap<usize, &'a RegionPlan>,
    shared: &'a SharedHeap,
}

impl<'a> RelocationMap<'a> {
    pub fn new(shared: &'a SharedHeap, plans: &'a [RegionPlan]) -> Self {
        let mut by_region = HashMap::with_capacity(plans.len());
        for plan in plans {
            if plan.fate == RegionFate::Compact {
                by_region.insert(plan.region.mem(), plan);
            }
        }
        Self { by_region, shared }
    }

    /// New address of the object referenced by `obj`, or `obj` when its
    /// region does not compact.
    #[inline]
    pub fn relocate_obj(&self, obj: usize) -> usize {
        if obj == 0 {
            return 0;
        }
        let Some(region) = self.shared.region_map.region_of(obj) else {
            return obj;
        };
        match self.by_region.get(&region.mem()) {
            Some(plan) => plan.relocate_obj(obj),
            None => obj,
        }
    }

    /// Relocate the reference held in `slot`, writing back on change.
    ///
    /// # Safety
    /// `slot` must be a valid reference slot.
    #[inline]
    pub unsafe fn relocate_slot(&self, slot: usize) {
        let old = std::ptr::read(slot as *const usize);
        let new = self.relocate_obj(old);
        if new != old {
            std::ptr::write(slot as *mut usize, new);
            barrier::shadow_gc_update(slot, new);
        }
    }

    /// Whether any region compacts at all.
    pub fn any_moves(&self) -> bool {
        !self.by_region.is_empty()
    }
}

/// Adjust every reference in the system for the planned moves, and
/// retire cards that no longer cover an old-to-young reference.
///
/// Runs with the EE suspended, after plan and before compact.
pub fn relocate_phase(
    shared: &SharedHeap,
    marker: &Marker,
    plans: &[RegionPlan],
    env: &dyn ExecutionEnv,
    handles: &HandleStore,
    finalize: &FinalizeQueue,
) {
    let map = RelocationMap::new(shared, plans);

    // Roots.
    env.enumerate_roots(&mut |slot| unsafe {
        map.relocate_slot(slot);
    });

    // Handles: values and dependent secondaries. The age mask is safe
    // for the value scan because the age map bounds both the value and
    // the dependent secondary (assignment and the post-GC age refresh
    // account for both).
    for table in handles.tables() {
        table.scan(
            &crate::handles::ALL_HANDLE_TYPES,
            Some(marker.condemned),
            &mut |slot| {
                let v = slot.value();
                let nv = map.relocate_obj(v);
                if nv != v {
                    slot.set_value(nv);
                }
                if slot.ty == crate::handles::table::HandleType::Dependent {
                    let s = slot.extra();
                    let ns = map.relocate_obj(s);
                    if ns != s {
                        slot.set_extra(ns);
                    }
                }
            },
        );
    }

    // Finalization queue entries.
    finalize.relocate(&mut |obj| map.relocate_obj(obj));

    // Reference fields of condemned live objects (in every fate: a
    // surviving object in a swept region may point into a compacted
    // one).
    for plan in plans {
        if plan.fate == RegionFate::Free {
            continue;
        }
        unsafe {
            plan.region.walk_objects(|obj| {
                if object::is_marked(obj) && object::method_table(obj).has_references() {
                    object::for_each_ref(obj, |slot| {
                        map.relocate_slot(slot);
                    });
                }
            });
        }
    }

    // Old-generation fields, through the remembered set. A card stays
    // set only if one of its slots still refers to an object that will
    // be younger than the region after this collection.
    let region_gen_after = |obj: usize| -> usize {
        match shared.region_map.region_of(obj) {
            Some(r) => {
                let g = r.generation();
                if marker.is_condemned_gen(g) {
                    super::promoted_generation(g)
                } else {
                    g
                }
            }
            None => crate::heap::MAX_SOH_GENERATION,
        }
    };
    scan_cards(shared, marker, |card_ref| {
        unsafe {
            map.relocate_slot(card_ref.slot);
        }
        let target = unsafe { std::ptr::read(card_ref.slot as *const usize) };
        if target == 0 {
            return false;
        }
        let holder_gen = shared
            .region_map
            .region_of(card_ref.slot)
            .map(|r| r.generation())
            .unwrap_or(0);
        region_gen_after(target) < holder_gen
    });
}
