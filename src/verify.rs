//! Heap Verification
//!
//! A walker run on entry and exit of collections (per
//! `heap_verify_level`) that checks the universal invariants: reference
//! closure, no dangling pointers, card coverage, brick correctness,
//! free-list soundness, handle age-map bounds, finalization liveness,
//! budget monotonicity and region-map coverage. Any violation is
//! corruption and fatal.

use crate::collect::GcCore;
use crate::config::HeapVerifyLevel;
use crate::error::{GcError, Result};
use crate::heap::MAX_SOH_GENERATION;
use crate::object;
use std::collections::HashSet;

fn corrupt(core: &GcCore, when: &str, msg: String) -> GcError {
    let full = format!("heap verification ({}): {}", when, msg);
    core.env.log_error(&full);
    GcError::Corruption(full)
}

/// Whether `target` is a valid object start inside walked space.
fn is_object_start(core: &GcCore, target: usize) -> bool {
    let Some(region) = core.shared.region_map.region_of(target) else {
        return false;
    };
    if !region.contains_allocated(target) {
        return false;
    }
    unsafe {
        core.shared
            .bricks
            .object_start(target, region.mem(), region.allocated())
            == Some(target)
    }
}

/// Walk the heap checking the §8 invariants appropriate to the
/// configured level.
pub fn verify_heap(core: &GcCore, when: &str) -> Result<()> {
    let level = core.config.heap_verify_level;
    if level == HeapVerifyLevel::None {
        return Ok(());
    }
    let full = level >= HeapVerifyLevel::Full;

    // Region-map coverage first: everything else walks it.
    if full && !core.shared.region_allocator.check_map_coverage() {
        return Err(corrupt(
            core,
            when,
            "region allocator run lengths do not cover the range".to_string(),
        ));
    }

    // Reference closure, dangling pointers, card coverage, bricks.
    for region in core.shared.region_map.all_regions() {
        let holder_gen = region.generation();
        let mut result = Ok(());
        unsafe {
            region.walk_objects(|obj| {
                if result.is_err() || object::is_free_object(obj) {
                    return;
                }
                if full {
                    // Bricks must find this object from any interior byte.
                    let interior = obj + object::object_size(obj) / 2;
                    let found = core.shared.bricks.object_start(
                        interior.min(region.allocated() - 1),
                        region.mem(),
                        region.allocated(),
                    );
                    if found != Some(obj) {
                        result = Err(corrupt(
                            core,
                            when,
                            format!(
                                "brick lookup for {:#x} found {:?}, expected {:#x}",
                                interior, found, obj
                            ),
                        ));
                        return;
                    }
                }
                object::for_each_ref(obj, |slot| {
                    if result.is_err() {
                        return;
                    }
                    let target = std::ptr::read(slot as *const usize);
                    if target == 0 {
                        return;
                    }
                    if !is_object_start(core, target) {
                        result = Err(corrupt(
                            core,
                            when,
                            format!(
                                "slot {:#x} of object {:#x} references {:#x}, not an object start",
                                slot, obj, target
                            ),
                        ));
                        return;
                    }
                    if full {
                        let target_gen = core
                            .shared
                            .region_map
                            .region_of(target)
                            .map(|r| r.generation())
                            .unwrap_or(MAX_SOH_GENERATION);
                        if target_gen < holder_gen
                            && holder_gen <= MAX_SOH_GENERATION
                            && !core.shared.cards.is_card_set(slot)
                        {
                            result = Err(corrupt(
                                core,
                                when,
                                format!(
                                    "old-to-young reference at {:#x} (gen{} -> gen{}) has no card",
                                    slot, holder_gen, target_gen
                                ),
                            ));
                        }
                    }
                });
            });
        }
        result?;
    }

    // Free-list soundness: on-heap, inside the owning generation, no
    // duplicates across any list.
    let mut seen: HashSet<usize> = HashSet::new();
    for heap in &core.heaps {
        let core_guard = heap.core.lock();
        for gen in &core_guard.generations {
            let mut result = Ok(());
            unsafe {
                gen.allocator.for_each_item(|item, _bucket| {
                    if result.is_err() {
                        return;
                    }
                    if !seen.insert(item) {
                        result = Err(corrupt(
                            core,
                            when,
                            format!("free-list item {:#x} appears twice", item),
                        ));
                        return;
                    }
                    let owned = gen.regions.iter().any(|r| r.contains_allocated(item));
                    if !owned {
                        result = Err(corrupt(
                            core,
                            when,
                            format!(
                                "free-list item {:#x} lies outside gen{}'s regions",
                                item, gen.number
                            ),
                        ));
                        return;
                    }
                    if !object::is_free_object(item) {
                        result = Err(corrupt(
                            core,
                            when,
                            format!("free-list item {:#x} is not a free object", item),
                        ));
                    }
                });
            }
            result?;

            // Budget monotonicity.
            if gen.dd.new_allocation > gen.dd.desired_allocation as isize {
                return Err(corrupt(
                    core,
                    when,
                    format!(
                        "gen{} remaining budget {} exceeds desired {}",
                        gen.number, gen.dd.new_allocation, gen.dd.desired_allocation
                    ),
                ));
            }
        }
    }

    if full {
        // Handle age map: clump ages bound their targets' generations.
        for table in core.handles.tables() {
            let mut result = Ok(());
            verify_handle_ages(core, table, when, &mut result);
            result?;
        }

        // Finalization: ready entries must reference valid objects.
        let mut result = Ok(());
        core.finalize.for_each(&mut |obj, _ready| {
            if result.is_ok() && obj != 0 && !is_object_start(core, obj) {
                result = Err(corrupt(
                    core,
                    when,
                    format!("finalization queue entry {:#x} is not an object", obj),
                ));
            }
        });
        result?;
    }

    log::debug!("heap verification ({}) passed", when);
    Ok(())
}

fn verify_handle_ages(
    core: &GcCore,
    table: &crate::handles::HandleTable,
    when: &str,
    result: &mut Result<()>,
) {
    use crate::handles::table::HANDLES_PER_CLUMP;
    let guard = table.core.read();
    for seg in &guard.segments {
        for slot in 0..crate::handles::table::HANDLES_PER_SEGMENT {
            if !seg.is_slot_live(slot) {
                continue;
            }
            let target = seg.value(slot).load(std::sync::atomic::Ordering::Acquire);
            if target == 0 {
                continue;
            }
            let Some(region) = core.shared.region_map.region_of(target) else {
                continue;
            };
            let clump = slot / HANDLES_PER_CLUMP;
            let age = seg.age(clump).load(std::sync::atomic::Ordering::Relaxed) as usize;
            let gen = region.generation().min(MAX_SOH_GENERATION);
            if age > gen {
                *result = Err(corrupt(
                    core,
                    when,
                    format!(
                        "handle clump age {} exceeds target generation {} (handle {:#x})",
                        age,
                        gen,
                        seg.handle_of(slot)
                    ),
                ));
                return;
            }
        }
    }
}
