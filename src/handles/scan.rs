//! Handle Scanning
//!
//! GC-side enumeration of live handles. The synchronous scan walks
//! segments, then blocks (by type), then clumps filtered by the age
//! mask, invoking the callback on every live handle of the requested
//! types.
//!
//! The asynchronous scan queues block ranges under the table lock and
//! lets the caller process them with mutators running. It is
//! best-effort: blocks not yet queued when mutation resumed may be
//! missed, so the only client (concurrent mark) always follows up with
//! a synchronous pass.

use super::table::{
    HandleType, TableSegment, BLOCKS_PER_SEGMENT, BLOCK_TYPE_FREE, CLUMPS_PER_BLOCK,
    HANDLES_PER_BLOCK, HANDLES_PER_CLUMP,
};
use super::{Handle, HandleTable};
use crate::heap::MAX_SOH_GENERATION;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// One live handle presented to a scan callback.
pub struct HandleSlot<'a> {
    pub handle: Handle,
    pub ty: HandleType,
    seg: &'a TableSegment,
    slot: usize,
}

impl HandleSlot<'_> {
    #[inline]
    pub fn value(&self) -> usize {
        self.seg.value(self.slot).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_value(&self, v: usize) {
        self.seg.value(self.slot).store(v, Ordering::Release);
    }

    #[inline]
    pub fn extra(&self) -> usize {
        self.seg.extra(self.slot).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_extra(&self, v: usize) {
        self.seg.extra(self.slot).store(v, Ordering::Release);
    }
}

/// A queued block range for the asynchronous scan.
pub struct ScanRange {
    pub segment: Arc<TableSegment>,
    pub block: usize,
    pub ty: HandleType,
}

fn type_in(types: &[HandleType], ty: u8) -> Option<HandleType> {
    let ty = HandleType::from_u8(ty)?;
    types.contains(&ty).then_some(ty)
}

fn scan_block(
    seg: &TableSegment,
    block: usize,
    ty: HandleType,
    max_age: Option<usize>,
    f: &mut dyn FnMut(HandleSlot<'_>),
) {
    for clump_in_block in 0..CLUMPS_PER_BLOCK {
        let clump = block * CLUMPS_PER_BLOCK + clump_in_block;
        if let Some(max) = max_age {
            // Clump too old to reference the condemned range: skip all
            // of its slots at once.
            if seg.age(clump).load(Ordering::Relaxed) as usize > max {
                continue;
            }
        }
        let first_slot = clump * HANDLES_PER_CLUMP;
        for s in first_slot..first_slot + HANDLES_PER_CLUMP {
            if !seg.is_slot_live(s) {
                continue;
            }
            if seg.value(s).load(Ordering::Acquire) == 0 && seg.extra(s).load(Ordering::Acquire) == 0
            {
                continue;
            }
            f(HandleSlot {
                handle: seg.handle_of(s),
                ty,
                seg,
                slot: s,
            });
        }
    }
}

impl HandleTable {
    /// Synchronous scan: every live handle of the requested types whose
    /// clump passes the age mask (`max_age` = highest condemned
    /// generation; `None` scans all ages).
    pub fn scan(
        &self,
        types: &[HandleType],
        max_age: Option<usize>,
        f: &mut dyn FnMut(HandleSlot<'_>),
    ) {
        let core = self.core.read();
        for seg in &core.segments {
            for block in 0..BLOCKS_PER_SEGMENT {
                let bt = seg.block_type_of(block);
                if bt == BLOCK_TYPE_FREE {
                    continue;
                }
                if let Some(ty) = type_in(types, bt) {
                    scan_block(seg, block, ty, max_age, f);
                }
            }
        }
    }

    /// Queue block ranges for an asynchronous scan. The caller drops the
    /// table lock implicitly on return and processes the ranges with
    /// [`process_async_ranges`] while mutators run.
    pub fn queue_async_ranges(&self, types: &[HandleType]) -> Vec<ScanRange> {
        let core = self.core.read();
        let mut out = Vec::new();
        for seg in &core.segments {
            for block in 0..BLOCKS_PER_SEGMENT {
                let bt = seg.block_type_of(block);
                if bt == BLOCK_TYPE_FREE {
                    continue;
                }
                if let Some(ty) = type_in(types, bt) {
                    out.push(ScanRange {
                        segment: seg.clone(),
                        block,
                        ty,
                    });
                }
            }
        }
        out
    }

    /// Recompute every clump's age byte from the generations of the
    /// objects its slots reference (and dependent secondaries).
    pub fn update_ages(&self, gen_of: &dyn Fn(usize) -> usize) {
        let core = self.core.read();
        for seg in &core.segments {
            for block in 0..BLOCKS_PER_SEGMENT {
                if seg.block_type_of(block) == BLOCK_TYPE_FREE {
                    continue;
                }
                for clump_in_block in 0..CLUMPS_PER_BLOCK {
                    let clump = block * CLUMPS_PER_BLOCK + clump_in_block;
                    let mut min_gen = MAX_SOH_GENERATION;
                    let first_slot = clump * HANDLES_PER_CLUMP;
                    for s in first_slot..first_slot + HANDLES_PER_CLUMP {
                        if !seg.is_slot_live(s) {
                            continue;
                        }
                        for target in [
                            seg.value(s).load(Ordering::Acquire),
                            seg.extra(s).load(Ordering::Acquire),
                        ] {
                            if target != 0 {
                                min_gen = min_gen.min(gen_of(target));
                            }
                        }
                    }
                    seg.age(clump).store(min_gen as u8, Ordering::Release);
                }
            }
        }
    }
}

/// Process queued ranges without the table lock (mutators may run).
pub fn process_async_ranges(ranges: &[ScanRange], f: &mut dyn FnMut(HandleSlot<'_>)) {
    for range in ranges {
        // The block may have been freed or retyped since queueing; the
        // follow-up synchronous pass covers whatever this one misses.
        if range.segment.block_type_of(range.block) != range.ty as u8 {
            continue;
        }
        scan_block(&range.segment, range.block, range.ty, None, f);
    }
}

/// Convenience: count of live handles of `ty` (diagnostics and tests).
pub fn count_live(table: &HandleTable, ty: HandleType) -> usize {
    let mut n = 0;
    table.scan(&[ty], None, &mut |_| n += 1);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::SharedHeap;
    use crate::util::constants::MB;

    fn table() -> HandleTable {
        let config = Arc::new(GcConfig {
            regions_range: 32 * MB,
            regions_size: 4 * MB,
            ..Default::default()
        });
        let shared = Arc::new(SharedHeap::new(config).unwrap());
        HandleTable::new(shared, false)
    }

    #[test]
    fn test_scan_sees_only_requested_types() {
        let t = table();
        let s1 = t.create(HandleType::Strong, 0x100).unwrap();
        let _s2 = t.create(HandleType::Strong, 0x200).unwrap();
        let _w = t.create(HandleType::WeakShort, 0x300).unwrap();

        let mut seen = Vec::new();
        t.scan(&[HandleType::Strong], None, &mut |slot| {
            seen.push((slot.handle, slot.value()))
        });
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().any(|&(h, v)| h == s1 && v == 0x100));

        assert_eq!(count_live(&t, HandleType::WeakShort), 1);
        assert_eq!(count_live(&t, HandleType::Dependent), 0);
    }

    #[test]
    fn test_scan_can_clear_values() {
        let t = table();
        let w = t.create(HandleType::WeakShort, 0x300).unwrap();
        t.scan(&[HandleType::WeakShort], None, &mut |slot| {
            slot.set_value(0);
        });
        assert_eq!(t.fetch(w), 0);
    }

    #[test]
    fn test_age_mask_skips_old_clumps() {
        let t = table();
        let _h = t.create(HandleType::Strong, 0x100).unwrap();
        // Force every clump to look old.
        t.update_ages(&|_| MAX_SOH_GENERATION);

        let mut n = 0;
        t.scan(&[HandleType::Strong], Some(0), &mut |_| n += 1);
        assert_eq!(n, 0, "gen0 scan must skip gen2-aged clumps");

        let mut n = 0;
        t.scan(&[HandleType::Strong], Some(MAX_SOH_GENERATION), &mut |_| n += 1);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_async_ranges_cover_blocks() {
        let t = table();
        for _ in 0..5 {
            t.create(HandleType::Strong, 0x40).unwrap();
        }
        let ranges = t.queue_async_ranges(&[HandleType::Strong]);
        assert!(!ranges.is_empty());
        let mut n = 0;
        process_async_ranges(&ranges, &mut |_| n += 1);
        assert_eq!(n, 5);
    }
}
