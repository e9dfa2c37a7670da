//! Brick Table - Object Start Index
//!
//! A 16-bit entry per `BRICK_SIZE` bytes of heap:
//!
//! - `0`: unknown; fall back to walking from the region start
//! - `> 0`: offset + 1 (bytes) from the brick base to the plug start of
//!   the first object whose plug begins in this brick
//! - `< 0`: skip; add the (negative) entry to the brick index and look
//!   again; skips chain for objects spanning many bricks
//!
//! Used by card scanning and by relocate to find the object covering an
//! interior address without walking whole regions.

use crate::error::{GcError, Result};
use crate::object;
use crate::util::constants::BRICK_SIZE;
use memmap2::MmapMut;
use std::sync::atomic::{AtomicI16, Ordering};

/// Brick table covering a fixed address range.
pub struct BrickTable {
    lowest: usize,
    highest: usize,
    _backing: MmapMut,
    entries: *const AtomicI16,
    n_entries: usize,
}

unsafe impl Send for BrickTable {}
unsafe impl Sync for BrickTable {}

impl BrickTable {
    /// Build a brick table covering `[lowest, highest)`.
    pub fn new(lowest: usize, highest: usize) -> Result<Self> {
        let n_entries = (highest - lowest + BRICK_SIZE - 1) / BRICK_SIZE;
        let backing = MmapMut::map_anon(n_entries.max(1) * 2)
            .map_err(|e| GcError::VirtualMemory(format!("brick table mapping failed: {}", e)))?;
        let entries = backing.as_ptr() as *const AtomicI16;
        Ok(Self {
            lowest,
            highest,
            _backing: backing,
            entries,
            n_entries,
        })
    }

    /// Brick index of an address.
    #[inline]
    pub fn brick_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.lowest && addr < self.highest);
        (addr - self.lowest) / BRICK_SIZE
    }

    /// Base address of a brick.
    #[inline]
    pub fn brick_address(&self, brick: usize) -> usize {
        self.lowest + brick * BRICK_SIZE
    }

    #[inline]
    fn entry(&self, brick: usize) -> &AtomicI16 {
        debug_assert!(brick < self.n_entries);
        unsafe { &*self.entries.add(brick) }
    }

    /// Raw entry value (diagnostics and the verifier).
    #[inline]
    pub fn get(&self, brick: usize) -> i16 {
        self.entry(brick).load(Ordering::Relaxed)
    }

    /// Record a plug start: the entry of its brick points at it if it is
    /// the first (lowest) plug seen for that brick.
    pub fn set_for_plug(&self, plug: usize) {
        let brick = self.brick_of(plug);
        let offset = (plug - self.brick_address(brick)) as i16 + 1;
        let e = self.entry(brick);
        let current = e.load(Ordering::Relaxed);
        if current <= 0 || current > offset {
            e.store(offset, Ordering::Relaxed);
        }
    }

    /// Record that `[brick_lo+1 ..= brick_hi]` is covered by an object
    /// starting in `brick_lo`: each entry becomes a skip back. Skips
    /// chain, so arbitrarily long objects are fine.
    pub fn set_skips(&self, plug: usize, plug_end: usize) {
        let first = self.brick_of(plug);
        if plug_end <= self.lowest {
            return;
        }
        let last = self.brick_of(plug_end - 1);
        let mut b = first + 1;
        while b <= last {
            // Chain in steps no larger than i16 range.
            let back = (b - first).min(i16::MAX as usize) as i16;
            self.entry(b).store(-back, Ordering::Relaxed);
            b += 1;
        }
    }

    /// Clear entries covering `[lo, hi)` to "unknown".
    pub fn clear_range(&self, lo: usize, hi: usize) {
        if hi <= lo {
            return;
        }
        let first = self.brick_of(lo);
        let last = self.brick_of(hi - 1);
        for b in first..=last {
            self.entry(b).store(0, Ordering::Relaxed);
        }
    }

    /// Find the object covering `addr` inside a region whose object
    /// space starts at `region_mem` and ends at `allocated`.
    ///
    /// Follows brick entries and skip chains; falls back to walking from
    /// the region start when the table has no information.
    ///
    /// # Safety
    /// The region's object space must be walkable.
    pub unsafe fn object_start(
        &self,
        addr: usize,
        region_mem: usize,
        allocated: usize,
    ) -> Option<usize> {
        if addr < region_mem || addr >= allocated {
            return None;
        }

        let mut brick = self.brick_of(addr);
        let region_brick = self.brick_of(region_mem);
        let mut walk_from = region_mem;
        loop {
            let e = self.get(brick);
            if e > 0 {
                let plug = self.brick_address(brick) + (e - 1) as usize;
                if plug >= region_mem && plug <= addr {
                    walk_from = plug;
                }
                break;
            } else if e < 0 {
                let back = (-e) as usize;
                if back > brick || brick - back < region_brick {
                    break; // corrupt skip; fall back to region walk
                }
                brick -= back;
            } else {
                // Unknown: step back a brick; give up at the region brick.
                if brick == region_brick {
                    break;
                }
                brick -= 1;
            }
        }

        // Walk forward from the best-known plug start.
        let mut obj = object::obj_at(walk_from);
        let end = object::obj_at(allocated);
        while obj < end {
            let size = object::object_size(obj);
            let plug = object::plug_start(obj);
            if addr < plug + size {
                return if addr >= plug { Some(obj) } else { None };
            }
            obj += size;
        }
        None
    }

    /// Rebuild entries for one region by walking its objects.
    ///
    /// # Safety
    /// The region's object space must be walkable.
    pub unsafe fn rebuild_for_region(&self, region: &super::region::HeapRegion) {
        self.clear_range(region.mem(), region.reserved_end());
        let end = region.allocated();
        let mut obj = region.first_obj();
        while obj < end {
            let size = object::object_size(obj);
            let plug = object::plug_start(obj);
            self.set_for_plug(plug);
            self.set_skips(plug, plug + size);
            obj += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{make_free_object, obj_at};

    #[test]
    fn test_plug_entry_keeps_first() {
        let bt = BrickTable::new(0x1000_0000, 0x1010_0000).unwrap();
        bt.set_for_plug(0x1000_0100);
        bt.set_for_plug(0x1000_0040);
        let brick = bt.brick_of(0x1000_0040);
        assert_eq!(bt.get(brick), 0x41);
    }

    #[test]
    fn test_skip_chain() {
        let bt = BrickTable::new(0x1000_0000, 0x1010_0000).unwrap();
        let plug = 0x1000_0000;
        bt.set_for_plug(plug);
        bt.set_skips(plug, plug + 10 * BRICK_SIZE);
        for i in 1..10 {
            assert_eq!(bt.get(i), -(i as i16));
        }
    }

    #[test]
    fn test_object_start_via_bricks() {
        // Lay three objects out in real memory and index them.
        let mut backing = vec![0u8; 3 * BRICK_SIZE];
        let base = backing.as_mut_ptr() as usize;
        let aligned = crate::util::align_up(base, 8);
        let bt = BrickTable::new(aligned, aligned + 2 * BRICK_SIZE).unwrap();

        let sizes = [256usize, BRICK_SIZE, 64];
        let mut plug = aligned;
        unsafe {
            for &s in &sizes {
                make_free_object(plug, s);
                bt.set_for_plug(plug);
                bt.set_skips(plug, plug + s);
                plug += s;
            }
        }
        let allocated = plug;

        unsafe {
            // Interior of the second (brick-spanning) object.
            let interior = aligned + 256 + BRICK_SIZE / 2;
            assert_eq!(
                bt.object_start(interior, aligned, allocated),
                Some(obj_at(aligned + 256))
            );
            // Exactly at the third plug.
            assert_eq!(
                bt.object_start(aligned + 256 + BRICK_SIZE, aligned, allocated),
                Some(obj_at(aligned + 256 + BRICK_SIZE))
            );
        }
    }
}
