//! Heap Module - Memory Model
//!
//! The collector reserves one large VA range at init and carves it into
//! regions. `SharedHeap` owns the process-wide memory resources (the
//! reservation, the region allocator, card/brick/mark tables and the
//! region map); `Heap` is the per-heap aggregate (generation table,
//! free lists, more-space locks). The workstation configuration has one
//! `Heap`; the server configuration has one per collector thread.

pub mod brick_table;
pub mod card_table;
pub mod generation;
pub mod mark_array;
pub mod region;
pub mod region_allocator;

pub use brick_table::BrickTable;
pub use card_table::CardTable;
pub use generation::{
    Generation, NUM_GENERATIONS, LOH_GENERATION, MAX_SOH_GENERATION, POH_GENERATION,
};
pub use mark_array::MarkArray;
pub use region::HeapRegion;
pub use region_allocator::{AllocDirection, RegionAllocator};

use crate::config::GcConfig;
use crate::error::{GcError, ObjectHeap, Result};
use crate::platform::{VirtualMemory, WriteWatch};
use generation::is_uoh_generation;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Address-to-region lookup: one slot per region-alignment unit.
///
/// Lookups are lock-free; insert/remove happen while the EE is suspended
/// or under the region allocator's serialization, so a slot never changes
/// under a reader that observed it non-null.
pub struct RegionMap {
    base: usize,
    unit: usize,
    entries: Vec<AtomicPtr<HeapRegion>>,
    registry: Mutex<Vec<Arc<HeapRegion>>>,
}

impl RegionMap {
    pub fn new(base: usize, total: usize, unit: usize) -> Self {
        let n = total / unit;
        let mut entries = Vec::with_capacity(n);
        entries.resize_with(n, || AtomicPtr::new(std::ptr::null_mut()));
        Self {
            base,
            unit,
            entries,
            registry: Mutex::new(Vec::new()),
        }
    }

    /// Register a region and point every covered unit at it.
    pub fn insert(&self, region: Arc<HeapRegion>) {
        let ptr = Arc::as_ptr(&region) as *mut HeapRegion;
        let first = (region.mem() - self.base) / self.unit;
        let last = (region.reserved_end() - 1 - self.base) / self.unit;
        for i in first..=last {
            self.entries[i].store(ptr, Ordering::Release);
        }
        self.registry.lock().push(region);
    }

    /// Unregister a region, clearing its units. Returns the owning Arc.
    pub fn remove(&self, region: &Arc<HeapRegion>) -> Option<Arc<HeapRegion>> {
        let first = (region.mem() - self.base) / self.unit;
        let last = (region.reserved_end() - 1 - self.base) / self.unit;
        for i in first..=last {
            self.entries[i].store(std::ptr::null_mut(), Ordering::Release);
        }
        let mut registry = self.registry.lock();
        registry
            .iter()
            .position(|r| Arc::ptr_eq(r, region))
            .map(|pos| registry.swap_remove(pos))
    }

    /// Region covering `addr`, if any.
    #[inline]
    pub fn region_of(&self, addr: usize) -> Option<&HeapRegion> {
        if addr < self.base {
            return None;
        }
        let idx = (addr - self.base) / self.unit;
        let ptr = self.entries.get(idx)?.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // Regions are unmapped only while lookups are quiescent.
            Some(unsafe { &*ptr })
        }
    }

    /// Snapshot of every registered region.
    pub fn all_regions(&self) -> Vec<Arc<HeapRegion>> {
        self.registry.lock().clone()
    }
}

/// Process-wide memory resources shared by all heaps.
pub struct SharedHeap {
    pub vm: VirtualMemory,
    pub region_allocator: RegionAllocator,
    pub cards: CardTable,
    pub bricks: BrickTable,
    pub mark_array: MarkArray,
    pub write_watch: WriteWatch,
    pub region_map: RegionMap,

    /// Deleted regions kept for reuse under `retain_vm`.
    standby: Mutex<Vec<(usize, usize)>>,

    /// Committed bytes per object heap, for hard-limit accounting.
    committed_by_oh: [AtomicUsize; 3],

    config: Arc<GcConfig>,
}

impl SharedHeap {
    /// Reserve the heap range and build the side tables.
    pub fn new(config: Arc<GcConfig>) -> Result<Self> {
        let vm = VirtualMemory::reserve(config.regions_range)?;
        let base = vm.base();
        let end = vm.end();
        let unit = config.regions_size;

        Ok(Self {
            region_allocator: RegionAllocator::new(base, end - base, unit),
            cards: CardTable::new(base, end)?,
            bricks: BrickTable::new(base, end)?,
            mark_array: MarkArray::new(base, end)?,
            write_watch: WriteWatch::new(base, end - base),
            region_map: RegionMap::new(base, end - base, unit),
            standby: Mutex::new(Vec::new()),
            committed_by_oh: Default::default(),
            vm,
            config,
        })
    }

    /// Lowest heap address.
    pub fn lowest_address(&self) -> usize {
        self.vm.base()
    }

    /// Highest heap address (exclusive).
    pub fn highest_address(&self) -> usize {
        self.vm.end()
    }

    fn oh_of_generation(gen: usize) -> ObjectHeap {
        match gen {
            POH_GENERATION => ObjectHeap::Poh,
            LOH_GENERATION => ObjectHeap::Loh,
            _ => ObjectHeap::Soh,
        }
    }

    fn hard_limit_for(&self, oh: ObjectHeap) -> usize {
        match oh {
            ObjectHeap::Soh => self.config.heap_hard_limit_soh,
            ObjectHeap::Loh => self.config.heap_hard_limit_loh,
            ObjectHeap::Poh => self.config.heap_hard_limit_poh,
        }
    }

    /// Total committed bytes charged to object heaps.
    pub fn committed_total(&self) -> usize {
        self.committed_by_oh
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Committed bytes charged to one object heap.
    pub fn committed_of(&self, oh: ObjectHeap) -> usize {
        self.committed_by_oh[oh as usize].load(Ordering::Relaxed)
    }

    /// Check hard limits for growing `oh` by `grow` bytes.
    pub fn check_hard_limit(&self, oh: ObjectHeap, grow: usize) -> Result<()> {
        let total_limit = self.config.heap_hard_limit;
        if total_limit != 0 && self.committed_total() + grow > total_limit {
            return Err(GcError::HardLimitExceeded {
                requested: grow,
                limit: total_limit,
            });
        }
        let oh_limit = self.hard_limit_for(oh);
        if oh_limit != 0 && self.committed_of(oh) + grow > oh_limit {
            return Err(GcError::HardLimitExceeded {
                requested: grow,
                limit: oh_limit,
            });
        }
        Ok(())
    }

    /// Obtain a fresh region for `generation`, reusing a standby span
    /// when one fits. Large regions grow to cover `min_bytes` when a
    /// single object needs more than the default large-region size.
    pub fn new_region(
        &self,
        generation: usize,
        heap_index: usize,
        large: bool,
        min_bytes: usize,
    ) -> Result<Arc<HeapRegion>> {
        let want = if large {
            self.config.large_region_size().max(
                crate::util::align_up(min_bytes, self.config.regions_size),
            )
        } else {
            self.config.regions_size
        };

        let (start, end) = {
            let mut standby = self.standby.lock();
            if let Some(pos) = standby.iter().position(|(s, e)| e - s == want) {
                standby.swap_remove(pos)
            } else {
                drop(standby);
                if large {
                    let dir = if is_uoh_generation(generation) {
                        AllocDirection::Backward
                    } else {
                        AllocDirection::Forward
                    };
                    self.region_allocator.allocate_large_region(want, dir)?
                } else {
                    self.region_allocator.allocate_basic_region()?
                }
            }
        };

        let region = Arc::new(HeapRegion::new(start, end, generation, heap_index));
        if large {
            region.set_flag(region::flags::LARGE);
        }
        self.region_map.insert(region.clone());
        log::trace!(
            "new region [{:#x}, {:#x}) gen{} heap{}",
            start,
            end,
            generation,
            heap_index
        );
        Ok(region)
    }

    /// Return a region to the allocator (or the standby list under
    /// `retain_vm`), decommitting its pages.
    pub fn delete_region(&self, region: &Arc<HeapRegion>) -> Result<()> {
        self.region_map.remove(region);
        let committed = region.committed() - region.mem();
        if committed > 0 {
            let oh = Self::oh_of_generation(region.generation());
            self.committed_by_oh[oh as usize].fetch_sub(committed, Ordering::Relaxed);
        }
        if self.config.retain_vm {
            // Keep the pages; the span is reused before fresh carving.
            self.standby
                .lock()
                .push((region.mem(), region.reserved_end()));
        } else {
            if committed > 0 {
                self.vm.decommit(region.mem(), committed)?;
            }
            self.region_allocator.delete_region(region.mem())?;
        }
        region.reset(region.generation());
        Ok(())
    }

    /// Grow a region's committed cursor to cover `up_to`.
    pub fn ensure_committed(&self, region: &HeapRegion, up_to: usize) -> Result<()> {
        let committed = region.committed();
        if up_to <= committed {
            return Ok(());
        }
        if up_to > region.reserved_end() {
            return Err(GcError::Internal(format!(
                "commit past region end: {:#x} > {:#x}",
                up_to,
                region.reserved_end()
            )));
        }
        let grow = crate::platform::align_to_page(up_to - committed);
        let grow = grow.min(region.reserved_end() - committed);
        let oh = Self::oh_of_generation(region.generation());
        self.check_hard_limit(oh, grow)?;
        self.vm.commit(committed, grow).map_err(|_| GcError::OomCommit {
            size: grow,
            oh,
            available: crate::platform::memory_status().available_physical,
        })?;
        region.set_committed(committed + grow);
        self.committed_by_oh[oh as usize].fetch_add(grow, Ordering::Relaxed);
        Ok(())
    }

    /// Decommit the span between `allocated` and `committed` of a
    /// region, at most `step` bytes (gradual decommit).
    pub fn decommit_step(&self, region: &HeapRegion, step: usize) -> Result<usize> {
        let allocated = crate::platform::align_to_page(region.allocated());
        let committed = region.committed();
        if committed <= allocated {
            return Ok(0);
        }
        let take = (committed - allocated).min(step);
        let new_committed = committed - take;
        self.vm.decommit(new_committed, take)?;
        region.set_committed(new_committed);
        let oh = Self::oh_of_generation(region.generation());
        self.committed_by_oh[oh as usize].fetch_sub(take, Ordering::Relaxed);
        Ok(take)
    }
}

/// Per-heap mutable state, guarded by the heap's core lock.
pub struct HeapCore {
    pub generations: [Generation; NUM_GENERATIONS],
}

impl HeapCore {
    pub fn generation(&self, n: usize) -> &Generation {
        &self.generations[n]
    }

    pub fn generation_mut(&mut self, n: usize) -> &mut Generation {
        &mut self.generations[n]
    }
}

/// One heap: generation table, free lists and slow-path serialization.
pub struct Heap {
    pub number: usize,

    /// More-space lock for small-object slow paths.
    pub soh_msl: Mutex<()>,

    /// More-space lock for LOH/POH slow paths.
    pub uoh_msl: Mutex<()>,

    /// Generation table and free lists.
    pub core: Mutex<HeapCore>,
}

impl Heap {
    pub fn new(number: usize, config: &GcConfig) -> Self {
        let gen0_budget = if config.gen0_size != 0 {
            config.gen0_size
        } else {
            config.regions_size / 4
        };
        let budgets = [
            gen0_budget,
            gen0_budget.max(1 << 20),
            4 << 20,
            4 << 20,
            4 << 20,
        ];
        let mut n = 0;
        let generations = [(); NUM_GENERATIONS].map(|_| {
            let g = Generation::new(n, budgets[n]);
            n += 1;
            g
        });
        Self {
            number,
            soh_msl: Mutex::new(()),
            uoh_msl: Mutex::new(()),
            core: Mutex::new(HeapCore { generations }),
        }
    }

    /// Remaining gen0 budget, used by heap balancing.
    pub fn gen0_budget_remaining(&self) -> isize {
        self.core.lock().generations[0].dd.new_allocation
    }
}

/// Usable frontier inside a region for a new allocation span of `size`
/// bytes plus context slack.
pub fn region_frontier_fits(region: &HeapRegion, size: usize) -> bool {
    region.allocated() + size + crate::util::constants::MIN_OBJECT_SIZE <= region.reserved_end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MB;

    fn shared() -> SharedHeap {
        let config = Arc::new(GcConfig {
            regions_range: 64 * MB,
            regions_size: 4 * MB,
            ..Default::default()
        });
        SharedHeap::new(config).unwrap()
    }

    #[test]
    fn test_region_map_lookup() {
        let sh = shared();
        let region = sh.new_region(0, 0, false, 0).unwrap();
        let addr = region.mem() + 128;
        let found = sh.region_map.region_of(addr).unwrap();
        assert_eq!(found.mem(), region.mem());
        assert!(sh.region_map.region_of(sh.highest_address() - 1).is_none());
    }

    #[test]
    fn test_commit_and_hard_limit() {
        let config = Arc::new(GcConfig {
            regions_range: 64 * MB,
            regions_size: 4 * MB,
            heap_hard_limit: 8192,
            ..Default::default()
        });
        let sh = SharedHeap::new(config).unwrap();
        let region = sh.new_region(0, 0, false, 0).unwrap();
        sh.ensure_committed(&region, region.mem() + 4096).unwrap();
        assert!(sh.committed_total() >= 4096);
        let err = sh
            .ensure_committed(&region, region.mem() + 64 * 1024)
            .unwrap_err();
        assert!(matches!(err, GcError::HardLimitExceeded { .. }));
    }

    #[test]
    fn test_standby_reuse_under_retain_vm() {
        let config = Arc::new(GcConfig {
            regions_range: 64 * MB,
            regions_size: 4 * MB,
            retain_vm: true,
            ..Default::default()
        });
        let sh = SharedHeap::new(config).unwrap();
        let region = sh.new_region(0, 0, false, 0).unwrap();
        let span = region.mem();
        sh.delete_region(&region).unwrap();
        drop(region);
        let again = sh.new_region(1, 0, false, 0).unwrap();
        assert_eq!(again.mem(), span);
    }
}
