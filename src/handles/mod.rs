//! Handle Table Subsystem
//!
//! Process-wide rooted references. A handle is one machine word (the
//! address of its value slot), stable for its lifetime and usable by
//! mutators as an indirect, typed reference to an object.
//!
//! The store is bucketed per heap; each bucket is a [`HandleTable`] of
//! segments plus per-type cache banks. Alloc/destroy hit the cache
//! banks lock-free and fall into the table lock only to rebalance.

pub mod cache;
pub mod scan;
pub mod table;

pub use cache::{HandleCache, HANDLES_PER_CACHE_BANK};
pub use scan::{HandleSlot, ScanRange};
pub use table::{HandleType, TableSegment, ALL_HANDLE_TYPES, NUM_HANDLE_TYPES};

use crate::barrier;
use crate::error::{GcError, Result};
use crate::heap::SharedHeap;
use cache::{REBALANCE_HIWATER, REBALANCE_LOWATER};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use table::HANDLES_PER_CLUMP;

/// An opaque handle: the address of its value slot.
pub type Handle = usize;

pub(crate) struct TableCore {
    pub segments: Vec<Arc<TableSegment>>,
}

/// One handle table (one bucket of the store).
pub struct HandleTable {
    pub(crate) core: RwLock<TableCore>,
    caches: [HandleCache; NUM_HANDLE_TYPES],
    shared: Arc<SharedHeap>,
    /// Keep empty segments around instead of releasing them.
    retain_segments: bool,
    /// Total slots handed out by segments, net of frees (diagnostics).
    allocated_slots: AtomicUsize,
}

impl HandleTable {
    pub fn new(shared: Arc<SharedHeap>, retain_segments: bool) -> Self {
        Self {
            core: RwLock::new(TableCore {
                segments: vec![Arc::new(TableSegment::new())],
            }),
            caches: [(); NUM_HANDLE_TYPES].map(|_| HandleCache::new()),
            shared,
            retain_segments,
            allocated_slots: AtomicUsize::new(0),
        }
    }

    /// Net handle slots allocated from segments (cached slots included).
    pub fn allocated_slots(&self) -> usize {
        self.allocated_slots.load(Ordering::Relaxed)
    }

    /// Number of segments currently owned.
    pub fn segment_count(&self) -> usize {
        self.core.read().segments.len()
    }

    #[inline]
    fn value_slot(handle: Handle) -> &'static AtomicUsize {
        unsafe { &*(handle as *const AtomicUsize) }
    }

    /// Segment containing `handle`, if any.
    fn segment_of(&self, handle: Handle) -> Option<Arc<TableSegment>> {
        self.core
            .read()
            .segments
            .iter()
            .find(|s| s.contains(handle))
            .cloned()
    }

    /// Conservatively age the clump of `handle` down to the generation
    /// of the object just stored.
    fn note_assignment(&self, handle: Handle, obj: usize) {
        if obj == 0 {
            return;
        }
        let gen = self
            .shared
            .region_map
            .region_of(obj)
            .map(|r| r.generation())
            .unwrap_or(0) as u8;
        if let Some(seg) = self.segment_of(handle) {
            let clump = seg.slot_of(handle) / HANDLES_PER_CLUMP;
            let age = seg.age(clump);
            let mut current = age.load(Ordering::Relaxed);
            while current > gen {
                match age.compare_exchange_weak(current, gen, Ordering::AcqRel, Ordering::Relaxed) {
                    Ok(_) => break,
                    Err(v) => current = v,
                }
            }
        }
    }

    /// Create a handle of `ty` referencing `obj` (0 allowed).
    pub fn create(&self, ty: HandleType, obj: usize) -> Result<Handle> {
        let cache = &self.caches[ty as usize];
        loop {
            if let Some(handle) = cache.try_alloc() {
                Self::value_slot(handle).store(obj, Ordering::Release);
                barrier::record_store(handle, obj);
                self.note_assignment(handle, obj);
                return Ok(handle);
            }
            self.rebalance(ty, None)?;
        }
    }

    /// Create a handle carrying extra info (dependent secondary,
    /// ref count, approximate size).
    pub fn create_with_extra(&self, ty: HandleType, obj: usize, extra: usize) -> Result<Handle> {
        let handle = self.create(ty, obj)?;
        self.set_extra(handle, extra)?;
        if ty == HandleType::Dependent {
            // The age map bounds the secondary's generation too.
            self.note_assignment(handle, extra);
        }
        Ok(handle)
    }

    /// Destroy a handle of `ty`.
    pub fn destroy(&self, handle: Handle, ty: HandleType) -> Result<()> {
        Self::value_slot(handle).store(0, Ordering::Release);
        // Clear the extra word too: the slot may be recycled straight
        // from the cache without passing through the segment free path.
        self.set_extra(handle, 0)?;
        let cache = &self.caches[ty as usize];
        if let Err(h) = cache.try_free(handle) {
            self.rebalance(ty, Some(h))?;
        }
        Ok(())
    }

    /// Current target of a handle.
    #[inline]
    pub fn fetch(&self, handle: Handle) -> usize {
        Self::value_slot(handle).load(Ordering::Acquire)
    }

    /// Store a new target.
    pub fn assign(&self, handle: Handle, obj: usize) {
        Self::value_slot(handle).store(obj, Ordering::Release);
        barrier::record_store(handle, obj);
        self.note_assignment(handle, obj);
    }

    /// Atomic compare-exchange of the target. Returns the witnessed
    /// value.
    pub fn compare_exchange(&self, handle: Handle, new: usize, compare: usize) -> usize {
        let slot = Self::value_slot(handle);
        match slot.compare_exchange(compare, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(prev) => {
                barrier::record_store(handle, new);
                self.note_assignment(handle, new);
                prev
            }
            Err(prev) => prev,
        }
    }

    /// Store the extra word (dependent secondary and friends).
    pub fn set_extra(&self, handle: Handle, extra: usize) -> Result<()> {
        let seg = self
            .segment_of(handle)
            .ok_or(GcError::InvalidHandle { address: handle })?;
        let slot = seg.slot_of(handle);
        seg.extra(slot).store(extra, Ordering::Release);
        Ok(())
    }

    /// Read the extra word.
    pub fn get_extra(&self, handle: Handle) -> Result<usize> {
        let seg = self
            .segment_of(handle)
            .ok_or(GcError::InvalidHandle { address: handle })?;
        let slot = seg.slot_of(handle);
        Ok(seg.extra(slot).load(Ordering::Acquire))
    }

    /// Set the secondary object of a dependent handle.
    pub fn set_dependent_secondary(&self, handle: Handle, secondary: usize) -> Result<()> {
        self.set_extra(handle, secondary)?;
        barrier::record_store(handle, secondary);
        self.note_assignment(handle, secondary);
        Ok(())
    }

    /// Refill or spill the cache banks of `ty` under the table lock.
    ///
    /// `returning` is a handle a destroy fast path failed to park.
    fn rebalance(&self, ty: HandleType, returning: Option<Handle>) -> Result<()> {
        let mut core = self.core.write();
        let cache = &self.caches[ty as usize];

        let mut have = cache.drain();
        if let Some(h) = returning {
            have.push(h);
        }

        if have.len() < REBALANCE_LOWATER {
            // Refill from the segments up to a full bank.
            let want = HANDLES_PER_CACHE_BANK - have.len();
            let mut got = 0usize;
            loop {
                for seg in &core.segments {
                    got += seg.alloc_handles(ty, want - got, &mut have);
                    if got == want {
                        break;
                    }
                }
                if got == want {
                    break;
                }
                core.segments.push(Arc::new(TableSegment::new()));
            }
            self.allocated_slots.fetch_add(got, Ordering::Relaxed);
        } else if have.len() > REBALANCE_HIWATER {
            // Spill the excess in free (address) order so the segment
            // allocator coalesces adjacent slots cheaply.
            have.sort_unstable();
            let spill = have.split_off(HANDLES_PER_CACHE_BANK);
            let count = spill.len();
            for h in spill {
                let seg = core
                    .segments
                    .iter()
                    .find(|s| s.contains(h))
                    .cloned()
                    .ok_or(GcError::InvalidHandle { address: h })?;
                seg.free_handle(h, ty)?;
            }
            self.allocated_slots.fetch_sub(count, Ordering::Relaxed);
            if !self.retain_segments && core.segments.len() > 1 {
                core.segments.retain(|s| !s.is_empty());
                if core.segments.is_empty() {
                    core.segments.push(Arc::new(TableSegment::new()));
                }
            }
        }

        cache.fill_banks(&have);
        Ok(())
    }
}

/// Process-wide handle store: one table bucket per heap.
pub struct HandleStore {
    tables: Vec<Arc<HandleTable>>,
    next_bucket: AtomicUsize,
}

impl HandleStore {
    pub fn new(shared: Arc<SharedHeap>, n_heaps: usize, retain_segments: bool) -> Self {
        let tables = (0..n_heaps.max(1))
            .map(|_| Arc::new(HandleTable::new(shared.clone(), retain_segments)))
            .collect();
        Self {
            tables,
            next_bucket: AtomicUsize::new(0),
        }
    }

    /// Table buckets, for scanning.
    pub fn tables(&self) -> &[Arc<HandleTable>] {
        &self.tables
    }

    /// Bucket used for the next create (round-robin).
    fn pick(&self) -> &HandleTable {
        let n = self.tables.len();
        let i = self.next_bucket.fetch_add(1, Ordering::Relaxed) % n;
        &self.tables[i]
    }

    /// Table owning `handle`.
    pub fn table_of(&self, handle: Handle) -> Result<&HandleTable> {
        self.tables
            .iter()
            .find(|t| t.segment_of(handle).is_some())
            .map(|t| t.as_ref())
            .ok_or(GcError::InvalidHandle { address: handle })
    }

    pub fn create(&self, ty: HandleType, obj: usize) -> Result<Handle> {
        self.pick().create(ty, obj)
    }

    pub fn create_with_extra(&self, ty: HandleType, obj: usize, extra: usize) -> Result<Handle> {
        self.pick().create_with_extra(ty, obj, extra)
    }

    pub fn destroy(&self, handle: Handle, ty: HandleType) -> Result<()> {
        self.table_of(handle)?.destroy(handle, ty)
    }

    pub fn fetch(&self, handle: Handle) -> usize {
        HandleTable::value_slot(handle).load(Ordering::Acquire)
    }

    pub fn assign(&self, handle: Handle, obj: usize) -> Result<()> {
        self.table_of(handle)?.assign(handle, obj);
        Ok(())
    }

    pub fn compare_exchange(&self, handle: Handle, new: usize, compare: usize) -> Result<usize> {
        Ok(self.table_of(handle)?.compare_exchange(handle, new, compare))
    }

    pub fn set_dependent_secondary(&self, handle: Handle, secondary: usize) -> Result<()> {
        self.table_of(handle)?.set_dependent_secondary(handle, secondary)
    }

    pub fn get_extra(&self, handle: Handle) -> Result<usize> {
        self.table_of(handle)?.get_extra(handle)
    }
}
