//! Allocation Module - Slow Path and Refill
//!
//! The mutator fast path lives in [`context::AllocContext::try_alloc`].
//! When it fails, the collector's slow path runs under the per-(heap,
//! object-heap) more-space lock and either refills the context (free
//! list first, then the tail region's frontier, then a fresh region),
//! asks for a collection, or reports OOM with the failure reason.

pub mod context;
pub mod free_list;

pub use context::{AllocContext, AllocFlags};

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::heap::generation::is_uoh_generation;
use crate::heap::{region_frontier_fits, Heap, SharedHeap, LOH_GENERATION, MAX_SOH_GENERATION};
use crate::object;
use crate::util::align_up;
use crate::util::constants::{DATA_ALIGNMENT, MIN_OBJECT_SIZE};
use std::sync::Arc;

/// Default refill quantum for small-object allocation contexts.
pub const ALLOC_QUANTUM: usize = 8 * 1024;

/// Verdict of a slow-path attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreSpace {
    /// The context was refilled; retry the fast path.
    Fitted,
    /// A user-object-heap object was carved at this address (already a
    /// walkable free object; the caller overwrites the method table).
    FittedUoh(usize),
    /// A collection of (at least) this generation is required first.
    NeedGc(usize),
}

/// Slow-path allocator over the shared heap resources.
pub struct Allocator {
    shared: Arc<SharedHeap>,
    config: Arc<GcConfig>,
}

impl Allocator {
    pub fn new(shared: Arc<SharedHeap>, config: Arc<GcConfig>) -> Self {
        Self { shared, config }
    }

    /// Small-object slow path: refill `ctx` so at least `size` bytes
    /// fit. `ignore_budget` lets a no-GC region keep allocating past an
    /// exhausted budget.
    pub fn allocate_more_space_soh(
        &self,
        heap: &Heap,
        ctx: &mut AllocContext,
        size: usize,
        ignore_budget: bool,
    ) -> Result<MoreSpace> {
        debug_assert!(size < self.config.loh_threshold);
        let _msl = heap.soh_msl.lock();
        let mut core = heap.core.lock();
        let gen0 = core.generation_mut(0);

        if gen0.dd.budget_exhausted() && !ignore_budget {
            return Ok(MoreSpace::NeedGc(0));
        }

        let quantum = align_up(size.max(ALLOC_QUANTUM), DATA_ALIGNMENT);

        // Try to extend the context in place when it still owns the tail
        // region's frontier.
        if ctx.alloc_limit != 0 {
            if let Some(tail) = gen0.tail_region() {
                if tail.allocated() == ctx.alloc_limit + MIN_OBJECT_SIZE
                    && region_frontier_fits(tail, ctx.alloc_limit + quantum - tail.allocated())
                    && tail.contains(ctx.alloc_limit)
                {
                    let old_allocated = tail.allocated();
                    let new_limit = ctx.alloc_limit + quantum;
                    self.shared
                        .ensure_committed(tail, new_limit + MIN_OBJECT_SIZE)?;
                    tail.set_allocated(new_limit + MIN_OBJECT_SIZE);
                    unsafe {
                        zero_range(old_allocated, new_limit + MIN_OBJECT_SIZE);
                    }
                    ctx.alloc_limit = new_limit;
                    gen0.dd.charge(quantum);
                    return Ok(MoreSpace::Fitted);
                }
            }
            // The context cannot continue where it is: seal its range.
            let gap = ctx.alloc_limit - ctx.alloc_ptr + MIN_OBJECT_SIZE;
            unsafe { ctx.fix() };
            gen0.allocator.report_free_obj(gap);
        }

        // Free-list fit: the whole item becomes the context's range.
        if let Some((item, item_size)) =
            unsafe { gen0.allocator.take_first_fit(size + MIN_OBJECT_SIZE) }
        {
            let plug = object::plug_start(item);
            unsafe {
                zero_range(plug, plug + item_size);
            }
            ctx.install(plug, plug + item_size - MIN_OBJECT_SIZE);
            gen0.dd.charge(item_size);
            return Ok(MoreSpace::Fitted);
        }

        // Frontier of the tail region, growing the region set on demand.
        loop {
            if let Some(tail) = gen0.tail_region() {
                if region_frontier_fits(tail, quantum) {
                    let start = tail.allocated();
                    let limit = start + quantum;
                    self.shared.ensure_committed(tail, limit + MIN_OBJECT_SIZE)?;
                    tail.set_allocated(limit + MIN_OBJECT_SIZE);
                    unsafe {
                        zero_range(start, limit + MIN_OBJECT_SIZE);
                    }
                    ctx.install(start, limit);
                    gen0.dd.charge(quantum + MIN_OBJECT_SIZE);
                    return Ok(MoreSpace::Fitted);
                }
            }
            match self.shared.new_region(0, heap.number, false, 0) {
                Ok(region) => {
                    gen0.regions.push(region);
                }
                Err(GcError::OomReserve { .. }) => {
                    // Out of address space: a collection may free regions.
                    return Ok(MoreSpace::NeedGc(MAX_SOH_GENERATION));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// User-object-heap slow path: carve `size` bytes on LOH or POH.
    ///
    /// The carved span is returned as a walkable free object; the caller
    /// installs the real method table.
    pub fn allocate_uoh(
        &self,
        heap: &Heap,
        gen_num: usize,
        size: usize,
        ignore_budget: bool,
    ) -> Result<MoreSpace> {
        debug_assert!(is_uoh_generation(gen_num));
        let size = align_up(size.max(MIN_OBJECT_SIZE), DATA_ALIGNMENT);
        let _msl = heap.uoh_msl.lock();
        let mut core = heap.core.lock();
        let gen = core.generation_mut(gen_num);

        if gen.dd.budget_exhausted() && !ignore_budget {
            return Ok(MoreSpace::NeedGc(MAX_SOH_GENERATION));
        }

        // Free list first. Request size + MIN so any remainder can be
        // re-threaded as a free object.
        if let Some((item, item_size)) =
            unsafe { gen.allocator.take_first_fit(size + MIN_OBJECT_SIZE) }
        {
            let plug = object::plug_start(item);
            unsafe {
                zero_range(plug, plug + size);
                object::make_free_object(plug, size);
                let rem = item_size - size;
                if rem > 0 {
                    debug_assert!(rem >= MIN_OBJECT_SIZE);
                    object::make_free_object(plug + size, rem);
                    gen.allocator.thread_item_front(object::obj_at(plug + size), rem);
                }
            }
            gen.dd.charge(size);
            return Ok(MoreSpace::FittedUoh(object::obj_at(plug)));
        }

        // Frontier of the tail region, growing the region set on demand.
        loop {
            if let Some(tail) = gen.regions.last() {
                if tail.allocated() + size <= tail.reserved_end() {
                    let plug = tail.allocated();
                    self.shared.ensure_committed(tail, plug + size)?;
                    tail.set_allocated(plug + size);
                    unsafe {
                        zero_range(plug, plug + size);
                        object::make_free_object(plug, size);
                    }
                    gen.dd.charge(size);
                    return Ok(MoreSpace::FittedUoh(object::obj_at(plug)));
                }
            }
            match self
                .shared
                .new_region(gen_num, heap.number, true, size + MIN_OBJECT_SIZE)
            {
                Ok(region) => {
                    gen.regions.push(region);
                }
                Err(GcError::OomReserve { .. }) => {
                    return Ok(MoreSpace::NeedGc(MAX_SOH_GENERATION));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Generation an allocation request lands in.
    pub fn target_generation(&self, size: usize, flags: AllocFlags) -> usize {
        if flags.contains(AllocFlags::PINNED_OBJECT_HEAP) {
            crate::heap::POH_GENERATION
        } else if flags.contains(AllocFlags::LARGE_OBJECT_HEAP) || size >= self.config.loh_threshold
        {
            LOH_GENERATION
        } else {
            0
        }
    }
}

/// Zero a byte range.
///
/// # Safety
/// The range must be committed and exclusively owned by the caller.
unsafe fn zero_range(lo: usize, hi: usize) {
    std::ptr::write_bytes(lo as *mut u8, 0, hi - lo);
}
