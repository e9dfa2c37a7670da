//! Allocation Contexts - Mutator Bump Pointers
//!
//! Each mutator thread owns an allocation context. The fast path bumps
//! `alloc_ptr`; exhaustion traps into the collector's slow path, which
//! refills the context, triggers a collection, reassigns the mutator to
//! another heap, or reports OOM.
//!
//! The collector may at any safe point turn `[alloc_ptr, alloc_limit)`
//! plus the context's slack into a free object ("fixing" the context),
//! which keeps the owning region walkable.

use crate::object;
use crate::util::constants::MIN_OBJECT_SIZE;

/// Per-thread allocation state handed between the mutator fast path and
/// the collector slow path.
///
/// A context covers `[alloc_ptr, alloc_limit)` of some region, with
/// [`MIN_OBJECT_SIZE`] bytes of slack beyond the limit so fixing can
/// always write a free-object header.
#[derive(Debug, Default, Clone)]
pub struct AllocContext {
    /// Next plug start handed to the mutator.
    pub alloc_ptr: usize,

    /// End of the usable range (exclusive); slack lies beyond it.
    pub alloc_limit: usize,

    /// Lifetime small-object bytes allocated through this context.
    pub alloc_bytes: u64,

    /// Lifetime user-object-heap bytes allocated through this context.
    pub alloc_bytes_uoh: u64,

    /// Heap this context currently allocates from (parallel case).
    pub alloc_heap: usize,

    /// Sticky home heap of the owning mutator (parallel case).
    pub home_heap: usize,
}

impl AllocContext {
    /// Fast-path allocation: bump `alloc_ptr` by `size` if it fits.
    ///
    /// Returns the object reference on success. `size` is the full
    /// footprint (header included) and must be 8-aligned.
    #[inline]
    pub fn try_alloc(&mut self, size: usize) -> Option<usize> {
        debug_assert!(size >= MIN_OBJECT_SIZE);
        let ptr = self.alloc_ptr;
        if ptr + size <= self.alloc_limit {
            self.alloc_ptr = ptr + size;
            self.alloc_bytes += size as u64;
            Some(object::obj_at(ptr))
        } else {
            None
        }
    }

    /// Whether the context currently covers any range.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alloc_ptr == self.alloc_limit
    }

    /// Install a fresh range. The caller guarantees the owning region's
    /// `allocated` cursor covers `limit + MIN_OBJECT_SIZE` of slack.
    pub fn install(&mut self, start: usize, limit: usize) {
        debug_assert!(start <= limit);
        self.alloc_ptr = start;
        self.alloc_limit = limit;
    }

    /// Fix the context: turn the unused range plus slack into a free
    /// object and detach the context.
    ///
    /// # Safety
    /// The covered range must belong to a region whose `allocated`
    /// cursor is exactly `alloc_limit + MIN_OBJECT_SIZE`, and the
    /// context's owner must be suspended.
    pub unsafe fn fix(&mut self) {
        if self.alloc_limit == 0 {
            return;
        }
        let gap = self.alloc_limit - self.alloc_ptr + MIN_OBJECT_SIZE;
        object::make_free_object(self.alloc_ptr, gap);
        self.alloc_ptr = 0;
        self.alloc_limit = 0;
    }
}

/// Allocation request flags, mirrored from the mutator runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags(pub u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Register the object for finalization.
    pub const FINALIZE: AllocFlags = AllocFlags(1 << 0);
    /// Allocate on the large object heap regardless of size.
    pub const LARGE_OBJECT_HEAP: AllocFlags = AllocFlags(1 << 1);
    /// Allocate on the pinned object heap.
    pub const PINNED_OBJECT_HEAP: AllocFlags = AllocFlags(1 << 2);
    /// The caller will fully initialize the object; zeroing may be skipped.
    pub const ZEROING_OPTIONAL: AllocFlags = AllocFlags(1 << 3);

    #[inline]
    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn union(self, other: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | other.0)
    }
}
