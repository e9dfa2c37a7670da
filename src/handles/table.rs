//! Handle Table Segments
//!
//! A handle table is an ordered sequence of segments. A segment packs a
//! fixed number of handle slots plus metadata: a free mask per block, an
//! age byte per clump, a block-to-type map, and per-type allocation
//! chains. A handle is the address of its value slot, stable for the
//! handle's lifetime.
//!
//! Layout constants: 16 handles per clump, 4 clumps per block, 64 blocks
//! per segment: 4096 handles per segment, roughly 64KB of value plus
//! extra-info storage.

use crate::error::{GcError, Result};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Handles per age-map clump.
pub const HANDLES_PER_CLUMP: usize = 16;

/// Clumps per allocation block.
pub const CLUMPS_PER_BLOCK: usize = 4;

/// Handles per allocation block.
pub const HANDLES_PER_BLOCK: usize = HANDLES_PER_CLUMP * CLUMPS_PER_BLOCK;

/// Blocks per segment.
pub const BLOCKS_PER_SEGMENT: usize = 64;

/// Handles per segment.
pub const HANDLES_PER_SEGMENT: usize = HANDLES_PER_BLOCK * BLOCKS_PER_SEGMENT;

/// Clumps per segment.
pub const CLUMPS_PER_SEGMENT: usize = CLUMPS_PER_BLOCK * BLOCKS_PER_SEGMENT;

/// Block-type value of an unassigned block.
pub const BLOCK_TYPE_FREE: u8 = 0xFF;

/// Chain terminator.
pub const NO_BLOCK: u8 = 0xFF;

/// Handle kinds, each with distinct reachability semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandleType {
    /// Prevents collection of the target.
    Strong = 0,
    /// Zeroed when the target is only weakly reachable, before
    /// finalization promotes it.
    WeakShort = 1,
    /// As WeakShort but cleared after finalization, so finalizable
    /// objects stay visible until their finalizer has run.
    WeakLong = 2,
    /// Target can neither be collected nor moved.
    Pinned = 3,
    /// As Pinned, plus object-specific reachability of embedded buffers.
    AsyncPinned = 4,
    /// Primary keeps secondary alive only while the primary is
    /// otherwise reachable.
    Dependent = 5,
    /// Alive iff the out-of-band count in the extra word is nonzero.
    RefCounted = 6,
    /// Strong, carrying an approximate size fed to the tuner.
    SizeRef = 7,
}

/// Number of handle types.
pub const NUM_HANDLE_TYPES: usize = 8;

/// All handle types, in scan order.
pub const ALL_HANDLE_TYPES: [HandleType; NUM_HANDLE_TYPES] = [
    HandleType::Strong,
    HandleType::WeakShort,
    HandleType::WeakLong,
    HandleType::Pinned,
    HandleType::AsyncPinned,
    HandleType::Dependent,
    HandleType::RefCounted,
    HandleType::SizeRef,
];

impl HandleType {
    pub fn from_u8(v: u8) -> Option<HandleType> {
        ALL_HANDLE_TYPES.get(v as usize).copied()
    }

    /// Whether this type alone keeps its target alive.
    pub fn is_strong(self) -> bool {
        matches!(
            self,
            HandleType::Strong | HandleType::Pinned | HandleType::AsyncPinned | HandleType::SizeRef
        )
    }

    /// Whether this type forbids relocation of its target.
    pub fn is_pinning(self) -> bool {
        matches!(self, HandleType::Pinned | HandleType::AsyncPinned)
    }
}

/// One segment of handle storage.
pub struct TableSegment {
    /// Handle value slots (object references; 0 = null).
    values: Box<[AtomicUsize]>,

    /// Extra info per slot (dependent secondary, ref count, size).
    extra: Box<[AtomicUsize]>,

    /// Age byte per clump: lower bound on the generation of every
    /// object the clump's slots reference.
    ages: Box<[AtomicU8]>,

    /// Type of each block; `BLOCK_TYPE_FREE` when unassigned.
    block_type: [AtomicU8; BLOCKS_PER_SEGMENT],

    /// Next block in the per-type allocation chain.
    next_block: [AtomicU8; BLOCKS_PER_SEGMENT],

    /// Free masks: one bit per handle, set = slot free.
    free_mask: [AtomicU64; BLOCKS_PER_SEGMENT],

    /// Head of each type's allocation chain.
    chain_head: [AtomicU8; NUM_HANDLE_TYPES],

    /// Free handles per type chain.
    free_count: [AtomicUsize; NUM_HANDLE_TYPES],

    /// Unassigned blocks remaining.
    free_blocks: AtomicUsize,
}

impl TableSegment {
    pub fn new() -> Self {
        let mut values = Vec::with_capacity(HANDLES_PER_SEGMENT);
        values.resize_with(HANDLES_PER_SEGMENT, || AtomicUsize::new(0));
        let mut extra = Vec::with_capacity(HANDLES_PER_SEGMENT);
        extra.resize_with(HANDLES_PER_SEGMENT, || AtomicUsize::new(0));
        let mut ages = Vec::with_capacity(CLUMPS_PER_SEGMENT);
        ages.resize_with(CLUMPS_PER_SEGMENT, || AtomicU8::new(0));

        Self {
            values: values.into_boxed_slice(),
            extra: extra.into_boxed_slice(),
            ages: ages.into_boxed_slice(),
            block_type: [(); BLOCKS_PER_SEGMENT].map(|_| AtomicU8::new(BLOCK_TYPE_FREE)),
            next_block: [(); BLOCKS_PER_SEGMENT].map(|_| AtomicU8::new(NO_BLOCK)),
            free_mask: [(); BLOCKS_PER_SEGMENT].map(|_| AtomicU64::new(0)),
            chain_head: [(); NUM_HANDLE_TYPES].map(|_| AtomicU8::new(NO_BLOCK)),
            free_count: [(); NUM_HANDLE_TYPES].map(|_| AtomicUsize::new(0)),
            free_blocks: AtomicUsize::new(BLOCKS_PER_SEGMENT),
        }
    }

    /// First slot address, for range checks.
    #[inline]
    pub fn base(&self) -> usize {
        self.values.as_ptr() as usize
    }

    /// Whether `handle` addresses a slot of this segment.
    #[inline]
    pub fn contains(&self, handle: usize) -> bool {
        let base = self.base();
        let end = base + HANDLES_PER_SEGMENT * std::mem::size_of::<usize>();
        handle >= base && handle < end && (handle - base) % std::mem::size_of::<usize>() == 0
    }

    /// Slot index of a handle.
    #[inline]
    pub fn slot_of(&self, handle: usize) -> usize {
        (handle - self.base()) / std::mem::size_of::<usize>()
    }

    /// Handle address of a slot index.
    #[inline]
    pub fn handle_of(&self, slot: usize) -> usize {
        self.base() + slot * std::mem::size_of::<usize>()
    }

    #[inline]
    pub fn value(&self, slot: usize) -> &AtomicUsize {
        &self.values[slot]
    }

    #[inline]
    pub fn extra(&self, slot: usize) -> &AtomicUsize {
        &self.extra[slot]
    }

    #[inline]
    pub fn age(&self, clump: usize) -> &AtomicU8 {
        &self.ages[clump]
    }

    #[inline]
    pub fn block_type_of(&self, block: usize) -> u8 {
        self.block_type[block].load(Ordering::Acquire)
    }

    /// Whether the slot is currently allocated to a live handle.
    #[inline]
    pub fn is_slot_live(&self, slot: usize) -> bool {
        let block = slot / HANDLES_PER_BLOCK;
        if self.block_type_of(block) == BLOCK_TYPE_FREE {
            return false;
        }
        let bit = 1u64 << (slot % HANDLES_PER_BLOCK);
        self.free_mask[block].load(Ordering::Acquire) & bit == 0
    }

    /// Free handles available for `ty` (chained blocks plus unassigned
    /// blocks).
    pub fn available_for(&self, ty: HandleType) -> usize {
        self.free_count[ty as usize].load(Ordering::Relaxed)
            + self.free_blocks.load(Ordering::Relaxed) * HANDLES_PER_BLOCK
    }

    /// Allocate up to `want` handles of `ty`, pushing their addresses to
    /// `out`. Returns how many were allocated. Runs under the table lock.
    pub fn alloc_handles(&self, ty: HandleType, want: usize, out: &mut Vec<usize>) -> usize {
        let t = ty as usize;
        let mut taken = 0usize;

        // Walk the type's chain first.
        let mut block = self.chain_head[t].load(Ordering::Relaxed);
        while taken < want && block != NO_BLOCK {
            taken += self.take_from_block(block as usize, want - taken, out);
            block = self.next_block[block as usize].load(Ordering::Relaxed);
        }

        // Claim unassigned blocks as needed.
        while taken < want {
            let Some(fresh) = self.claim_free_block(ty) else {
                break;
            };
            taken += self.take_from_block(fresh, want - taken, out);
        }

        self.free_count[t].fetch_sub(taken, Ordering::Relaxed);
        taken
    }

    fn take_from_block(&self, block: usize, want: usize, out: &mut Vec<usize>) -> usize {
        let mask = &self.free_mask[block];
        let mut taken = 0usize;
        let mut bits = mask.load(Ordering::Relaxed);
        while taken < want && bits != 0 {
            let bit = bits.trailing_zeros() as usize;
            bits &= !(1u64 << bit);
            mask.fetch_and(!(1u64 << bit), Ordering::AcqRel);
            let slot = block * HANDLES_PER_BLOCK + bit;
            self.values[slot].store(0, Ordering::Release);
            self.extra[slot].store(0, Ordering::Release);
            out.push(self.handle_of(slot));
            taken += 1;
        }
        taken
    }

    fn claim_free_block(&self, ty: HandleType) -> Option<usize> {
        for block in 0..BLOCKS_PER_SEGMENT {
            if self.block_type[block].load(Ordering::Relaxed) == BLOCK_TYPE_FREE {
                self.block_type[block].store(ty as u8, Ordering::Release);
                self.free_mask[block].store(u64::MAX, Ordering::Release);
                // Push onto the chain head.
                let t = ty as usize;
                let head = self.chain_head[t].load(Ordering::Relaxed);
                self.next_block[block].store(head, Ordering::Relaxed);
                self.chain_head[t].store(block as u8, Ordering::Relaxed);
                self.free_blocks.fetch_sub(1, Ordering::Relaxed);
                self.free_count[t].fetch_add(HANDLES_PER_BLOCK, Ordering::Relaxed);
                // Fresh clumps reference nothing yet: age 0 is the
                // conservative bound.
                let first_clump = block * CLUMPS_PER_BLOCK;
                for c in first_clump..first_clump + CLUMPS_PER_BLOCK {
                    self.ages[c].store(0, Ordering::Relaxed);
                }
                return Some(block);
            }
        }
        None
    }

    /// Free one handle. The caller has verified it belongs here and
    /// holds the table lock. Fully-free blocks return to the segment's
    /// free-block pool.
    pub fn free_handle(&self, handle: usize, ty: HandleType) -> Result<()> {
        let slot = self.slot_of(handle);
        let block = slot / HANDLES_PER_BLOCK;
        if self.block_type_of(block) != ty as u8 {
            return Err(GcError::InvalidHandle { address: handle });
        }
        let bit = 1u64 << (slot % HANDLES_PER_BLOCK);
        let old = self.free_mask[block].fetch_or(bit, Ordering::AcqRel);
        if old & bit != 0 {
            return Err(GcError::InvalidHandle { address: handle });
        }
        self.values[slot].store(0, Ordering::Release);
        self.extra[slot].store(0, Ordering::Release);
        self.free_count[ty as usize].fetch_add(1, Ordering::Relaxed);

        if old | bit == u64::MAX {
            self.release_block(block, ty);
        }
        Ok(())
    }

    /// Return a fully-free block to the unassigned pool.
    fn release_block(&self, block: usize, ty: HandleType) {
        let t = ty as usize;
        // Unlink from the chain.
        let mut prev = NO_BLOCK;
        let mut cur = self.chain_head[t].load(Ordering::Relaxed);
        while cur != NO_BLOCK {
            if cur as usize == block {
                let next = self.next_block[block].load(Ordering::Relaxed);
                if prev == NO_BLOCK {
                    self.chain_head[t].store(next, Ordering::Relaxed);
                } else {
                    self.next_block[prev as usize].store(next, Ordering::Relaxed);
                }
                break;
            }
            prev = cur;
            cur = self.next_block[cur as usize].load(Ordering::Relaxed);
        }
        self.next_block[block].store(NO_BLOCK, Ordering::Relaxed);
        self.block_type[block].store(BLOCK_TYPE_FREE, Ordering::Release);
        self.free_mask[block].store(0, Ordering::Release);
        self.free_count[t].fetch_sub(HANDLES_PER_BLOCK, Ordering::Relaxed);
        self.free_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether every block is unassigned.
    pub fn is_empty(&self) -> bool {
        self.free_blocks.load(Ordering::Relaxed) == BLOCKS_PER_SEGMENT
    }
}

impl Default for TableSegment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free_roundtrip() {
        let seg = TableSegment::new();
        let mut out = Vec::new();
        let n = seg.alloc_handles(HandleType::Strong, 3, &mut out);
        assert_eq!(n, 3);
        assert_eq!(out.len(), 3);
        for &h in &out {
            assert!(seg.contains(h));
            assert!(seg.is_slot_live(seg.slot_of(h)));
        }

        for &h in &out {
            seg.free_handle(h, HandleType::Strong).unwrap();
        }
        // All blocks returned to the free pool.
        assert!(seg.is_empty());
    }

    #[test]
    fn test_free_wrong_type_rejected() {
        let seg = TableSegment::new();
        let mut out = Vec::new();
        seg.alloc_handles(HandleType::WeakShort, 1, &mut out);
        let err = seg.free_handle(out[0], HandleType::Strong).unwrap_err();
        assert!(matches!(err, GcError::InvalidHandle { .. }));
    }

    #[test]
    fn test_double_free_rejected() {
        let seg = TableSegment::new();
        let mut out = Vec::new();
        seg.alloc_handles(HandleType::Strong, 1, &mut out);
        seg.free_handle(out[0], HandleType::Strong).unwrap();
        // The block went back to the pool, so the type no longer matches.
        assert!(seg.free_handle(out[0], HandleType::Strong).is_err());
    }

    #[test]
    fn test_blocks_chain_per_type() {
        let seg = TableSegment::new();
        let mut strong = Vec::new();
        let mut weak = Vec::new();
        // More than one block's worth of strong handles.
        seg.alloc_handles(HandleType::Strong, HANDLES_PER_BLOCK + 4, &mut strong);
        seg.alloc_handles(HandleType::WeakShort, 2, &mut weak);
        assert_eq!(strong.len(), HANDLES_PER_BLOCK + 4);

        // Slots of different types never share a block.
        let strong_blocks: std::collections::HashSet<_> = strong
            .iter()
            .map(|&h| seg.slot_of(h) / HANDLES_PER_BLOCK)
            .collect();
        let weak_blocks: std::collections::HashSet<_> = weak
            .iter()
            .map(|&h| seg.slot_of(h) / HANDLES_PER_BLOCK)
            .collect();
        assert!(strong_blocks.is_disjoint(&weak_blocks));
        assert_eq!(strong_blocks.len(), 2);
    }
}
