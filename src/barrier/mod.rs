//! Write Barrier - Mutator-Side Card Marking
//!
//! Every mutator reference store goes through [`write_ref`]: the store
//! itself, then the card covering the written slot is set (plus its
//! bundle bit), and while background marking is active the dirtied page
//! is recorded for the revisit pass.
//!
//! Over-approximation is legal and intentional: the barrier sets the
//! card whenever both the slot and the stored value lie in the heap
//! range, without comparing generations. Cards are never cleared by the
//! mutator.
//!
//! The barrier reads process-wide globals (`card_table_base`,
//! `lowest_address`, `highest_address`, `heap_type`). They are published
//! as one immutable snapshot behind an atomic pointer: writers build a
//! new snapshot and swap it in with release ordering; the old snapshot
//! is never mutated in place.

use crate::platform::WriteWatch;
use crate::util::constants::{CARD_SIZE, CARD_WORDS_PER_BUNDLE_BIT, CARD_WORD_WIDTH};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

/// Collector flavor, published for the mutator runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapType {
    Invalid,
    Workstation,
    Server,
}

/// Immutable snapshot of the globals the barrier fast path reads.
pub struct BarrierGlobals {
    pub card_words: *const AtomicU32,
    pub bundle_words: *const AtomicU32,
    pub lowest_address: usize,
    pub highest_address: usize,
    pub write_watch: *const WriteWatch,
    pub heap_type: HeapType,
}

unsafe impl Send for BarrierGlobals {}
unsafe impl Sync for BarrierGlobals {}

/// NULL until the collector initializes; mutators must tolerate that.
static GLOBALS: AtomicPtr<BarrierGlobals> = AtomicPtr::new(std::ptr::null_mut());

/// Shadow-heap verification switch (heavy; test configurations only).
static SHADOW_ENABLED: AtomicBool = AtomicBool::new(false);

lazy_static::lazy_static! {
    /// Last value stored through the barrier, per slot. Cross-checked by
    /// the verifier to catch stores that bypassed the barrier.
    static ref SHADOW_HEAP: Mutex<HashMap<usize, usize>> = Mutex::new(HashMap::new());
}

/// Publish a new globals snapshot. The previous snapshot is leaked: a
/// mutator may still be reading it, and snapshots are a handful of words
/// published a handful of times per process lifetime.
pub fn publish_globals(globals: BarrierGlobals) {
    let boxed = Box::into_raw(Box::new(globals));
    GLOBALS.swap(boxed, Ordering::AcqRel);
}

/// Current globals snapshot, if published.
#[inline]
pub fn globals() -> Option<&'static BarrierGlobals> {
    let p = GLOBALS.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

/// Heap type published to the mutator runtime.
pub fn heap_type() -> HeapType {
    globals().map(|g| g.heap_type).unwrap_or(HeapType::Invalid)
}

/// Enable or disable shadow-heap tracking of barriered stores.
pub fn set_shadow_enabled(enabled: bool) {
    if enabled {
        SHADOW_HEAP.lock().clear();
    }
    SHADOW_ENABLED.store(enabled, Ordering::Release);
}

/// Reconcile the shadow heap with a GC-performed slot update.
pub fn shadow_gc_update(slot: usize, value: usize) {
    if SHADOW_ENABLED.load(Ordering::Acquire) {
        SHADOW_HEAP.lock().insert(slot, value);
    }
}

/// Shadow value recorded for `slot`, if tracking is on.
pub fn shadow_value(slot: usize) -> Option<usize> {
    if SHADOW_ENABLED.load(Ordering::Acquire) {
        SHADOW_HEAP.lock().get(&slot).copied()
    } else {
        None
    }
}

/// Store `value` into the reference slot at `slot`, then run the card
/// marking sequence.
///
/// # Safety
/// `slot` must be a valid, writable reference slot of a live object (or
/// a root slot outside the heap, for which only the raw store happens).
#[inline]
pub unsafe fn write_ref(slot: usize, value: usize) {
    std::ptr::write(slot as *mut usize, value);
    record_store(slot, value);
}

/// The card-marking sequence alone, for callers that performed the store
/// themselves (e.g. compare-exchange users).
#[inline]
pub fn record_store(slot: usize, value: usize) {
    let Some(g) = globals() else { return };

    if SHADOW_ENABLED.load(Ordering::Acquire) {
        SHADOW_HEAP.lock().insert(slot, value);
    }

    if slot < g.lowest_address || slot >= g.highest_address {
        return; // store into a root or native slot
    }

    // Dirty-page tracking for concurrent mark.
    let ww = unsafe { &*g.write_watch };
    if ww.is_active() {
        ww.record(slot);
    }

    if value == 0 || value < g.lowest_address || value >= g.highest_address {
        return;
    }

    // Card + bundle. Same-generation stores may set cards too; scanning
    // tolerates the over-approximation.
    let card = (slot - g.lowest_address) / CARD_SIZE;
    let word = card / CARD_WORD_WIDTH;
    let bit = 1u32 << (card % CARD_WORD_WIDTH);
    unsafe {
        let w = &*g.card_words.add(word);
        if w.load(Ordering::Relaxed) & bit == 0 {
            w.fetch_or(bit, Ordering::Relaxed);
        }
        let bundle_bit = word / CARD_WORDS_PER_BUNDLE_BIT;
        let bw = &*g.bundle_words.add(bundle_bit / CARD_WORD_WIDTH);
        let bbit = 1u32 << (bundle_bit % CARD_WORD_WIDTH);
        if bw.load(Ordering::Relaxed) & bbit == 0 {
            bw.fetch_or(bbit, Ordering::Relaxed);
        }
    }
}

/// Read a reference slot.
///
/// # Safety
/// `slot` must be a valid reference slot.
#[inline]
pub unsafe fn read_ref(slot: usize) -> usize {
    std::ptr::read(slot as *const usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_start_null_then_publish() {
        // Publication is process-wide and snapshots are never reclaimed,
        // so the tables backing this one are leaked deliberately.
        let ct = Box::leak(Box::new(
            crate::heap::CardTable::new(0x7000_0000, 0x7100_0000).unwrap(),
        ));
        let ww = Box::leak(Box::new(WriteWatch::new(0x7000_0000, 0x0100_0000)));
        publish_globals(BarrierGlobals {
            card_words: ct.card_words_ptr(),
            bundle_words: ct.bundle_words_ptr(),
            lowest_address: 0x7000_0000,
            highest_address: 0x7100_0000,
            write_watch: ww,
            heap_type: HeapType::Workstation,
        });
        assert_eq!(heap_type(), HeapType::Workstation);

        // A store with both slot and value in range sets the card.
        let slot = 0x7000_4000;
        record_store(slot, 0x7000_8000);
        assert!(ct.is_card_set(slot));

        // Null stores leave cards alone.
        let clean = 0x7080_0000;
        record_store(clean, 0);
        assert!(!ct.is_card_set(clean));
    }
}
