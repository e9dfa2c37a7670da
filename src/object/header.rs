//! Object Header
//!
//! One machine word below every object reference. Holds the hash /
//! sync-block index in the low bits and GC flags in the high bits.
//!
//! ```text
//! ┌───────┬──────────┬───────────────────────────────┐
//! │ 63-31 │ 30 29    │         28-0                  │
//! │ unused│ Pin Fin  │   hash / sync-block index     │
//! └───────┴──────────┴───────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

/// Pin flag: the object must not be moved by compaction.
pub const HEADER_PIN_BIT: usize = 1 << 30;

/// Finalization-registered flag: the object has a slot in the
/// finalization queue.
pub const HEADER_FINALIZE_BIT: usize = 1 << 29;

/// Mask of the hash / sync-block index field.
pub const HEADER_HASH_MASK: usize = (1 << 29) - 1;

/// Header word of a managed object.
#[repr(transparent)]
pub struct ObjectHeader {
    bits: AtomicUsize,
}

impl ObjectHeader {
    /// Whether the pin flag is set.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.bits.load(Ordering::Relaxed) & HEADER_PIN_BIT != 0
    }

    /// Set the pin flag. Returns true if it was already set.
    #[inline]
    pub fn set_pinned(&self) -> bool {
        self.bits.fetch_or(HEADER_PIN_BIT, Ordering::AcqRel) & HEADER_PIN_BIT != 0
    }

    /// Clear the pin flag.
    #[inline]
    pub fn clear_pinned(&self) {
        self.bits.fetch_and(!HEADER_PIN_BIT, Ordering::AcqRel);
    }

    /// Whether the object is registered for finalization.
    #[inline]
    pub fn is_finalize_registered(&self) -> bool {
        self.bits.load(Ordering::Relaxed) & HEADER_FINALIZE_BIT != 0
    }

    /// Mark the object as registered for finalization.
    #[inline]
    pub fn set_finalize_registered(&self) {
        self.bits.fetch_or(HEADER_FINALIZE_BIT, Ordering::AcqRel);
    }

    /// Clear the finalization-registered flag (after finalizer suppression
    /// or once the finalizer has run).
    #[inline]
    pub fn clear_finalize_registered(&self) {
        self.bits.fetch_and(!HEADER_FINALIZE_BIT, Ordering::AcqRel);
    }

    /// Stored hash / sync-block index.
    #[inline]
    pub fn hash(&self) -> usize {
        self.bits.load(Ordering::Relaxed) & HEADER_HASH_MASK
    }

    /// Store a hash / sync-block index, preserving the GC flags.
    pub fn set_hash(&self, hash: usize) {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let new = (current & !HEADER_HASH_MASK) | (hash & HEADER_HASH_MASK);
            match self.bits.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(v) => current = v,
            }
        }
    }

    /// Raw header bits.
    #[inline]
    pub fn raw(&self) -> usize {
        self.bits.load(Ordering::Relaxed)
    }
}
