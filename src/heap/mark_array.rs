//! Background Mark Array
//!
//! One bit per 8-byte granule of heap, used by background collection:
//! set during background mark, read during background sweep. The blocking
//! collector uses the mark bit in the method-table word instead; this
//! array exists so marking can proceed while mutators run, without
//! touching object words they may be writing.

use crate::error::{GcError, Result};
use crate::util::constants::MARK_GRANULE;
use memmap2::MmapMut;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bit-per-granule mark array covering a fixed address range.
pub struct MarkArray {
    lowest: usize,
    _backing: MmapMut,
    words: *const AtomicU64,
    n_words: usize,
}

unsafe impl Send for MarkArray {}
unsafe impl Sync for MarkArray {}

impl MarkArray {
    /// Build a mark array covering `[lowest, highest)`. The anonymous
    /// backing is faulted in per page on first touch, so clean regions
    /// cost nothing physical.
    pub fn new(lowest: usize, highest: usize) -> Result<Self> {
        let granules = (highest - lowest + MARK_GRANULE - 1) / MARK_GRANULE;
        let n_words = (granules + 63) / 64;
        let backing = MmapMut::map_anon(n_words.max(1) * 8)
            .map_err(|e| GcError::VirtualMemory(format!("mark array mapping failed: {}", e)))?;
        let words = backing.as_ptr() as *const AtomicU64;
        Ok(Self {
            lowest,
            _backing: backing,
            words,
            n_words,
        })
    }

    #[inline]
    fn index(&self, addr: usize) -> (usize, u64) {
        let granule = (addr - self.lowest) / MARK_GRANULE;
        (granule / 64, 1u64 << (granule % 64))
    }

    #[inline]
    fn word(&self, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < self.n_words);
        unsafe { &*self.words.add(idx) }
    }

    /// Set the mark bit for `addr`. Returns true if it was already set.
    #[inline]
    pub fn mark(&self, addr: usize) -> bool {
        let (idx, bit) = self.index(addr);
        self.word(idx).fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Whether `addr` is marked.
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        let (idx, bit) = self.index(addr);
        self.word(idx).load(Ordering::Acquire) & bit != 0
    }

    /// Clear marks covering `[lo, hi)`.
    pub fn clear_range(&self, lo: usize, hi: usize) {
        if hi <= lo {
            return;
        }
        let (first_word, first_bit) = self.index(lo);
        let (last_word, last_bit) = self.index(hi - 1);
        if first_word == last_word {
            let mask = (last_bit | (last_bit - 1)) & !(first_bit - 1);
            self.word(first_word).fetch_and(!mask, Ordering::AcqRel);
            return;
        }
        self.word(first_word)
            .fetch_and(first_bit - 1, Ordering::AcqRel);
        for w in first_word + 1..last_word {
            self.word(w).store(0, Ordering::Relaxed);
        }
        self.word(last_word)
            .fetch_and(!(last_bit | (last_bit - 1)), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_check() {
        let ma = MarkArray::new(0x1000_0000, 0x1100_0000).unwrap();
        let addr = 0x1000_4238;
        assert!(!ma.is_marked(addr));
        assert!(!ma.mark(addr));
        assert!(ma.mark(addr));
        assert!(ma.is_marked(addr));
        // Neighboring granules unaffected.
        assert!(!ma.is_marked(addr + MARK_GRANULE));
        assert!(!ma.is_marked(addr - MARK_GRANULE));
    }

    #[test]
    fn test_clear_range() {
        let ma = MarkArray::new(0x1000_0000, 0x1100_0000).unwrap();
        let base = 0x1000_0000;
        for i in 0..256 {
            ma.mark(base + i * MARK_GRANULE);
        }
        ma.clear_range(base + 8 * MARK_GRANULE, base + 200 * MARK_GRANULE);
        for i in 0..256 {
            let expect = i < 8 || i >= 200;
            assert_eq!(ma.is_marked(base + i * MARK_GRANULE), expect, "granule {}", i);
        }
    }
}
