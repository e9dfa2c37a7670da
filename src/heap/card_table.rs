//! Card Table and Card Bundles
//!
//! One bit per `CARD_SIZE` bytes of heap. A set card signals "this card
//! may contain a reference from an older generation into a younger
//! generation". Over-approximation is legal: the barrier may set cards
//! for same-generation stores; it never clears them. Cards are cleared
//! by the collector during collections of the target generation.
//!
//! Card bundles are a second-level bit array, one bit per
//! `CARD_WORDS_PER_BUNDLE_BIT` card words, letting scans skip large
//! clean spans without touching the card words themselves.

use crate::error::{GcError, Result};
use crate::util::constants::{CARD_SIZE, CARD_WORDS_PER_BUNDLE_BIT, CARD_WORD_WIDTH};
use memmap2::MmapMut;
use std::sync::atomic::{AtomicU32, Ordering};

/// Card state captured over a byte range, carried across a plug move.
pub struct CardSnapshot {
    /// First byte of the captured range.
    lo: usize,
    /// Base address of the first captured card.
    first_card_base: usize,
    /// One flag per card covering the range.
    bits: Vec<bool>,
}

/// Card table covering a fixed address range.
pub struct CardTable {
    lowest: usize,
    highest: usize,
    /// Backing for the card words (kept alive for the table's lifetime).
    _card_backing: MmapMut,
    cards: *const AtomicU32,
    n_card_words: usize,
    _bundle_backing: MmapMut,
    bundles: *const AtomicU32,
    n_bundle_words: usize,
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

impl CardTable {
    /// Build a card table covering `[lowest, highest)`.
    pub fn new(lowest: usize, highest: usize) -> Result<Self> {
        let bytes = highest - lowest;
        let n_cards = (bytes + CARD_SIZE - 1) / CARD_SIZE;
        let n_card_words = (n_cards + CARD_WORD_WIDTH - 1) / CARD_WORD_WIDTH;
        let n_bundle_bits =
            (n_card_words + CARD_WORDS_PER_BUNDLE_BIT - 1) / CARD_WORDS_PER_BUNDLE_BIT;
        let n_bundle_words = (n_bundle_bits + CARD_WORD_WIDTH - 1) / CARD_WORD_WIDTH;

        let card_backing = MmapMut::map_anon(n_card_words.max(1) * 4)
            .map_err(|e| GcError::VirtualMemory(format!("card table mapping failed: {}", e)))?;
        let bundle_backing = MmapMut::map_anon(n_bundle_words.max(1) * 4)
            .map_err(|e| GcError::VirtualMemory(format!("card bundle mapping failed: {}", e)))?;

        let cards = card_backing.as_ptr() as *const AtomicU32;
        let bundles = bundle_backing.as_ptr() as *const AtomicU32;

        Ok(Self {
            lowest,
            highest,
            _card_backing: card_backing,
            cards,
            n_card_words,
            _bundle_backing: bundle_backing,
            bundles,
            n_bundle_words,
        })
    }

    /// First covered address.
    #[inline]
    pub fn lowest(&self) -> usize {
        self.lowest
    }

    /// One-past-last covered address.
    #[inline]
    pub fn highest(&self) -> usize {
        self.highest
    }

    /// Raw card-word pointer for publication to the write barrier.
    pub fn card_words_ptr(&self) -> *const AtomicU32 {
        self.cards
    }

    /// Raw bundle-word pointer for publication to the write barrier.
    pub fn bundle_words_ptr(&self) -> *const AtomicU32 {
        self.bundles
    }

    /// Card index of an address.
    #[inline]
    pub fn card_of(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.lowest && addr < self.highest);
        (addr - self.lowest) / CARD_SIZE
    }

    /// First address covered by a card.
    #[inline]
    pub fn card_address(&self, card: usize) -> usize {
        self.lowest + card * CARD_SIZE
    }

    #[inline]
    fn card_word(&self, word: usize) -> &AtomicU32 {
        debug_assert!(word < self.n_card_words);
        unsafe { &*self.cards.add(word) }
    }

    #[inline]
    fn bundle_word(&self, word: usize) -> &AtomicU32 {
        debug_assert!(word < self.n_bundle_words);
        unsafe { &*self.bundles.add(word) }
    }

    /// Set the card covering `addr` plus its bundle bit.
    #[inline]
    pub fn set_card(&self, addr: usize) {
        let card = self.card_of(addr);
        let word = card / CARD_WORD_WIDTH;
        let bit = 1u32 << (card % CARD_WORD_WIDTH);
        self.card_word(word).fetch_or(bit, Ordering::Relaxed);
        self.set_bundle_for_word(word);
    }

    #[inline]
    fn set_bundle_for_word(&self, card_word: usize) {
        let bundle_bit = card_word / CARD_WORDS_PER_BUNDLE_BIT;
        let word = bundle_bit / CARD_WORD_WIDTH;
        let bit = 1u32 << (bundle_bit % CARD_WORD_WIDTH);
        self.bundle_word(word).fetch_or(bit, Ordering::Relaxed);
    }

    /// Whether the card covering `addr` is set.
    #[inline]
    pub fn is_card_set(&self, addr: usize) -> bool {
        let card = self.card_of(addr);
        let word = card / CARD_WORD_WIDTH;
        let bit = 1u32 << (card % CARD_WORD_WIDTH);
        self.card_word(word).load(Ordering::Relaxed) & bit != 0
    }

    /// Clear the card covering `addr`.
    #[inline]
    pub fn clear_card(&self, addr: usize) {
        let card = self.card_of(addr);
        let word = card / CARD_WORD_WIDTH;
        let bit = 1u32 << (card % CARD_WORD_WIDTH);
        self.card_word(word).fetch_and(!bit, Ordering::Relaxed);
    }

    /// Clear every card covering `[lo, hi)`.
    pub fn clear_range(&self, lo: usize, hi: usize) {
        if hi <= lo {
            return;
        }
        let mut card = self.card_of(lo);
        let last = self.card_of(hi - 1);
        while card <= last {
            let word = card / CARD_WORD_WIDTH;
            let bit = card % CARD_WORD_WIDTH;
            // Clear to the end of the word in one shot where possible.
            let span = (CARD_WORD_WIDTH - bit).min(last - card + 1);
            let mask = if span == CARD_WORD_WIDTH {
                u32::MAX
            } else {
                ((1u32 << span) - 1) << bit
            };
            self.card_word(word).fetch_and(!mask, Ordering::Relaxed);
            card += span;
        }
    }

    /// Capture the cards covering `[lo, hi)`.
    ///
    /// Used by compaction: an old-to-young reference stays old-to-young
    /// after the covering plug moves, so the plug's cards are captured
    /// before the region's cards are cleared and re-established at the
    /// destination with [`restore_cards`](Self::restore_cards).
    pub fn snapshot_cards(&self, lo: usize, hi: usize) -> CardSnapshot {
        debug_assert!(hi > lo);
        let first = self.card_of(lo);
        let last = self.card_of(hi - 1);
        CardSnapshot {
            lo,
            first_card_base: self.card_address(first),
            bits: (first..=last)
                .map(|c| self.is_card_set(self.card_address(c)))
                .collect(),
        }
    }

    /// Re-establish a snapshot at `dst`, the new address of the
    /// captured range's first byte.
    pub fn restore_cards(&self, snapshot: &CardSnapshot, dst: usize) {
        for (i, &set) in snapshot.bits.iter().enumerate() {
            if set {
                let card_base = snapshot.first_card_base + i * CARD_SIZE;
                let off = card_base.max(snapshot.lo) - snapshot.lo;
                self.set_card(dst + off);
            }
        }
    }

    /// Find the next set card at or after `card`, up to `limit`
    /// (exclusive). Uses the bundle layer to skip clean spans.
    pub fn next_set_card(&self, mut card: usize, limit: usize) -> Option<usize> {
        while card < limit {
            let word = card / CARD_WORD_WIDTH;

            // Consult the bundle first; skip whole bundle spans that are clean.
            let bundle_bit = word / CARD_WORDS_PER_BUNDLE_BIT;
            let bundle_word = bundle_bit / CARD_WORD_WIDTH;
            let b = self.bundle_word(bundle_word).load(Ordering::Relaxed);
            if b & (1u32 << (bundle_bit % CARD_WORD_WIDTH)) == 0 {
                let next_word = (bundle_bit + 1) * CARD_WORDS_PER_BUNDLE_BIT;
                card = next_word * CARD_WORD_WIDTH;
                continue;
            }

            let w = self.card_word(word).load(Ordering::Relaxed);
            let bit = card % CARD_WORD_WIDTH;
            let masked = w & (u32::MAX << bit);
            if masked != 0 {
                let found = word * CARD_WORD_WIDTH + masked.trailing_zeros() as usize;
                if found < limit {
                    return Some(found);
                }
                return None;
            }
            card = (word + 1) * CARD_WORD_WIDTH;
        }
        None
    }

    /// Recompute bundle bits from the card words (after bulk clears).
    pub fn refresh_bundles(&self) {
        for bw in 0..self.n_bundle_words {
            let mut bits = 0u32;
            for b in 0..CARD_WORD_WIDTH {
                let bundle_bit = bw * CARD_WORD_WIDTH + b;
                let first = bundle_bit * CARD_WORDS_PER_BUNDLE_BIT;
                let last = (first + CARD_WORDS_PER_BUNDLE_BIT).min(self.n_card_words);
                let mut any = false;
                for w in first..last {
                    if self.card_word(w).load(Ordering::Relaxed) != 0 {
                        any = true;
                        break;
                    }
                }
                if any {
                    bits |= 1u32 << b;
                }
            }
            self.bundle_word(bw).store(bits, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        CardTable::new(0x1000_0000, 0x1100_0000).unwrap()
    }

    #[test]
    fn test_set_and_clear() {
        let ct = table();
        let addr = 0x1000_1234;
        assert!(!ct.is_card_set(addr));
        ct.set_card(addr);
        assert!(ct.is_card_set(addr));
        // Whole card is covered.
        assert!(ct.is_card_set(addr - addr % CARD_SIZE));
        ct.clear_card(addr);
        assert!(!ct.is_card_set(addr));
    }

    #[test]
    fn test_clear_range_spans_words() {
        let ct = table();
        let lo = 0x1000_0000;
        for i in 0..200 {
            ct.set_card(lo + i * CARD_SIZE);
        }
        ct.clear_range(lo + 10 * CARD_SIZE, lo + 150 * CARD_SIZE);
        for i in 0..200 {
            let expect = i < 10 || i >= 150;
            assert_eq!(ct.is_card_set(lo + i * CARD_SIZE), expect, "card {}", i);
        }
    }

    #[test]
    fn test_next_set_card_skips_clean_bundles() {
        let ct = table();
        let lo = 0x1000_0000;
        let far = lo + 4 * 1024 * 1024;
        ct.set_card(far);
        let limit = ct.card_of(0x1100_0000 - 1) + 1;
        assert_eq!(ct.next_set_card(0, limit), Some(ct.card_of(far)));
        assert_eq!(ct.next_set_card(ct.card_of(far) + 1, limit), None);
    }

    #[test]
    fn test_snapshot_restore_moves_coverage() {
        let ct = table();
        let src = 0x1000_0000 + 64 * CARD_SIZE;
        let dst = 0x1000_0000 + 512 * CARD_SIZE;
        ct.set_card(src + CARD_SIZE); // second card of the source run

        let snapshot = ct.snapshot_cards(src, src + 4 * CARD_SIZE);
        // Clearing the source (as compaction does) must not lose the
        // captured state.
        ct.clear_range(src, src + 4 * CARD_SIZE);
        ct.restore_cards(&snapshot, dst);

        assert!(ct.is_card_set(dst + CARD_SIZE));
        assert!(!ct.is_card_set(dst));
        assert!(!ct.is_card_set(src + CARD_SIZE));
    }

    #[test]
    fn test_snapshot_restore_unaligned_range() {
        let ct = table();
        // A plug that starts mid-card with a set card at its head.
        let src = 0x1000_0000 + 64 * CARD_SIZE + 64;
        let dst = 0x1000_0000 + 512 * CARD_SIZE + 8;
        ct.set_card(src);

        let snapshot = ct.snapshot_cards(src, src + 200);
        ct.clear_range(src, src + 200);
        ct.restore_cards(&snapshot, dst);

        // The head of the moved range is covered again.
        assert!(ct.is_card_set(dst));
    }
}
