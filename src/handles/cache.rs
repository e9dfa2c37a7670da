//! Handle Cache - Per-Type Cache Banks
//!
//! Two banks per type: the *reserve* bank feeds allocation, the *free*
//! bank absorbs destruction, plus a one-slot *quick* cache. The fast
//! paths are lock-free; the table lock is taken only to rebalance when
//! a bank underflows or overflows.
//!
//! A bank slot may transiently read as null while another thread is
//! mid-transfer; takers spin briefly on the claimed slot, mirroring the
//! original bank protocol.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Handles per cache bank.
pub const HANDLES_PER_CACHE_BANK: usize = 64;

/// Low water mark: rebalance refills from the segments below this.
pub const REBALANCE_LOWATER: usize = 16;

/// High water mark: rebalance spills to the segments above this.
pub const REBALANCE_HIWATER: usize = HANDLES_PER_CACHE_BANK + REBALANCE_LOWATER;

/// Cache banks for one handle type.
pub struct HandleCache {
    /// One-slot quick cache.
    quick: AtomicUsize,

    /// Bank consumed by allocation.
    reserve: [AtomicUsize; HANDLES_PER_CACHE_BANK],

    /// Count of handles available in the reserve bank.
    reserve_index: AtomicIsize,

    /// Bank filled by destruction.
    free: [AtomicUsize; HANDLES_PER_CACHE_BANK],

    /// Count of handles parked in the free bank.
    free_index: AtomicIsize,
}

impl HandleCache {
    pub fn new() -> Self {
        Self {
            quick: AtomicUsize::new(0),
            reserve: [(); HANDLES_PER_CACHE_BANK].map(|_| AtomicUsize::new(0)),
            reserve_index: AtomicIsize::new(0),
            free: [(); HANDLES_PER_CACHE_BANK].map(|_| AtomicUsize::new(0)),
            free_index: AtomicIsize::new(0),
        }
    }

    /// Allocation fast path. `None` means the caller must rebalance
    /// under the table lock and retry.
    pub fn try_alloc(&self) -> Option<usize> {
        // 1. Quick cache.
        let h = self.quick.swap(0, Ordering::AcqRel);
        if h != 0 {
            return Some(h);
        }

        // 2. Reserve bank.
        let idx = self.reserve_index.fetch_sub(1, Ordering::AcqRel) - 1;
        if idx >= 0 {
            let slot = &self.reserve[idx as usize];
            loop {
                let h = slot.swap(0, Ordering::AcqRel);
                if h != 0 {
                    return Some(h);
                }
                // A rebalance is still writing this slot.
                std::hint::spin_loop();
            }
        }
        // Underflow: restore and miss.
        self.reserve_index.fetch_add(1, Ordering::AcqRel);
        None
    }

    /// Destruction fast path. Returns the handle back when the caller
    /// must rebalance under the table lock and retry.
    pub fn try_free(&self, handle: usize) -> Result<(), usize> {
        // 1. Quick cache.
        if self
            .quick
            .compare_exchange(0, handle, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }

        // 2. Free bank.
        let idx = self.free_index.fetch_add(1, Ordering::AcqRel);
        if (idx as usize) < HANDLES_PER_CACHE_BANK {
            let slot = &self.free[idx as usize];
            loop {
                if slot
                    .compare_exchange(0, handle, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                // A rebalance is still draining this slot.
                std::hint::spin_loop();
            }
        }
        // Overflow: restore and miss.
        self.free_index.fetch_sub(1, Ordering::AcqRel);
        Err(handle)
    }

    /// Drain every cached handle (both banks and the quick slot).
    /// Runs under the table lock.
    pub fn drain(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let h = self.quick.swap(0, Ordering::AcqRel);
        if h != 0 {
            out.push(h);
        }
        // Zero the counts first so fast paths miss into the lock.
        self.reserve_index.store(0, Ordering::Release);
        self.free_index.store(0, Ordering::Release);
        for slot in self.reserve.iter().chain(self.free.iter()) {
            let h = slot.swap(0, Ordering::AcqRel);
            if h != 0 {
                out.push(h);
            }
        }
        out
    }

    /// Refill the banks with `handles`: the reserve bank first, any
    /// remainder parked in the free bank. Runs under the table lock
    /// after a drain.
    pub fn fill_banks(&self, handles: &[usize]) {
        debug_assert!(handles.len() <= 2 * HANDLES_PER_CACHE_BANK);
        let reserve_n = handles.len().min(HANDLES_PER_CACHE_BANK);
        for (slot, &h) in self.reserve.iter().zip(&handles[..reserve_n]) {
            slot.store(h, Ordering::Release);
        }
        self.reserve_index.store(reserve_n as isize, Ordering::Release);

        let rest = &handles[reserve_n..];
        for (slot, &h) in self.free.iter().zip(rest) {
            slot.store(h, Ordering::Release);
        }
        self.free_index.store(rest.len() as isize, Ordering::Release);
    }

    /// Cached handle count (approximate outside the table lock).
    pub fn cached_count(&self) -> usize {
        let r = self.reserve_index.load(Ordering::Relaxed).max(0) as usize;
        let f = self.free_index.load(Ordering::Relaxed).max(0) as usize;
        let q = (self.quick.load(Ordering::Relaxed) != 0) as usize;
        r + f + q
    }
}

impl Default for HandleCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_cache_roundtrip() {
        let c = HandleCache::new();
        assert!(c.try_alloc().is_none());
        c.try_free(0x1000).unwrap();
        assert_eq!(c.try_alloc(), Some(0x1000));
        assert!(c.try_alloc().is_none());
    }

    #[test]
    fn test_reserve_bank_lifo_consumption() {
        let c = HandleCache::new();
        c.fill_banks(&[0x10, 0x20, 0x30]);
        assert_eq!(c.try_alloc(), Some(0x30));
        assert_eq!(c.try_alloc(), Some(0x20));
        assert_eq!(c.try_alloc(), Some(0x10));
        assert!(c.try_alloc().is_none());
    }

    #[test]
    fn test_free_bank_overflow_reports_miss() {
        let c = HandleCache::new();
        // Quick slot takes the first one.
        c.try_free(1).unwrap();
        for i in 0..HANDLES_PER_CACHE_BANK {
            c.try_free(0x100 + i).unwrap();
        }
        let err = c.try_free(0xDEAD).unwrap_err();
        assert_eq!(err, 0xDEAD);
    }

    #[test]
    fn test_drain_collects_everything() {
        let c = HandleCache::new();
        c.fill_banks(&[0x10, 0x20]);
        c.try_free(0x30).unwrap(); // quick
        c.try_free(0x40).unwrap(); // free bank
        let mut drained = c.drain();
        drained.sort();
        assert_eq!(drained, vec![0x10, 0x20, 0x30, 0x40]);
        assert_eq!(c.cached_count(), 0);
    }
}
