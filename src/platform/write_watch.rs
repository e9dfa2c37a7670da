//! Software Write Watch
//!
//! Tracks pages dirtied by mutator reference stores while background
//! collection is marking. The write barrier sets a byte per page; the
//! background collector drains and resets the table between revisit
//! passes.
//!
//! The table is software-maintained (the barrier performs the store)
//! rather than relying on OS page-write-watch, so it behaves identically
//! on every platform.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Byte-per-page dirty table over a fixed address range.
pub struct WriteWatch {
    /// First address covered
    base: usize,
    /// Bytes covered per table entry
    page: usize,
    /// One dirty byte per page
    table: Vec<AtomicU8>,
    /// Whether the barrier should record writes at all
    active: AtomicBool,
}

impl WriteWatch {
    /// Create a table covering `[base, base + size)`.
    pub fn new(base: usize, size: usize) -> Self {
        let page = page_size::get();
        let entries = (size + page - 1) / page;
        let mut table = Vec::with_capacity(entries);
        table.resize_with(entries, || AtomicU8::new(0));
        Self {
            base,
            page,
            table,
            active: AtomicBool::new(false),
        }
    }

    /// Whether writes are currently being recorded.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Start recording dirty pages. Clears any stale state.
    pub fn activate(&self) {
        for e in &self.table {
            e.store(0, Ordering::Relaxed);
        }
        self.active.store(true, Ordering::Release);
    }

    /// Stop recording dirty pages.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Record a write to `addr`. Called from the write barrier.
    #[inline]
    pub fn record(&self, addr: usize) {
        if addr < self.base {
            return;
        }
        let idx = (addr - self.base) / self.page;
        if let Some(e) = self.table.get(idx) {
            // Plain store; the revisit pass tolerates over-reporting.
            e.store(1, Ordering::Relaxed);
        }
    }

    /// Collect and reset dirty pages intersecting `[lo, hi)`.
    ///
    /// Returns the page base addresses that were dirty.
    pub fn drain(&self, lo: usize, hi: usize) -> Vec<usize> {
        let mut dirty = Vec::new();
        if hi <= self.base {
            return dirty;
        }
        let start = lo.saturating_sub(self.base) / self.page;
        let end = ((hi - self.base) + self.page - 1) / self.page;
        for idx in start..end.min(self.table.len()) {
            if self.table[idx].swap(0, Ordering::AcqRel) != 0 {
                dirty.push(self.base + idx * self.page);
            }
        }
        dirty
    }

    /// Bytes covered per dirty byte.
    pub fn page_size(&self) -> usize {
        self.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_drain() {
        let base = 0x1000_0000;
        let ww = WriteWatch::new(base, 1 << 20);
        ww.activate();
        assert!(ww.is_active());

        let page = ww.page_size();
        ww.record(base + 10);
        ww.record(base + page + 1);
        ww.record(base + page + 2); // same page, still one entry

        let dirty = ww.drain(base, base + (1 << 20));
        assert_eq!(dirty, vec![base, base + page]);

        // Drained pages are reset.
        assert!(ww.drain(base, base + (1 << 20)).is_empty());
    }

    #[test]
    fn test_drain_subrange() {
        let base = 0x2000_0000;
        let ww = WriteWatch::new(base, 1 << 20);
        ww.activate();
        let page = ww.page_size();
        ww.record(base);
        ww.record(base + 4 * page);

        let dirty = ww.drain(base + page, base + 2 * page);
        assert!(dirty.is_empty());
        let dirty = ww.drain(base, base + 8 * page);
        assert_eq!(dirty.len(), 2);
    }
}
