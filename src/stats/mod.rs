//! GC Statistics
//!
//! Collection counters, a pause-time histogram, and the allocation
//! failure history (`fgm_history`) surfaced alongside OOM outcomes.

use crate::error::ObjectHeap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Pause histogram bucket upper bounds, in microseconds.
const PAUSE_BUCKETS_US: [u64; 6] = [100, 1_000, 10_000, 100_000, 1_000_000, u64::MAX];

/// One recorded allocation failure.
#[derive(Debug, Clone, Serialize)]
pub struct FgmRecord {
    /// Requested size in bytes.
    pub size: usize,
    /// Object heap charged with the failure.
    pub oh: String,
    /// Available physical memory at the time.
    pub available: usize,
    /// Wall-clock time of the failure.
    pub at: DateTime<Utc>,
}

/// How many allocation failures are remembered.
const FGM_HISTORY_LEN: usize = 8;

/// Serializable snapshot of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub collections: [u64; 3],
    pub compacting_collections: u64,
    pub background_collections: u64,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
    pub pause_histogram_us: Vec<(u64, u64)>,
    pub fgm_history: Vec<FgmRecord>,
}

/// Collector-wide statistics.
pub struct GcStats {
    /// Blocking collections per condemned generation.
    collections: [AtomicU64; 3],
    compacting_collections: AtomicU64,
    background_collections: AtomicU64,
    total_pause_us: AtomicU64,
    max_pause_us: AtomicU64,
    pause_histogram: [AtomicU64; PAUSE_BUCKETS_US.len()],
    fgm_history: Mutex<VecDeque<FgmRecord>>,
}

impl GcStats {
    pub fn new() -> Self {
        Self {
            collections: Default::default(),
            compacting_collections: AtomicU64::new(0),
            background_collections: AtomicU64::new(0),
            total_pause_us: AtomicU64::new(0),
            max_pause_us: AtomicU64::new(0),
            pause_histogram: Default::default(),
            fgm_history: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one blocking collection.
    pub fn record_collection(&self, condemned: usize, compacting: bool, pause: Duration) {
        self.collections[condemned.min(2)].fetch_add(1, Ordering::Relaxed);
        if compacting {
            self.compacting_collections.fetch_add(1, Ordering::Relaxed);
        }
        let us = pause.as_micros() as u64;
        self.total_pause_us.fetch_add(us, Ordering::Relaxed);
        self.max_pause_us.fetch_max(us, Ordering::Relaxed);
        let bucket = PAUSE_BUCKETS_US.iter().position(|&b| us <= b).unwrap_or(0);
        self.pause_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed background collection.
    pub fn record_background(&self) {
        self.background_collections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allocation failure for the fgm history.
    pub fn record_alloc_failure(&self, size: usize, oh: ObjectHeap, available: usize) {
        let mut history = self.fgm_history.lock();
        if history.len() == FGM_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(FgmRecord {
            size,
            oh: oh.to_string(),
            available,
            at: Utc::now(),
        });
    }

    /// Collections that condemned `gen`.
    pub fn collection_count(&self, gen: usize) -> u64 {
        self.collections[gen.min(2)].load(Ordering::Relaxed)
    }

    /// Completed background collections.
    pub fn background_count(&self) -> u64 {
        self.background_collections.load(Ordering::Relaxed)
    }

    /// Recent allocation failures, oldest first.
    pub fn fgm_history(&self) -> Vec<FgmRecord> {
        self.fgm_history.lock().iter().cloned().collect()
    }

    /// Serializable snapshot of everything.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            collections: [
                self.collections[0].load(Ordering::Relaxed),
                self.collections[1].load(Ordering::Relaxed),
                self.collections[2].load(Ordering::Relaxed),
            ],
            compacting_collections: self.compacting_collections.load(Ordering::Relaxed),
            background_collections: self.background_collections.load(Ordering::Relaxed),
            total_pause_us: self.total_pause_us.load(Ordering::Relaxed),
            max_pause_us: self.max_pause_us.load(Ordering::Relaxed),
            pause_histogram_us: PAUSE_BUCKETS_US
                .iter()
                .zip(&self.pause_histogram)
                .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
                .collect(),
            fgm_history: self.fgm_history(),
        }
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = GcStats::new();
        stats.record_collection(0, false, Duration::from_micros(50));
        stats.record_collection(0, true, Duration::from_millis(5));
        stats.record_collection(2, true, Duration::from_millis(50));

        assert_eq!(stats.collection_count(0), 2);
        assert_eq!(stats.collection_count(2), 1);

        let snap = stats.snapshot();
        assert_eq!(snap.compacting_collections, 2);
        assert_eq!(snap.max_pause_us, 50_000);
        // 50us lands in the first bucket.
        assert_eq!(snap.pause_histogram_us[0].1, 1);
        // The snapshot serializes.
        assert!(serde_json::to_string(&snap).is_ok());
    }

    #[test]
    fn test_fgm_history_bounded() {
        let stats = GcStats::new();
        for i in 0..20 {
            stats.record_alloc_failure(i, ObjectHeap::Loh, 1 << 30);
        }
        let history = stats.fgm_history();
        assert_eq!(history.len(), FGM_HISTORY_LEN);
        assert_eq!(history.last().unwrap().size, 19);
        assert_eq!(history[0].size, 12);
    }
}
