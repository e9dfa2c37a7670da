//! GC Event Log
//!
//! A bounded in-memory ring of recent GC events for post-mortem
//! inspection, alongside the `log` facade used for live output.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Events kept in the ring.
const EVENT_RING_LEN: usize = 128;

/// GC event types.
#[derive(Debug, Clone)]
pub enum GcEvent {
    /// A blocking collection started.
    CycleStart {
        number: u64,
        generation: usize,
        reason: String,
    },

    /// A blocking collection completed.
    CycleEnd {
        number: u64,
        generation: usize,
        duration_us: u64,
        compacting: bool,
    },

    /// A background collection changed state.
    BackgroundState { state: String },

    /// An allocation failed.
    AllocationFailure { size: usize, oh: String },

    /// A no-GC region started or ended.
    NoGcRegion { active: bool, budget: usize },
}

/// One timestamped entry.
#[derive(Debug, Clone)]
pub struct GcEventRecord {
    pub at: DateTime<Utc>,
    pub event: GcEvent,
}

/// The bounded event ring.
pub struct EventLog {
    ring: Mutex<VecDeque<GcEventRecord>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_LEN)),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn record(&self, event: GcEvent) {
        let mut ring = self.ring.lock();
        if ring.len() == EVENT_RING_LEN {
            ring.pop_front();
        }
        ring.push_back(GcEventRecord {
            at: Utc::now(),
            event,
        });
    }

    /// Snapshot of the ring, oldest first.
    pub fn recent(&self) -> Vec<GcEventRecord> {
        self.ring.lock().iter().cloned().collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let log = EventLog::new();
        for i in 0..200 {
            log.record(GcEvent::AllocationFailure {
                size: i,
                oh: "SOH".to_string(),
            });
        }
        let recent = log.recent();
        assert_eq!(recent.len(), EVENT_RING_LEN);
        match &recent.last().unwrap().event {
            GcEvent::AllocationFailure { size, .. } => assert_eq!(*size, 199),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
