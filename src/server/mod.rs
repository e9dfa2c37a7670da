//! Parallel Server Configuration
//!
//! One collector thread per heap, woken by a start event and
//! rendezvousing through [`GcJoin`] barriers. During mark, each thread
//! drains its own heap's stack and steals from the others; the card
//! scan is split into chunks claimed from a shared cursor
//! (card-marking stealing). Heap balancing reassigns a mutator to a
//! less-loaded heap when its allocating heap's budget runs far behind.

use crate::alloc::AllocContext;
use crate::collect::mark::{scan_region_cards, MarkContext, Marker};
use crate::error::{GcError, Result};
use crate::heap::{Heap, HeapRegion, SharedHeap, MAX_SOH_GENERATION};
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam_deque::Worker;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A named cross-GC-thread barrier electing one "first" participant.
///
/// All participants block in [`GcJoin::join`]; the last arriver is
/// elected and returns [`JoinOutcome::First`] to perform serial work,
/// then calls [`GcJoin::restart`] to release the rest. A join is a full
/// memory barrier between phases.
pub struct GcJoin {
    n: usize,
    state: Mutex<JoinState>,
    cv: Condvar,
}

struct JoinState {
    arrived: usize,
    generation: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// This participant performs the serial work, then calls `restart`.
    First,
    /// Serial work done by another participant; proceed.
    Joined,
}

impl GcJoin {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            state: Mutex::new(JoinState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn join(&self) -> JoinOutcome {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived == self.n {
            return JoinOutcome::First;
        }
        let generation = state.generation;
        while state.generation == generation {
            self.cv.wait(&mut state);
        }
        JoinOutcome::Joined
    }

    /// Release the joined participants. Only the elected first calls
    /// this.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.arrived = 0;
        state.generation += 1;
        self.cv.notify_all();
    }
}

/// Card-scan work split into per-region chunks claimed by an atomic
/// cursor. SOH regions come first; completion of each class is flagged.
pub struct CardWork {
    regions: Vec<Arc<HeapRegion>>,
    soh_count: usize,
    cursor: AtomicUsize,
    pub card_mark_done_soh: AtomicBool,
    pub card_mark_done_uoh: AtomicBool,
}

impl CardWork {
    /// Build the chunk list from the non-condemned regions.
    pub fn new(shared: &SharedHeap, marker: &Marker) -> Self {
        let mut soh: Vec<Arc<HeapRegion>> = Vec::new();
        let mut uoh: Vec<Arc<HeapRegion>> = Vec::new();
        for region in shared.region_map.all_regions() {
            if marker.is_condemned_gen(region.generation()) {
                continue;
            }
            if region.generation() <= MAX_SOH_GENERATION {
                soh.push(region);
            } else {
                uoh.push(region);
            }
        }
        let soh_count = soh.len();
        soh.extend(uoh);
        Self {
            regions: soh,
            soh_count,
            cursor: AtomicUsize::new(0),
            card_mark_done_soh: AtomicBool::new(false),
            card_mark_done_uoh: AtomicBool::new(false),
        }
    }

    /// Empty work list (full collections scan no cards).
    pub fn empty() -> Self {
        Self {
            regions: Vec::new(),
            soh_count: 0,
            cursor: AtomicUsize::new(0),
            card_mark_done_soh: AtomicBool::new(true),
            card_mark_done_uoh: AtomicBool::new(true),
        }
    }

    /// Claim the next chunk; promotes every card-covered reference into
    /// the claimer's mark context.
    pub fn scan_chunks(&self, shared: &SharedHeap, ctx: &mut MarkContext<'_>) {
        loop {
            let idx = self.cursor.fetch_add(1, Ordering::AcqRel);
            if idx >= self.regions.len() {
                self.card_mark_done_soh.store(true, Ordering::Release);
                self.card_mark_done_uoh.store(true, Ordering::Release);
                return;
            }
            if idx >= self.soh_count {
                self.card_mark_done_soh.store(true, Ordering::Release);
            }
            let region = &self.regions[idx];
            scan_region_cards(shared, region, &mut |card_ref| {
                ctx.promote(card_ref.target);
                // The keep/clear decision belongs to relocate.
                true
            });
        }
    }
}

struct MarkJob {
    marker: Arc<Marker>,
    worker: Worker<usize>,
    cards: Arc<CardWork>,
}

/// The server runtime: per-heap collector threads plus the barriers
/// and balancing machinery.
pub struct ServerRuntime {
    shared: Arc<SharedHeap>,
    job_txs: Vec<Sender<MarkJob>>,
    mark_join: Arc<GcJoin>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl ServerRuntime {
    /// Spawn `n_heaps - 1` helper threads (the triggering thread acts
    /// as heap 0's collector).
    pub fn new(shared: Arc<SharedHeap>, n_heaps: usize) -> Result<Self> {
        let mark_join = Arc::new(GcJoin::new(n_heaps));
        let mut job_txs = Vec::new();
        let mut threads = Vec::new();

        for heap_number in 1..n_heaps {
            let (tx, rx): (Sender<MarkJob>, Receiver<MarkJob>) = bounded(1);
            let join = mark_join.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("gc-heap-{}", heap_number))
                .spawn(move || {
                    // The start event: a job arriving on the channel.
                    while let Ok(job) = rx.recv() {
                        let mut ctx = MarkContext::new(&job.marker, &shared, job.worker);
                        job.cards.scan_chunks(&shared, &mut ctx);
                        ctx.drain();
                        if join.join() == JoinOutcome::First {
                            join.restart();
                        }
                    }
                })
                .map_err(|e| {
                    GcError::Internal(format!("failed to spawn GC thread: {}", e))
                })?;
            job_txs.push(tx);
            threads.push(handle);
        }

        Ok(Self {
            shared,
            job_txs,
            mark_join,
            threads,
        })
    }

    /// Fan the mark drain out to the helper threads and participate
    /// with the caller's own context. Returns when every stack is
    /// empty and all participants passed the completion barrier.
    pub fn parallel_mark(
        &self,
        marker: &Arc<Marker>,
        helper_workers: Vec<Worker<usize>>,
        cards: Arc<CardWork>,
        ctx: &mut MarkContext<'_>,
    ) {
        for (tx, worker) in self.job_txs.iter().zip(helper_workers) {
            // Helpers are idle between collections; the send wakes them.
            let _ = tx.send(MarkJob {
                marker: marker.clone(),
                worker,
                cards: cards.clone(),
            });
        }
        cards.scan_chunks(&self.shared, ctx);
        ctx.drain();
        if self.mark_join.join() == JoinOutcome::First {
            self.mark_join.restart();
        }
    }

    /// Shut the helper threads down.
    pub fn shutdown(&mut self) {
        self.job_txs.clear();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reassign a mutator to a less-loaded heap when its allocating heap's
/// remaining gen0 budget has fallen to less than half the best heap's.
/// Ties are broken randomly so mutators spread out.
pub fn balance_heaps(heaps: &[Arc<Heap>], ctx: &mut AllocContext) {
    if heaps.len() < 2 {
        return;
    }
    let current = ctx.alloc_heap.min(heaps.len() - 1);
    let current_budget = heaps[current].gen0_budget_remaining();

    let best = heaps
        .iter()
        .map(|h| h.gen0_budget_remaining())
        .max()
        .unwrap_or(0);
    if best <= 0 || current_budget >= best / 2 {
        return;
    }

    let candidates: Vec<usize> = heaps
        .iter()
        .enumerate()
        .filter(|(_, h)| h.gen0_budget_remaining() * 2 >= best)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return;
    }
    let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
    if pick != current {
        log::trace!(
            "balancing mutator from heap {} to heap {} (budget {} vs {})",
            current,
            pick,
            current_budget,
            heaps[pick].gen0_budget_remaining()
        );
        ctx.alloc_heap = pick;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    #[test]
    fn test_join_elects_exactly_one_first() {
        let join = Arc::new(GcJoin::new(4));
        let firsts = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let join = join.clone();
            let firsts = firsts.clone();
            handles.push(std::thread::spawn(move || {
                if join.join() == JoinOutcome::First {
                    firsts.fetch_add(1, Ordering::SeqCst);
                    join.restart();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(firsts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_reusable_across_phases() {
        let join = Arc::new(GcJoin::new(2));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let join = join.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..3 {
                    if join.join() == JoinOutcome::First {
                        join.restart();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_balance_moves_starved_mutator() {
        let config = GcConfig::default();
        let heaps: Vec<Arc<Heap>> = (0..2).map(|i| Arc::new(Heap::new(i, &config))).collect();
        // Starve heap 0's gen0 budget.
        heaps[0].core.lock().generations[0].dd.new_allocation = 0;

        let mut ctx = AllocContext {
            alloc_heap: 0,
            home_heap: 0,
            ..Default::default()
        };
        balance_heaps(&heaps, &mut ctx);
        assert_eq!(ctx.alloc_heap, 1);
    }
}
