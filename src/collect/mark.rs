//! Mark Phase
//!
//! Traces the condemned generations from roots, the remembered set
//! (card scan) and the handle table. Work is pushed onto per-heap
//! work-stealing stacks; an idle heap steals from busy ones. When a
//! stack refuses to grow past its limit, the overflowed address bounds
//! are recorded and a secondary heap sweep re-marks out-references of
//! already-marked objects within those bounds.
//!
//! Handle processing order, which the reachable-through-finalizers
//! protocol depends on:
//!
//! 1. strong handles (plus pinning, plus nonzero ref-counted)
//! 2. dependent-handle fixpoint
//! 3. weak-short clearing (ref-counted with zero count, dependents of
//!    dead primaries)
//! 4. finalizer promotion
//! 5. dependent-handle fixpoint again (finalizer pass may have marked
//!    new primaries)
//! 6. weak-long clearing

use crate::handles::table::HandleType;
use crate::heap::{HeapRegion, SharedHeap, MAX_SOH_GENERATION};
use crate::object;
use crate::util::constants::CARD_SIZE;
use crossbeam_deque::{Stealer, Worker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Soft cap on a mark stack before the overflow protocol kicks in.
pub const MARK_STACK_LIMIT: usize = 128 * 1024;

/// Shared mark state for one collection.
pub struct Marker {
    /// Highest condemned generation.
    pub condemned: usize,
    /// LOH/POH are in the condemned set (full GC).
    pub condemn_uoh: bool,

    /// Stealers into every heap's stack.
    stealers: Vec<Stealer<usize>>,

    /// Promoted bytes, aggregated across heaps.
    promoted_bytes: AtomicUsize,

    /// Workers currently scanning an object (termination detection for
    /// the parallel drain).
    in_flight: AtomicUsize,

    /// Mark-stack overflow bounds (usize::MAX/0 when no overflow).
    overflow_min: AtomicUsize,
    overflow_max: AtomicUsize,

    /// Objects pinned by handles during this collection.
    pinned: parking_lot::Mutex<Vec<usize>>,

    /// Sizes reported by size-ref handles, for the tuner.
    size_refs: parking_lot::Mutex<Vec<usize>>,
}

/// Per-worker marking handle: the worker's own deque plus the shared
/// state.
pub struct MarkContext<'a> {
    pub marker: &'a Marker,
    pub shared: &'a SharedHeap,
    worker: Worker<usize>,
    depth: usize,
}

impl Marker {
    pub fn new(condemned: usize, condemn_uoh: bool, n_heaps: usize) -> (Self, Vec<Worker<usize>>) {
        let workers: Vec<Worker<usize>> = (0..n_heaps).map(|_| Worker::new_lifo()).collect();
        let stealers = workers.iter().map(|w| w.stealer()).collect();
        (
            Self {
                condemned,
                condemn_uoh,
                stealers,
                promoted_bytes: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                overflow_min: AtomicUsize::new(usize::MAX),
                overflow_max: AtomicUsize::new(0),
                pinned: parking_lot::Mutex::new(Vec::new()),
                size_refs: parking_lot::Mutex::new(Vec::new()),
            },
            workers,
        )
    }

    /// Whether `gen` is condemned by this collection.
    #[inline]
    pub fn is_condemned_gen(&self, gen: usize) -> bool {
        gen <= self.condemned || (self.condemn_uoh && gen > MAX_SOH_GENERATION)
    }

    /// Whether `obj` lies in a condemned region.
    #[inline]
    pub fn in_condemned(&self, shared: &SharedHeap, obj: usize) -> bool {
        shared
            .region_map
            .region_of(obj)
            .map(|r| self.is_condemned_gen(r.generation()))
            .unwrap_or(false)
    }

    /// Total promoted bytes so far.
    pub fn promoted_bytes(&self) -> usize {
        self.promoted_bytes.load(Ordering::Relaxed)
    }

    /// Objects pinned by handles during this collection.
    pub fn take_pinned(&self) -> Vec<usize> {
        std::mem::take(&mut *self.pinned.lock())
    }

    /// Sizes reported by size-ref handles.
    pub fn take_size_refs(&self) -> Vec<usize> {
        std::mem::take(&mut *self.size_refs.lock())
    }

    fn record_overflow(&self, obj: usize) {
        self.overflow_min.fetch_min(obj, Ordering::Relaxed);
        self.overflow_max
            .fetch_max(obj + 1, Ordering::Relaxed);
    }

    fn take_overflow(&self) -> Option<(usize, usize)> {
        let min = self.overflow_min.swap(usize::MAX, Ordering::Relaxed);
        let max = self.overflow_max.swap(0, Ordering::Relaxed);
        (min < max).then_some((min, max))
    }
}

impl<'a> MarkContext<'a> {
    pub fn new(marker: &'a Marker, shared: &'a SharedHeap, worker: Worker<usize>) -> Self {
        Self {
            marker,
            shared,
            worker,
            depth: 0,
        }
    }

    /// Mark `obj` if it lies in the condemned set; push it for scanning.
    pub fn promote(&mut self, obj: usize) {
        if obj == 0 || !self.marker.in_condemned(self.shared, obj) {
            return;
        }
        unsafe {
            if object::set_marked(obj) {
                return; // already marked
            }
            let size = object::object_size(obj);
            self.marker
                .promoted_bytes
                .fetch_add(size, Ordering::Relaxed);
            if !object::method_table(obj).has_references() {
                return; // leaf object: no scan needed
            }
        }
        if self.depth >= MARK_STACK_LIMIT {
            self.marker.record_overflow(obj);
        } else {
            self.depth += 1;
            self.worker.push(obj);
        }
    }

    /// Pin and promote the target of a pinning handle.
    pub fn promote_pinned(&mut self, obj: usize) {
        if obj == 0 {
            return;
        }
        if self.shared.region_map.region_of(obj).is_some() {
            unsafe {
                object::object_header(obj).set_pinned();
            }
            self.marker.pinned.lock().push(obj);
            if let Some(region) = self.shared.region_map.region_of(obj) {
                region.set_flag(crate::heap::region::flags::HAS_PINNED);
            }
        }
        self.promote(obj);
    }

    /// Drain this worker's stack, stealing from siblings when empty.
    /// Returns once every stack is empty and no participant is mid-scan
    /// (a scan in flight may still push new work).
    pub fn drain(&mut self) {
        loop {
            while let Some(obj) = self.worker.pop() {
                self.depth = self.depth.saturating_sub(1);
                self.marker.in_flight.fetch_add(1, Ordering::AcqRel);
                self.scan_object(obj);
                self.marker.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            if self.steal_some() {
                continue;
            }
            // Handle overflow before concluding.
            if let Some((lo, hi)) = self.marker.take_overflow() {
                self.overflow_sweep(lo, hi);
                continue;
            }
            if self.marker.in_flight.load(Ordering::Acquire) != 0 {
                std::hint::spin_loop();
                continue;
            }
            // Everything was empty before and no scan was in flight;
            // one more steal attempt confirms nothing appeared since.
            if self.steal_some() {
                continue;
            }
            return;
        }
    }

    fn steal_some(&mut self) -> bool {
        for stealer in &self.marker.stealers {
            loop {
                match stealer.steal_batch(&self.worker) {
                    crossbeam_deque::Steal::Success(()) => return true,
                    crossbeam_deque::Steal::Retry => continue,
                    crossbeam_deque::Steal::Empty => break,
                }
            }
        }
        false
    }

    fn scan_object(&mut self, obj: usize) {
        unsafe {
            object::for_each_ref(obj, |slot| {
                let target = std::ptr::read(slot as *const usize);
                self.promote(target);
            });
        }
    }

    /// Secondary sweep after a mark-stack overflow: within `[lo, hi)`,
    /// re-scan the out-references of every already-marked object.
    fn overflow_sweep(&mut self, lo: usize, hi: usize) {
        log::debug!("mark stack overflow sweep [{:#x}, {:#x})", lo, hi);
        for region in self.shared.region_map.all_regions() {
            if region.allocated() <= lo || region.mem() >= hi {
                continue;
            }
            if !self.marker.is_condemned_gen(region.generation()) {
                continue;
            }
            unsafe {
                region.walk_objects(|obj| {
                    if object::is_marked(obj) && object::method_table(obj).has_references() {
                        self.scan_object(obj);
                    }
                });
            }
        }
    }
}

/// Outcome of a card visit for one reference slot.
pub struct CardRef {
    /// Address of the reference slot.
    pub slot: usize,
    /// The referent at scan time.
    pub target: usize,
}

/// Scan the set cards of every non-condemned region, invoking `visit`
/// for each reference slot whose card is set. `visit` returns true when
/// the slot will still hold an old-to-young reference after this
/// collection; cards with no such slot are cleared.
///
/// Over-approximation note: the barrier may have set cards for
/// same-generation stores; those are exactly the cards this pass
/// retires.
pub fn scan_cards(
    shared: &SharedHeap,
    marker: &Marker,
    mut visit: impl FnMut(CardRef) -> bool,
) {
    for region in shared.region_map.all_regions() {
        if marker.is_condemned_gen(region.generation()) {
            continue;
        }
        scan_region_cards(shared, &region, &mut visit);
    }
}

/// Card walk of a single region (also used by the stealing scan in the
/// server configuration).
pub fn scan_region_cards(
    shared: &SharedHeap,
    region: &Arc<HeapRegion>,
    visit: &mut impl FnMut(CardRef) -> bool,
) {
    let cards = &shared.cards;
    let lo = region.mem();
    let hi = region.allocated();
    if hi <= lo {
        return;
    }
    let mut card = cards.card_of(lo);
    let limit = cards.card_of(hi - 1) + 1;

    while let Some(set_card) = cards.next_set_card(card, limit) {
        let card_lo = cards.card_address(set_card).max(lo);
        let card_hi = (cards.card_address(set_card) + CARD_SIZE).min(hi);

        let mut keep = false;
        // Find the first object overlapping the card via the bricks,
        // then walk objects until past the card.
        let first = unsafe { shared.bricks.object_start(card_lo, lo, hi) };
        if let Some(first_obj) = first {
            let mut obj = first_obj;
            while object::plug_start(obj) < card_hi {
                unsafe {
                    if !object::is_free_object(obj) {
                        object::for_each_ref(obj, |slot| {
                            if slot >= card_lo && slot < card_hi {
                                let target = std::ptr::read(slot as *const usize);
                                if target != 0 {
                                    if visit(CardRef { slot, target }) {
                                        keep = true;
                                    }
                                }
                            }
                        });
                    }
                    let next = obj + object::object_size(obj);
                    if next >= object::obj_at(hi) {
                        break;
                    }
                    obj = next;
                }
            }
        }
        if !keep {
            cards.clear_card(card_lo);
        }
        card = set_card + 1;
    }
}

/// Run the strong-handle root pass for one table set.
pub fn mark_handle_roots(
    ctx: &mut MarkContext<'_>,
    tables: &[Arc<crate::handles::HandleTable>],
) {
    let condemned = ctx.marker.condemned;
    for table in tables {
        table.scan(
            &[HandleType::Strong, HandleType::SizeRef],
            Some(condemned),
            &mut |slot| {
                if slot.ty == HandleType::SizeRef {
                    ctx.marker.size_refs.lock().push(slot.extra());
                }
                ctx.promote(slot.value());
            },
        );
        table.scan(
            &[HandleType::Pinned, HandleType::AsyncPinned],
            Some(condemned),
            &mut |slot| {
                ctx.promote_pinned(slot.value());
            },
        );
        table.scan(&[HandleType::RefCounted], Some(condemned), &mut |slot| {
            if slot.extra() > 0 {
                ctx.promote(slot.value());
            }
        });
    }
    ctx.drain();
}

/// Iterate the dependent-handle pass to fixpoint: promote secondaries
/// whose primaries are now reachable.
pub fn dependent_handle_fixpoint(
    ctx: &mut MarkContext<'_>,
    tables: &[Arc<crate::handles::HandleTable>],
) {
    loop {
        let mut changed = false;
        for table in tables {
            table.scan(&[HandleType::Dependent], None, &mut |slot| {
                let primary = slot.value();
                let secondary = slot.extra();
                if primary == 0 || secondary == 0 {
                    return;
                }
                let primary_live = !ctx.marker.in_condemned(ctx.shared, primary)
                    || unsafe { object::is_marked(primary) };
                if primary_live && ctx.marker.in_condemned(ctx.shared, secondary) {
                    let already = unsafe { object::is_marked(secondary) };
                    if !already {
                        ctx.promote(secondary);
                        changed = true;
                    }
                }
            });
        }
        ctx.drain();
        if !changed {
            return;
        }
    }
}

/// Clear weak handles of the given kinds whose targets did not survive.
/// Dependent handles with dead primaries are fully cleared; ref-counted
/// handles are treated as weak once their count drops to zero.
pub fn clear_weak_handles(
    ctx: &MarkContext<'_>,
    tables: &[Arc<crate::handles::HandleTable>],
    long: bool,
) {
    let kinds: &[HandleType] = if long {
        &[HandleType::WeakLong]
    } else {
        &[HandleType::WeakShort]
    };
    for table in tables {
        table.scan(kinds, None, &mut |slot| {
            let target = slot.value();
            if target != 0
                && ctx.marker.in_condemned(ctx.shared, target)
                && !unsafe { object::is_marked(target) }
            {
                slot.set_value(0);
            }
        });
        if !long {
            table.scan(&[HandleType::Dependent], None, &mut |slot| {
                let primary = slot.value();
                if primary != 0
                    && ctx.marker.in_condemned(ctx.shared, primary)
                    && !unsafe { object::is_marked(primary) }
                {
                    slot.set_value(0);
                    slot.set_extra(0);
                }
            });
            table.scan(&[HandleType::RefCounted], None, &mut |slot| {
                let target = slot.value();
                if target != 0
                    && slot.extra() == 0
                    && ctx.marker.in_condemned(ctx.shared, target)
                    && !unsafe { object::is_marked(target) }
                {
                    slot.set_value(0);
                }
            });
        }
    }
}
