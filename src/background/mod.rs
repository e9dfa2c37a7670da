//! Background Collection
//!
//! Overlaps most of marking with mutation, then sweeps concurrently.
//! The state machine per instance:
//!
//! ```text
//! not_in_process → initialized → mark_handles → mark_stack
//!    → revisit_soh → revisit_uoh → overflow_soh → overflow_uoh
//!    → final_marking → sweep_soh → sweep_uoh → not_in_process
//! ```
//!
//! A foreground gen1 collection initializes a BGC: it snapshots roots
//! and per-region `background_allocated` watermarks while the EE is
//! suspended, activates write watch, and wakes the BGC thread. Mutators
//! then run; the write barrier records dirty pages the revisit states
//! re-scan. Objects allocated at or above a region's watermark are
//! implicitly live. Foreground ephemeral collections may interrupt
//! between work chunks via the foreground interlock.
//!
//! Marking uses the side mark array, never object words, so mutator
//! reads and writes are undisturbed.

use crate::collect::GcCore;
use crate::error::{GcError, Result};
use crate::handles::table::HandleType;
use crate::heap::region::flags;
use crate::heap::{HeapRegion, MAX_SOH_GENERATION};
use crate::object;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Background collection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BgcState {
    NotInProcess = 0,
    Initialized,
    MarkHandles,
    MarkStack,
    RevisitSoh,
    RevisitUoh,
    OverflowSoh,
    OverflowUoh,
    FinalMarking,
    SweepSoh,
    SweepUoh,
}

impl BgcState {
    fn from_u8(v: u8) -> BgcState {
        match v {
            1 => BgcState::Initialized,
            2 => BgcState::MarkHandles,
            3 => BgcState::MarkStack,
            4 => BgcState::RevisitSoh,
            5 => BgcState::RevisitUoh,
            6 => BgcState::OverflowSoh,
            7 => BgcState::OverflowUoh,
            8 => BgcState::FinalMarking,
            9 => BgcState::SweepSoh,
            10 => BgcState::SweepUoh,
            _ => BgcState::NotInProcess,
        }
    }
}

/// Soft cap on the background mark queue before the overflow states
/// take over.
const BGC_MARK_QUEUE_LIMIT: usize = 64 * 1024;

/// Objects scanned per work chunk between foreground-interlock yields.
const BGC_CHUNK: usize = 256;

/// Background collector: state, queue, thread and the foreground
/// interlock.
pub struct BackgroundCollector {
    core: Arc<GcCore>,

    state: AtomicU8,

    /// Work queue filled at init and drained by the BGC thread.
    queue: Mutex<Vec<usize>>,

    /// Overflow bounds when the queue refuses to grow.
    overflow_min: AtomicUsize,
    overflow_max: AtomicUsize,

    /// Mutators hold this while a blocking collection runs; the BGC
    /// thread takes it around every work chunk, so a foreground GC
    /// finds it at a safe point by construction.
    fgc_interlock: Mutex<()>,

    /// Wakes the BGC thread.
    wake: Condvar,
    wake_lock: Mutex<bool>,

    running: AtomicBool,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,

    /// UOH allocated bytes at mark start, for the allocation throttle.
    uoh_baseline: AtomicUsize,

    /// Completed background collections.
    pub bgc_count: AtomicU64,
}

impl BackgroundCollector {
    pub fn new(core: Arc<GcCore>) -> Arc<Self> {
        Arc::new(Self {
            core,
            state: AtomicU8::new(BgcState::NotInProcess as u8),
            queue: Mutex::new(Vec::new()),
            overflow_min: AtomicUsize::new(usize::MAX),
            overflow_max: AtomicUsize::new(0),
            fgc_interlock: Mutex::new(()),
            wake: Condvar::new(),
            wake_lock: Mutex::new(false),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            uoh_baseline: AtomicUsize::new(0),
            bgc_count: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> BgcState {
        BgcState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn in_progress(&self) -> bool {
        self.state() != BgcState::NotInProcess
    }

    fn set_state(&self, state: BgcState) {
        log::debug!("BGC state -> {:?}", state);
        self.state.store(state as u8, Ordering::Release);
    }

    /// Hold the BGC at a phase boundary while a foreground collection
    /// runs.
    pub fn pause_for_foreground(&self) -> MutexGuard<'_, ()> {
        self.fgc_interlock.lock()
    }

    /// Spawn the BGC thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("gc-background".to_string())
            .spawn(move || this.thread_loop())
            .map_err(|e| GcError::Internal(format!("failed to spawn BGC thread: {}", e)))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        {
            let mut pending = self.wake_lock.lock();
            *pending = true;
            self.wake.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Foreground initialization: runs with the EE suspended inside the
    /// gen1 collection that starts this BGC. Snapshots roots and
    /// watermarks, activates write watch, wakes the thread.
    pub fn initialize(&self) {
        debug_assert!(!self.in_progress());
        self.set_state(BgcState::Initialized);

        // Watermarks: everything allocated from here on is implicitly
        // live for this cycle. The mark array is reset per region.
        let mut uoh_total = 0usize;
        for region in self.core.shared.region_map.all_regions() {
            let gen = region.generation();
            if gen >= MAX_SOH_GENERATION {
                region.set_background_allocated(region.allocated());
                region.clear_flag(flags::BGC_SWEPT);
                self.core
                    .shared
                    .mark_array
                    .clear_range(region.mem(), region.allocated());
                if gen > MAX_SOH_GENERATION {
                    uoh_total += region.allocated_size();
                }
            }
        }
        self.uoh_baseline.store(uoh_total, Ordering::Release);

        // Root snapshot: stacks now; handles concurrently in
        // mark_handles (async scan), backed up by the final pass.
        let mut queue = self.queue.lock();
        queue.clear();
        self.core.env.enumerate_roots(&mut |slot| {
            let target = unsafe { std::ptr::read(slot as *const usize) };
            if target != 0 {
                queue.push(target);
            }
        });
        drop(queue);

        self.core.shared.write_watch.activate();

        let mut pending = self.wake_lock.lock();
        *pending = true;
        self.wake.notify_one();
    }

    /// Proportional sleep for mutators allocating into LOH/POH while a
    /// BGC is marking.
    pub fn throttle_uoh_allocation(&self) {
        if !matches!(
            self.state(),
            BgcState::MarkHandles
                | BgcState::MarkStack
                | BgcState::RevisitSoh
                | BgcState::RevisitUoh
        ) {
            return;
        }
        let baseline = self.uoh_baseline.load(Ordering::Acquire);
        if baseline == 0 {
            return;
        }
        let mut current = 0usize;
        for region in self.core.shared.region_map.all_regions() {
            if region.generation() > MAX_SOH_GENERATION {
                current += region.allocated_size();
            }
        }
        let growth_percent = current.saturating_sub(baseline) * 100 / baseline;
        if growth_percent > 0 {
            // 1ms per 10% growth, capped.
            let ms = (growth_percent / 10).min(50) as u64;
            if ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
        }
    }

    // ---- BGC-side marking primitives ----

    /// Whether `obj` is subject to this background cycle.
    fn in_bgc_set(&self, obj: usize) -> Option<&HeapRegion> {
        let region = self.core.shared.region_map.region_of(obj)?;
        let watermark = region.background_allocated();
        if region.generation() >= MAX_SOH_GENERATION && watermark != 0 && obj < watermark {
            Some(region)
        } else {
            None
        }
    }

    /// Liveness as established by this cycle (anything outside the BGC
    /// set counts as live).
    fn bgc_is_live(&self, obj: usize) -> bool {
        match self.in_bgc_set(obj) {
            Some(_) => self.core.shared.mark_array.is_marked(obj),
            None => true,
        }
    }

    fn bgc_promote(&self, obj: usize, queue: &mut Vec<usize>) {
        if obj == 0 || self.in_bgc_set(obj).is_none() {
            return;
        }
        if self.core.shared.mark_array.mark(obj) {
            return;
        }
        if queue.len() >= BGC_MARK_QUEUE_LIMIT {
            self.overflow_min.fetch_min(obj, Ordering::Relaxed);
            self.overflow_max.fetch_max(obj + 1, Ordering::Relaxed);
        } else {
            queue.push(obj);
        }
    }

    fn scan_one(&self, obj: usize, queue: &mut Vec<usize>) {
        unsafe {
            if object::is_free_object(obj) {
                return;
            }
            if !object::method_table(obj).has_references() {
                return;
            }
            object::for_each_ref(obj, |slot| {
                // Mutators may race this read; the revisit states catch
                // anything installed after we looked.
                let target = std::ptr::read(slot as *const usize);
                self.bgc_promote(target, queue);
            });
        }
    }

    /// Process one chunk of the queue. Returns whether work remains.
    fn drain_chunk(&self) -> bool {
        let mut local: Vec<usize> = Vec::with_capacity(BGC_CHUNK);
        {
            let mut queue = self.queue.lock();
            let take = queue.len().min(BGC_CHUNK);
            if take == 0 {
                return false;
            }
            let at = queue.len() - take;
            local.extend(queue.drain(at..));
        }
        let mut produced: Vec<usize> = Vec::new();
        for obj in local {
            // Queue entries predate any move: a foreground GC only
            // relocates ephemeral regions, never the BGC set.
            self.scan_one(obj, &mut produced);
        }
        self.queue.lock().append(&mut produced);
        true
    }

    /// Drain the queue, taking the foreground interlock per chunk when
    /// `gated` (the concurrent states) and running straight through
    /// when not (final marking, which already excludes foreground GCs).
    fn drain_queue(&self, gated: bool) {
        loop {
            let gate = gated.then(|| self.fgc_interlock.lock());
            if !self.drain_chunk() {
                return;
            }
            drop(gate);
        }
    }

    fn drain_overflow(&self, gated: bool) {
        loop {
            let min = self.overflow_min.swap(usize::MAX, Ordering::Relaxed);
            let max = self.overflow_max.swap(0, Ordering::Relaxed);
            if min >= max {
                return;
            }
            log::debug!("BGC mark overflow sweep [{:#x}, {:#x})", min, max);
            for region in self.core.shared.region_map.all_regions() {
                let watermark = region.background_allocated();
                if watermark == 0 || region.mem() >= max || watermark <= min {
                    continue;
                }
                let mut produced = Vec::new();
                {
                    let gate = gated.then(|| self.fgc_interlock.lock());
                    unsafe {
                        let mut obj = region.first_obj();
                        while obj < watermark {
                            let size = object::object_size(obj);
                            if self.core.shared.mark_array.is_marked(obj) {
                                self.scan_one(obj, &mut produced);
                            }
                            obj += size;
                        }
                    }
                    drop(gate);
                }
                self.queue.lock().append(&mut produced);
                self.drain_queue(gated);
            }
        }
    }

    /// Revisit pages dirtied by the write barrier since mark start.
    fn revisit_dirty(&self, uoh: bool, gated: bool) {
        for region in self.core.shared.region_map.all_regions() {
            let is_uoh = region.generation() > MAX_SOH_GENERATION;
            if is_uoh != uoh {
                continue;
            }
            let watermark = region.background_allocated();
            if watermark == 0 {
                continue;
            }
            let dirty = self
                .core
                .shared
                .write_watch
                .drain(region.mem(), watermark);
            if dirty.is_empty() {
                continue;
            }
            let gate = gated.then(|| self.fgc_interlock.lock());
            let page = self.core.shared.write_watch.page_size();
            let mut produced = Vec::new();
            for page_base in dirty {
                let lo = page_base.max(region.mem());
                let hi = (page_base + page).min(watermark);
                unsafe {
                    if let Some(first) =
                        self.core.shared.bricks.object_start(lo, region.mem(), watermark)
                    {
                        let mut obj = first;
                        while object::plug_start(obj) < hi {
                            if self.core.shared.mark_array.is_marked(obj) {
                                self.scan_one(obj, &mut produced);
                            }
                            let next = obj + object::object_size(obj);
                            if next >= object::obj_at(watermark) {
                                break;
                            }
                            obj = next;
                        }
                    }
                }
            }
            drop(gate);
            self.queue.lock().append(&mut produced);
        }
        self.drain_queue(gated);
    }

    /// Final synchronous mark under stop-the-world, then the weak /
    /// finalizer protocol on the mark-array predicate. Serialized with
    /// blocking collections through the GC lock.
    fn final_marking(&self) {
        let _gc = self.core.gc_lock.lock();
        self.core.env.suspend_ee();

        // Re-scan roots: anything reachable now is live.
        let mut queue = self.queue.lock();
        self.core.env.enumerate_roots(&mut |slot| {
            let target = unsafe { std::ptr::read(slot as *const usize) };
            if target != 0 {
                let mut q = Vec::new();
                self.bgc_promote(target, &mut q);
                queue.extend(q);
            }
        });
        drop(queue);

        // Synchronous handle pass covers whatever the async scan missed.
        for table in self.core.handles.tables() {
            table.scan(
                &[
                    HandleType::Strong,
                    HandleType::SizeRef,
                    HandleType::Pinned,
                    HandleType::AsyncPinned,
                ],
                None,
                &mut |slot| {
                    let mut q = Vec::new();
                    self.bgc_promote(slot.value(), &mut q);
                    self.queue.lock().extend(q);
                },
            );
            table.scan(&[HandleType::RefCounted], None, &mut |slot| {
                if slot.extra() > 0 {
                    let mut q = Vec::new();
                    self.bgc_promote(slot.value(), &mut q);
                    self.queue.lock().extend(q);
                }
            });
        }
        self.drain_queue(false);
        self.revisit_dirty(false, false);
        self.revisit_dirty(true, false);
        self.drain_overflow(false);

        // Dependent handles to fixpoint on the BGC predicate.
        loop {
            let mut changed = false;
            for table in self.core.handles.tables() {
                table.scan(&[HandleType::Dependent], None, &mut |slot| {
                    let primary = slot.value();
                    let secondary = slot.extra();
                    if primary != 0
                        && secondary != 0
                        && self.bgc_is_live(primary)
                        && !self.bgc_is_live(secondary)
                    {
                        let mut q = Vec::new();
                        self.bgc_promote(secondary, &mut q);
                        self.queue.lock().extend(q);
                        changed = true;
                    }
                });
            }
            self.drain_queue(false);
            if !changed {
                break;
            }
        }

        // Weak-short, finalization, weak-long.
        for table in self.core.handles.tables() {
            table.scan(&[HandleType::WeakShort], None, &mut |slot| {
                let target = slot.value();
                if target != 0 && !self.bgc_is_live(target) {
                    slot.set_value(0);
                }
            });
        }
        let mut resurrected = Vec::new();
        self.core.finalize.scan_for_finalization(
            MAX_SOH_GENERATION,
            &|obj| self.core.generation_of(obj).min(MAX_SOH_GENERATION),
            &|obj| self.bgc_is_live(obj),
            &mut |obj| resurrected.push(obj),
        );
        {
            let mut queue = self.queue.lock();
            for obj in resurrected {
                let mut q = Vec::new();
                self.bgc_promote(obj, &mut q);
                queue.extend(q);
            }
        }
        self.drain_queue(false);
        for table in self.core.handles.tables() {
            table.scan(&[HandleType::WeakLong], None, &mut |slot| {
                let target = slot.value();
                if target != 0 && !self.bgc_is_live(target) {
                    slot.set_value(0);
                }
            });
        }

        self.core.shared.write_watch.deactivate();
        self.core.env.restart_ee();
    }

    /// Concurrent sweep of one class of regions. Dead objects become
    /// free-list items; the gen2 doubly-linked list accepts them while
    /// mutators allocate.
    fn sweep(&self, uoh: bool) {
        for region in self.core.shared.region_map.all_regions() {
            let is_uoh = region.generation() > MAX_SOH_GENERATION;
            if is_uoh != uoh {
                continue;
            }
            let watermark = region.background_allocated();
            if watermark == 0 || region.has_flag(flags::BGC_SWEPT) {
                continue;
            }

            let _chunk_gate = self.fgc_interlock.lock();
            let heap = &self.core.heaps[region.heap_index()];
            let gen_number = region.generation();

            let mut gaps: Vec<(usize, usize)> = Vec::new();
            let mut open: Option<(usize, usize)> = None;
            unsafe {
                let mut obj = region.first_obj();
                while obj < watermark {
                    let size = object::object_size(obj);
                    let plug = object::plug_start(obj);
                    let live = self.core.shared.mark_array.is_marked(obj)
                        || object::is_free_object(obj);
                    if live {
                        if let Some((s, e)) = open.take() {
                            gaps.push((s, e - s));
                        }
                    } else {
                        match &mut open {
                            Some((_, e)) if *e == plug => *e += size,
                            _ => {
                                if let Some((s, e)) = open.take() {
                                    gaps.push((s, e - s));
                                }
                                open = Some((plug, plug + size));
                            }
                        }
                    }
                    obj += size;
                }
            }
            if let Some((s, e)) = open.take() {
                gaps.push((s, e - s));
            }

            if !gaps.is_empty() {
                let mut core = heap.core.lock();
                let generation = &mut core.generations[gen_number];
                for &(start, len) in &gaps {
                    unsafe {
                        object::make_free_object(start, len);
                        let item = object::obj_at(start);
                        if gen_number == MAX_SOH_GENERATION {
                            generation.allocator.thread_item_added(item, len);
                        } else {
                            generation.allocator.thread_item(item, len);
                        }
                    }
                }
            }
            self.core.shared.mark_array.clear_range(region.mem(), watermark);
            region.set_flag(flags::BGC_SWEPT);
            unsafe {
                self.core.shared.bricks.rebuild_for_region(&region);
            }
        }
    }

    fn finish_cycle(&self) {
        // Merge the added lists and retire the watermarks.
        for heap in &self.core.heaps {
            let mut core = heap.core.lock();
            unsafe {
                core.generations[MAX_SOH_GENERATION].allocator.merge_added();
            }
            // Refresh gen2/UOH budgets from the swept free space.
            let tuner = self.core.tuner.lock();
            for g in MAX_SOH_GENERATION..crate::heap::NUM_GENERATIONS {
                let generation = &mut core.generations[g];
                generation.dd.fragmentation = generation.free_space();
                generation.dd.current_size = generation
                    .allocated_size()
                    .saturating_sub(generation.free_space());
                generation.dd.survived_size = generation.dd.current_size;
                generation.dd.begin_data_size = generation.allocated_size();
                tuner.update_generation(&mut generation.dd, g);
            }
        }
        for region in self.core.shared.region_map.all_regions() {
            region.set_background_allocated(0);
            region.clear_flag(flags::BGC_SWEPT);
        }

        // Optional PID loop toward the memory-load goal.
        let load = crate::platform::memory_status().load_percent;
        let mut tuner = self.core.tuner.lock();
        for heap in &self.core.heaps {
            let mut core = heap.core.lock();
            tuner.bgc_fl_tune(&mut core.generations[MAX_SOH_GENERATION].dd, load);
        }

        self.bgc_count.fetch_add(1, Ordering::Release);
        self.set_state(BgcState::NotInProcess);
        log::info!("BGC #{} complete", self.bgc_count.load(Ordering::Relaxed));
    }

    fn thread_loop(&self) {
        while self.running.load(Ordering::Acquire) {
            {
                let mut pending = self.wake_lock.lock();
                if !*pending {
                    self.wake.wait_for(&mut pending, std::time::Duration::from_millis(50));
                }
                if !*pending {
                    continue;
                }
                *pending = false;
            }
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            if self.state() != BgcState::Initialized {
                continue;
            }

            self.set_state(BgcState::MarkHandles);

            // The init snapshot holds raw root targets; mark them
            // through the promote path so they enter the cycle's set.
            let snapshot = std::mem::take(&mut *self.queue.lock());
            let mut promoted = Vec::new();
            for obj in snapshot {
                self.bgc_promote(obj, &mut promoted);
            }
            self.queue.lock().append(&mut promoted);

            for table in self.core.handles.tables() {
                let ranges = table.queue_async_ranges(&[
                    HandleType::Strong,
                    HandleType::SizeRef,
                    HandleType::Pinned,
                    HandleType::AsyncPinned,
                ]);
                let mut produced = Vec::new();
                crate::handles::scan::process_async_ranges(&ranges, &mut |slot| {
                    self.bgc_promote(slot.value(), &mut produced);
                });
                self.queue.lock().append(&mut produced);
            }

            self.set_state(BgcState::MarkStack);
            self.drain_queue(true);

            self.set_state(BgcState::RevisitSoh);
            self.revisit_dirty(false, true);
            self.set_state(BgcState::RevisitUoh);
            self.revisit_dirty(true, true);

            self.set_state(BgcState::OverflowSoh);
            self.drain_overflow(true);
            self.set_state(BgcState::OverflowUoh);
            self.drain_overflow(true);

            self.set_state(BgcState::FinalMarking);
            self.final_marking();

            self.set_state(BgcState::SweepSoh);
            self.sweep(false);
            self.set_state(BgcState::SweepUoh);
            self.sweep(true);

            self.finish_cycle();
        }
    }
}
