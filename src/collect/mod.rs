//! Blocking Collection Pipeline
//!
//! The decide → suspend → mark → plan → relocate → compact/sweep → post
//! sequence, orchestrated by [`GcCore::blocking_collection`]. `GcCore`
//! owns the state every collector-side subsystem shares: the memory
//! resources, the heap table, the handle store, the finalization queue
//! and the tuner.

pub mod compact;
pub mod mark;
pub mod plan;
pub mod relocate;
pub mod sweep;

use crate::alloc::{AllocContext, Allocator};
use crate::config::{GcConfig, LohCompactionMode};
use crate::ee::ExecutionEnv;
use crate::error::Result;
use crate::finalize::FinalizeQueue;
use crate::handles::HandleStore;
use crate::heap::generation::is_uoh_generation;
use crate::heap::{
    Heap, SharedHeap, LOH_GENERATION, MAX_SOH_GENERATION, NUM_GENERATIONS, POH_GENERATION,
};
use crate::stats::GcStats;
use crate::tuning::Tuner;
use mark::{MarkContext, Marker};
use parking_lot::Mutex;
use plan::{RegionFate, RegionPlan};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    /// Small-object allocation exhausted its budget.
    AllocSoh,
    /// LOH/POH allocation exhausted its budget.
    AllocUoh,
    /// Explicit request from the host.
    Induced,
    /// The configured hard limit was hit.
    HardLimit,
    /// Physical memory pressure.
    MemoryPressure,
    /// A no-GC region ended (or overflowed its budget).
    NoGcRegionEnd,
    /// Final collection at shutdown.
    Shutdown,
}

/// The decisions describing one collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMechanisms {
    /// Highest condemned SOH generation.
    pub condemned_generation: usize,
    /// LOH/POH are condemned too (full collection).
    pub condemn_uoh: bool,
    /// Compacting (vs sweeping) for the condemned SOH generations.
    pub compacting: bool,
    /// LOH compacts at this collection.
    pub loh_compacting: bool,
    /// This is the foreground start of a background collection.
    pub background: bool,
    /// The request was elevated under memory pressure.
    pub elevated: bool,
    /// The finalizer pass moved objects to the ready partition.
    pub found_finalizers: bool,
    /// Why the collection ran.
    pub reason: GcReason,
}

/// Generation a condemned SOH generation's survivors move to.
#[inline]
pub fn promoted_generation(gen: usize) -> usize {
    if gen >= MAX_SOH_GENERATION {
        gen
    } else {
        gen + 1
    }
}

/// Collector-wide state shared by the blocking pipeline, the background
/// collector and the public facade.
pub struct GcCore {
    pub config: Arc<GcConfig>,
    pub shared: Arc<SharedHeap>,
    pub heaps: Vec<Arc<Heap>>,
    pub env: Arc<dyn ExecutionEnv>,
    pub handles: Arc<HandleStore>,
    pub finalize: Arc<FinalizeQueue>,
    pub allocator: Allocator,
    pub stats: Arc<GcStats>,
    pub tuner: Mutex<Tuner>,

    /// Serializes "start a collection" decisions.
    pub gc_lock: Mutex<()>,

    /// Current LOH compaction mode (`Once` resets after it fires).
    pub loh_mode: Mutex<LohCompactionMode>,

    /// Completed blocking collections.
    pub gc_count: AtomicU64,

    /// Most recent settings, for diagnostics.
    pub last_settings: Mutex<Option<GcMechanisms>>,

    /// Per-heap collector threads (server configuration only).
    pub server: Option<crate::server::ServerRuntime>,
}

/// Scratch accounting captured at suspend time.
struct BeginSizes {
    /// Per heap, per generation allocated bytes.
    per_heap: Vec<[usize; NUM_GENERATIONS]>,
}

impl GcCore {
    /// Generation of an object by its region (MAX for non-heap
    /// addresses, which are always treated as old).
    pub fn generation_of(&self, obj: usize) -> usize {
        self.shared
            .region_map
            .region_of(obj)
            .map(|r| r.generation())
            .unwrap_or(MAX_SOH_GENERATION)
    }

    /// Decide what to collect.
    fn decide(&self, requested: usize, reason: GcReason) -> GcMechanisms {
        let mem = crate::platform::memory_status();

        let mut exhausted = [false; MAX_SOH_GENERATION + 1];
        let mut frag = 0usize;
        let mut size = 0usize;
        let mut loh_frag = 0usize;
        let mut loh_size = 0usize;
        for heap in &self.heaps {
            let core = heap.core.lock();
            for (g, e) in exhausted.iter_mut().enumerate() {
                *e |= core.generations[g].dd.budget_exhausted();
            }
            for gen in &core.generations {
                let allocated = gen.allocated_size();
                let free = gen.free_space();
                if gen.number <= MAX_SOH_GENERATION {
                    frag += free;
                    size += allocated;
                } else if gen.number == LOH_GENERATION {
                    loh_frag += free;
                    loh_size += allocated;
                }
            }
        }

        let tuner = self.tuner.lock();
        let (condemned, elevated) =
            tuner.condemned_generation(requested, &exhausted, mem.load_percent);
        // The provisional-mode follow-up (and real memory pressure) must
        // reach gen2 despite the provisional degrade.
        let condemned = if matches!(reason, GcReason::MemoryPressure) {
            condemned.max(requested.min(MAX_SOH_GENERATION))
        } else {
            condemned
        };
        let condemn_uoh = condemned == MAX_SOH_GENERATION;
        let compacting = tuner.should_compact(condemned, frag, size)
            || matches!(reason, GcReason::HardLimit);

        let loh_mode = *self.loh_mode.lock();
        let loh_compacting =
            condemn_uoh && tuner.loh_should_compact(loh_mode, loh_frag, loh_size);

        GcMechanisms {
            condemned_generation: condemned,
            condemn_uoh,
            compacting,
            loh_compacting,
            background: false,
            elevated,
            found_finalizers: false,
            reason,
        }
    }

    /// Turn every mutator and collector allocation context into a free
    /// object so the heap is walkable.
    fn fix_allocation_contexts(&self) {
        self.env.enumerate_alloc_contexts(&mut |ctx: &mut AllocContext| unsafe {
            ctx.fix();
        });
        for heap in &self.heaps {
            let mut core = heap.core.lock();
            for gen in &mut core.generations {
                unsafe {
                    gen.alloc_context.fix();
                }
            }
        }
    }

    fn record_begin_sizes(&self) -> BeginSizes {
        let per_heap = self
            .heaps
            .iter()
            .map(|heap| {
                let core = heap.core.lock();
                let mut sizes = [0usize; NUM_GENERATIONS];
                for (g, s) in sizes.iter_mut().enumerate() {
                    *s = core.generations[g].allocated_size();
                }
                sizes
            })
            .collect();
        BeginSizes { per_heap }
    }

    /// Whether a generation is in this collection's condemned set.
    fn compacting_for(&self, settings: &GcMechanisms, gen: usize) -> bool {
        match gen {
            POH_GENERATION => false,
            LOH_GENERATION => settings.loh_compacting,
            _ => settings.compacting,
        }
    }

    /// Run one blocking collection. The caller holds no heap locks; the
    /// GC lock is taken here.
    pub fn blocking_collection(&self, requested: usize, reason: GcReason) -> Result<GcMechanisms> {
        let _gc = self.gc_lock.lock();
        let mut settings = self.decide(requested, reason);

        log::info!(
            "GC #{} gen{}{} {:?} ({}compacting)",
            self.gc_count.load(Ordering::Relaxed),
            settings.condemned_generation,
            if settings.condemn_uoh { "+UOH" } else { "" },
            reason,
            if settings.compacting { "" } else { "non-" },
        );
        let timer = crate::platform::now();

        self.env.suspend_ee();
        let outcome = self.collect_suspended(&mut settings);
        self.env.restart_ee();

        let elapsed = timer.elapsed();
        self.gc_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .record_collection(settings.condemned_generation, settings.compacting, elapsed);
        *self.last_settings.lock() = Some(settings);
        if let Err(e) = outcome {
            if e.is_bug() {
                // Corruption never propagates as a recoverable error.
                self.env.handle_fatal_error(&e.to_string());
            }
            return Err(e);
        }
        Ok(settings)
    }

    /// The pipeline proper, with every mutator at a safe point.
    fn collect_suspended(&self, settings: &mut GcMechanisms) -> Result<()> {
        self.fix_allocation_contexts();
        let begin = self.record_begin_sizes();

        if self.config.heap_verify_level >= crate::config::HeapVerifyLevel::Basic {
            crate::verify::verify_heap(self, "on-entry")?;
        }

        // ---- Mark ----
        let (marker, mut workers) = Marker::new(
            settings.condemned_generation,
            settings.condemn_uoh,
            self.heaps.len(),
        );
        let marker = Arc::new(marker);
        let mut ctx = MarkContext::new(&marker, &self.shared, workers.remove(0));
        settings.found_finalizers = self.mark_phase(&marker, &mut ctx, settings, workers);

        // ---- Plan ----
        let plans = self.plan_phase(settings);

        // ---- Relocate (also retires stale cards) ----
        relocate::relocate_phase(
            &self.shared,
            &marker,
            &plans,
            self.env.as_ref(),
            &self.handles,
            &self.finalize,
        );

        // ---- Compact / sweep / free ----
        self.evacuate_phase(settings, &plans)?;

        // ---- Post ----
        self.post_phase(settings, &plans, &begin, &marker)?;

        if self.config.heap_verify_level >= crate::config::HeapVerifyLevel::Basic {
            crate::verify::verify_heap(self, "on-exit")?;
        }
        Ok(())
    }

    /// Mark from roots, remembered set, handles and the finalization
    /// queue. Returns whether finalizers were found.
    fn mark_phase(
        &self,
        marker: &Arc<Marker>,
        ctx: &mut MarkContext<'_>,
        settings: &GcMechanisms,
        helper_workers: Vec<crossbeam_deque::Worker<usize>>,
    ) -> bool {
        // Stack and static roots.
        self.env.enumerate_roots(&mut |slot| {
            let target = unsafe { std::ptr::read(slot as *const usize) };
            ctx.promote(target);
        });

        // Handle roots (strong + pinning + ref-counted).
        mark::mark_handle_roots(ctx, self.handles.tables());

        // Remembered set: cards are only consulted for ephemeral
        // collections; a full GC traces everything anyway. The keep
        // decision happens later in relocate, so every visited card
        // stays for now. In the server configuration the card chunks
        // and the drain are shared with the helper threads.
        let cards = if settings.condemned_generation < MAX_SOH_GENERATION {
            Arc::new(crate::server::CardWork::new(&self.shared, marker))
        } else {
            Arc::new(crate::server::CardWork::empty())
        };
        match &self.server {
            Some(server) => {
                server.parallel_mark(marker, helper_workers, cards, ctx);
            }
            None => {
                cards.scan_chunks(&self.shared, ctx);
                ctx.drain();
            }
        }

        // Dependent handles to fixpoint, then the weak/finalizer
        // ordering protocol.
        mark::dependent_handle_fixpoint(ctx, self.handles.tables());
        mark::clear_weak_handles(ctx, self.handles.tables(), false);

        let condemn_uoh = settings.condemn_uoh;
        let condemned = settings.condemned_generation;
        let shared = &self.shared;
        let gen_of = move |obj: usize| -> usize {
            let gen = shared
                .region_map
                .region_of(obj)
                .map(|r| r.generation())
                .unwrap_or(MAX_SOH_GENERATION);
            if condemn_uoh && gen > MAX_SOH_GENERATION {
                MAX_SOH_GENERATION
            } else {
                gen
            }
        };
        let mut promoted: Vec<usize> = Vec::new();
        let found = self.finalize.scan_for_finalization(
            condemned,
            &gen_of,
            &|obj| unsafe { crate::object::is_marked(obj) },
            &mut |obj| promoted.push(obj),
        );
        for obj in promoted {
            ctx.promote(obj);
        }
        ctx.drain();

        // The finalizer pass may have resurrected dependent primaries.
        mark::dependent_handle_fixpoint(ctx, self.handles.tables());
        mark::clear_weak_handles(ctx, self.handles.tables(), true);

        found
    }

    /// Plan every condemned region.
    fn plan_phase(&self, settings: &GcMechanisms) -> Vec<RegionPlan> {
        let mut plans = Vec::new();
        for heap in &self.heaps {
            let core = heap.core.lock();
            for gen in &core.generations {
                let condemned = gen.number <= settings.condemned_generation
                    || (settings.condemn_uoh && is_uoh_generation(gen.number));
                if !condemned {
                    continue;
                }
                let compacting = self.compacting_for(settings, gen.number);
                for region in &gen.regions {
                    plans.push(unsafe { plan::plan_region(region, compacting) });
                }
            }
        }
        plans
    }

    /// Execute each region's fate, threading the recovered gaps onto
    /// the free list of the generation the region promotes into.
    fn evacuate_phase(&self, settings: &GcMechanisms, plans: &[RegionPlan]) -> Result<()> {
        // Free lists of the condemned generations are rebuilt from
        // scratch; their old items are dead space inside the planned
        // regions and would otherwise be threaded twice.
        for heap in &self.heaps {
            let mut core = heap.core.lock();
            for gen in &mut core.generations {
                let condemned = gen.number <= settings.condemned_generation
                    || (settings.condemn_uoh && is_uoh_generation(gen.number));
                if condemned {
                    gen.allocator.reset();
                }
            }
        }

        for plan in plans {
            let region = &plan.region;
            let heap = &self.heaps[region.heap_index()];
            let old_gen = region.generation();
            let target_gen = if is_uoh_generation(old_gen) {
                old_gen
            } else {
                promoted_generation(old_gen)
            };

            match plan.fate {
                RegionFate::Free => {
                    let mut core = heap.core.lock();
                    let removed = core.generations[old_gen].remove_region(region);
                    debug_assert!(removed);
                    drop(core);
                    self.shared.cards.clear_range(region.mem(), region.allocated());
                    self.shared
                        .bricks
                        .clear_range(region.mem(), region.reserved_end());
                    self.shared.delete_region(region)?;
                }
                RegionFate::Compact => {
                    let out = unsafe { compact::compact_region(&self.shared, plan) };
                    let mut core = heap.core.lock();
                    let allocator = &mut core.generations[target_gen].allocator;
                    for (gap, len) in out.gaps {
                        unsafe {
                            allocator.thread_item(crate::object::obj_at(gap), len);
                        }
                    }
                }
                RegionFate::SweepInPlace => {
                    let out = unsafe { sweep::sweep_region(&self.shared, plan) };
                    let mut core = heap.core.lock();
                    let allocator = &mut core.generations[target_gen].allocator;
                    for (gap, len) in out.gaps {
                        unsafe {
                            allocator.thread_item(crate::object::obj_at(gap), len);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Promote regions, refresh budgets, ages and partitions, restart
    /// background bookkeeping.
    fn post_phase(
        &self,
        settings: &mut GcMechanisms,
        plans: &[RegionPlan],
        begin: &BeginSizes,
        marker: &Marker,
    ) -> Result<()> {
        // Per-(heap, generation) survival from the plans.
        let mut survived = vec![[0usize; NUM_GENERATIONS]; self.heaps.len()];
        let mut pinned = vec![[0usize; NUM_GENERATIONS]; self.heaps.len()];
        for plan in plans {
            if plan.fate == RegionFate::Free {
                continue;
            }
            let h = plan.region.heap_index();
            let g = plan.region.generation();
            survived[h][g] += plan.live_bytes;
            pinned[h][g] += plan.pinned_bytes;
        }

        // Move surviving condemned regions to their new generation.
        for plan in plans {
            if plan.fate == RegionFate::Free {
                continue;
            }
            let region = &plan.region;
            let old_gen = region.generation();
            if is_uoh_generation(old_gen) {
                continue;
            }
            let target = promoted_generation(old_gen);
            if target == old_gen {
                continue;
            }
            let heap = &self.heaps[region.heap_index()];
            let mut core = heap.core.lock();
            if core.generations[old_gen].remove_region(region) {
                region.set_generation(target);
                core.generations[target].regions.push(region.clone());
            }
        }

        // Gen0 must own a region for the allocator to refill from.
        for heap in &self.heaps {
            let mut core = heap.core.lock();
            if core.generations[0].regions.is_empty() {
                match self.shared.new_region(0, heap.number, false, 0) {
                    Ok(region) => core.generations[0].regions.push(region),
                    Err(e) => log::warn!("no gen0 region after GC on heap {}: {}", heap.number, e),
                }
            }
        }

        // Promoted bytes consume the receiving generation's budget, so
        // sustained promotion eventually triggers the older collection.
        for (h, heap) in self.heaps.iter().enumerate() {
            let mut core = heap.core.lock();
            for g in 0..=settings.condemned_generation.min(MAX_SOH_GENERATION) {
                let target = promoted_generation(g);
                if target != g && survived[h][g] > 0 {
                    core.generations[target].dd.charge(survived[h][g]);
                }
            }
        }

        // Dynamic data and budgets.
        let tuner = self.tuner.lock();
        for (h, heap) in self.heaps.iter().enumerate() {
            let mut core = heap.core.lock();
            for g in 0..NUM_GENERATIONS {
                let condemned = g <= settings.condemned_generation
                    || (settings.condemn_uoh && is_uoh_generation(g));
                if !condemned {
                    continue;
                }
                let generation = &mut core.generations[g];
                generation.dd.begin_data_size = begin.per_heap[h][g];
                generation.dd.survived_size = survived[h][g];
                generation.dd.pinned_survived_size = pinned[h][g];
                generation.dd.promoted_size = survived[h][g];
                generation.dd.fragmentation = generation.free_space();
                generation.dd.current_size =
                    generation.allocated_size().saturating_sub(generation.free_space());
                generation.dd.last_collection_at = Some(crate::platform::now());
                tuner.update_generation(&mut generation.dd, g);
            }
        }
        drop(tuner);

        if settings.condemned_generation == MAX_SOH_GENERATION {
            // Aggregate gen2 view for provisional-mode detection.
            let mut dd2 = crate::heap::generation::DynamicData::new(0);
            for heap in &self.heaps {
                let core = heap.core.lock();
                let d = &core.generations[MAX_SOH_GENERATION].dd;
                dd2.current_size += d.current_size;
                dd2.fragmentation += d.fragmentation;
                dd2.survived_size += d.survived_size;
                dd2.pinned_survived_size += d.pinned_survived_size;
            }
            self.tuner.lock().observe_gen2(settings.compacting, &dd2);

            // `Once` LOH compaction consumes itself.
            let mut mode = self.loh_mode.lock();
            if settings.loh_compacting && *mode == LohCompactionMode::Once {
                *mode = LohCompactionMode::Default;
            }
        }

        // Size-ref handles report bytes the tuner treats as part of the
        // old-generation live size.
        let size_ref_bytes: usize = marker.take_size_refs().into_iter().sum();
        if size_ref_bytes > 0 {
            let mut core = self.heaps[0].core.lock();
            core.generations[MAX_SOH_GENERATION].dd.current_size += size_ref_bytes;
        }

        // Pins established by this mark are released; the next mark
        // re-establishes them from the live pinned handles.
        for obj in marker.take_pinned() {
            unsafe {
                crate::object::object_header(obj).clear_pinned();
            }
        }

        // Handle ages and finalization partitions follow the new
        // generation numbers.
        let shared = self.shared.clone();
        let gen_of = move |obj: usize| {
            shared
                .region_map
                .region_of(obj)
                .map(|r| r.generation())
                .unwrap_or(MAX_SOH_GENERATION)
        };
        for table in self.handles.tables() {
            table.update_ages(&gen_of);
        }
        self.finalize.update_generations(&gen_of);

        // Gradual decommit: one step per collection.
        const DECOMMIT_STEP: usize = 256 * 1024;
        for heap in &self.heaps {
            let core = heap.core.lock();
            for gen in &core.generations {
                if let Some(tail) = gen.tail_region() {
                    let _ = self.shared.decommit_step(tail, DECOMMIT_STEP);
                }
            }
        }

        self.shared.cards.refresh_bundles();
        Ok(())
    }
}
