//! GC Facade - Collector Lifecycle and Mutator Entry Points
//!
//! [`GarbageCollector`] wires the subsystems together: the shared
//! memory resources, the heap table, the slow-path allocator, the
//! handle store, the finalization queue, the blocking pipeline, the
//! background collector and the server runtime. Mutators allocate
//! through it, create handles through it, and trigger collections
//! through it.

use crate::alloc::{AllocContext, AllocFlags, Allocator, MoreSpace};
use crate::background::{BackgroundCollector, BgcState};
use crate::barrier::{self, BarrierGlobals, HeapType};
use crate::collect::{GcCore, GcMechanisms, GcReason};
use crate::config::{GcConfig, HeapVerifyLevel};
use crate::ee::ExecutionEnv;
use crate::error::{GcError, ObjectHeap, Result};
use crate::finalize::{FinalizeQueue, FinalizerThread};
use crate::handles::{table::HandleType, Handle, HandleStore};
use crate::heap::{Heap, SharedHeap, MAX_SOH_GENERATION};
use crate::logging::{EventLog, GcEvent};
use crate::object::{self, MethodTable};
use crate::stats::GcStats;
use crate::tuning::Tuner;
use crate::util::align_up;
use crate::util::constants::DATA_ALIGNMENT;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// An active no-GC region.
struct NoGcRegion {
    remaining: isize,
}

/// The collector.
pub struct GarbageCollector {
    core: Arc<GcCore>,
    bgc: Arc<BackgroundCollector>,
    finalizer: FinalizerThread,
    events: Arc<EventLog>,
    no_gc: Mutex<Option<NoGcRegion>>,
}

impl GarbageCollector {
    /// Initialize the collector.
    ///
    /// Validates the configuration, reserves the heap range, builds the
    /// heap table, publishes the write-barrier globals and spawns the
    /// finalizer (and, when configured, background and server) threads.
    pub fn new(config: GcConfig, env: Arc<dyn ExecutionEnv>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let shared = Arc::new(SharedHeap::new(config.clone())?);
        let n_heaps = config.effective_heap_count();
        let heaps: Vec<Arc<Heap>> = (0..n_heaps)
            .map(|i| Arc::new(Heap::new(i, &config)))
            .collect();
        let handles = Arc::new(HandleStore::new(shared.clone(), n_heaps, config.retain_vm));
        let finalize = Arc::new(FinalizeQueue::new());
        let allocator = Allocator::new(shared.clone(), config.clone());
        let stats = Arc::new(GcStats::new());

        let server = if config.server_gc && n_heaps > 1 {
            Some(crate::server::ServerRuntime::new(shared.clone(), n_heaps)?)
        } else {
            None
        };

        let heap_type = if config.server_gc {
            HeapType::Server
        } else {
            HeapType::Workstation
        };
        barrier::publish_globals(BarrierGlobals {
            card_words: shared.cards.card_words_ptr(),
            bundle_words: shared.cards.bundle_words_ptr(),
            lowest_address: shared.lowest_address(),
            highest_address: shared.highest_address(),
            write_watch: &shared.write_watch as *const _,
            heap_type,
        });
        barrier::set_shadow_enabled(config.heap_verify_level >= HeapVerifyLevel::Full);

        let core = Arc::new(GcCore {
            tuner: Mutex::new(Tuner::new(config.clone())),
            gc_lock: Mutex::new(()),
            loh_mode: Mutex::new(config.loh_compaction_mode),
            gc_count: Default::default(),
            last_settings: Mutex::new(None),
            server,
            config,
            shared,
            heaps,
            env: env.clone(),
            handles,
            finalize: finalize.clone(),
            allocator,
            stats,
        });

        let bgc = BackgroundCollector::new(core.clone());
        if core.config.concurrent_gc {
            bgc.start()?;
        }

        let finalizer = FinalizerThread::new(finalize);
        finalizer.start(env)?;

        log::info!(
            "collector initialized: {:?}, {} heap(s), region size {}",
            heap_type,
            core.heaps.len(),
            core.config.regions_size
        );

        Ok(Self {
            core,
            bgc,
            finalizer,
            events: Arc::new(EventLog::new()),
            no_gc: Mutex::new(None),
        })
    }

    // ---- Allocation ----

    /// Allocate an instance of `mt` through `ctx`.
    pub fn allocate(
        &self,
        ctx: &mut AllocContext,
        mt: &'static MethodTable,
        flags: AllocFlags,
    ) -> Result<usize> {
        debug_assert_eq!(mt.component_size, 0);
        self.allocate_sized(ctx, mt, None, flags)
    }

    /// Allocate an array of `len` components of `mt`.
    pub fn allocate_array(
        &self,
        ctx: &mut AllocContext,
        mt: &'static MethodTable,
        len: usize,
        flags: AllocFlags,
    ) -> Result<usize> {
        debug_assert!(mt.component_size > 0);
        self.allocate_sized(ctx, mt, Some(len), flags)
    }

    fn allocate_sized(
        &self,
        ctx: &mut AllocContext,
        mt: &'static MethodTable,
        len: Option<usize>,
        flags: AllocFlags,
    ) -> Result<usize> {
        let size = align_up(
            mt.base_size + len.unwrap_or(0) * mt.component_size,
            DATA_ALIGNMENT,
        );
        let gen = self.core.allocator.target_generation(size, flags);

        // A no-GC region consumes its budget instead of collecting.
        if let Some(region) = self.no_gc.lock().as_mut() {
            region.remaining -= size as isize;
        }

        let obj = if gen == 0 {
            self.allocate_soh(ctx, size)?
        } else {
            self.allocate_on_uoh(ctx, gen, size)?
        };

        unsafe {
            object::set_method_table(obj, mt);
            if let Some(len) = len {
                object::set_array_length(obj, len);
            }
        }

        if mt.finalizable || flags.contains(AllocFlags::FINALIZE) {
            self.core.finalize.register(obj, false);
            unsafe {
                object::object_header(obj).set_finalize_registered();
            }
        }
        Ok(obj)
    }

    fn allocate_soh(&self, ctx: &mut AllocContext, size: usize) -> Result<usize> {
        let mut hard_limit_retried = false;
        for _attempt in 0..8 {
            if let Some(obj) = ctx.try_alloc(size) {
                return Ok(obj);
            }
            if self.core.heaps.len() > 1 {
                crate::server::balance_heaps(&self.core.heaps, ctx);
            }
            let in_no_gc = self.no_gc.lock().is_some();
            let heap = &self.core.heaps[ctx.alloc_heap.min(self.core.heaps.len() - 1)];
            match self
                .core
                .allocator
                .allocate_more_space_soh(heap, ctx, size, in_no_gc)
            {
                Ok(MoreSpace::Fitted) => continue,
                Ok(MoreSpace::NeedGc(gen)) => {
                    // Seal the caller's context: its range must be a
                    // free object before the heap is walked.
                    unsafe { ctx.fix() };
                    if let Err(e) = self.trigger_gc(gen, GcReason::AllocSoh) {
                        // Deferred inside a no-GC region: keep allocating.
                        if !matches!(e, GcError::NoGcRegion(_)) {
                            return Err(e);
                        }
                    }
                }
                Ok(MoreSpace::FittedUoh(_)) => unreachable!("SOH path returned a UOH fit"),
                Err(GcError::HardLimitExceeded { .. }) if !hard_limit_retried => {
                    // One full compacting collection before giving up.
                    hard_limit_retried = true;
                    unsafe { ctx.fix() };
                    self.trigger_gc(MAX_SOH_GENERATION, GcReason::HardLimit)?;
                }
                Err(e) => return Err(self.report_oom(e, size, ObjectHeap::Soh)),
            }
        }
        Err(self.report_oom(
            GcError::OomCommit {
                size,
                oh: ObjectHeap::Soh,
                available: crate::platform::memory_status().available_physical,
            },
            size,
            ObjectHeap::Soh,
        ))
    }

    fn allocate_on_uoh(&self, ctx: &mut AllocContext, gen: usize, size: usize) -> Result<usize> {
        let oh = if gen == crate::heap::POH_GENERATION {
            ObjectHeap::Poh
        } else {
            ObjectHeap::Loh
        };
        let mut hard_limit_retried = false;
        for _attempt in 0..8 {
            // Mutators allocating into LOH/POH during background mark
            // sleep proportionally to how much the UOH has grown.
            self.bgc.throttle_uoh_allocation();

            let in_no_gc = self.no_gc.lock().is_some();
            let heap = &self.core.heaps[ctx.alloc_heap.min(self.core.heaps.len() - 1)];
            match self.core.allocator.allocate_uoh(heap, gen, size, in_no_gc) {
                Ok(MoreSpace::FittedUoh(obj)) => {
                    ctx.alloc_bytes_uoh += size as u64;
                    return Ok(obj);
                }
                Ok(MoreSpace::NeedGc(g)) => {
                    unsafe { ctx.fix() };
                    if let Err(e) = self.trigger_gc(g, GcReason::AllocUoh) {
                        if !matches!(e, GcError::NoGcRegion(_)) {
                            return Err(e);
                        }
                    }
                }
                Ok(MoreSpace::Fitted) => unreachable!("UOH path refilled a context"),
                Err(GcError::HardLimitExceeded { .. }) if !hard_limit_retried => {
                    hard_limit_retried = true;
                    unsafe { ctx.fix() };
                    self.trigger_gc(MAX_SOH_GENERATION, GcReason::HardLimit)?;
                }
                Err(e) => return Err(self.report_oom(e, size, oh)),
            }
        }
        Err(self.report_oom(
            GcError::OomCommit {
                size,
                oh,
                available: crate::platform::memory_status().available_physical,
            },
            size,
            oh,
        ))
    }

    fn report_oom(&self, err: GcError, size: usize, oh: ObjectHeap) -> GcError {
        let available = crate::platform::memory_status().available_physical;
        self.core.stats.record_alloc_failure(size, oh, available);
        self.events.record(GcEvent::AllocationFailure {
            size,
            oh: oh.to_string(),
        });
        err
    }

    // ---- Collection ----

    /// Explicit collection request from the host.
    pub fn collect(&self, generation: usize) -> Result<GcMechanisms> {
        self.trigger_gc(generation, GcReason::Induced)
    }

    /// Explicitly start a background collection: a foreground gen1
    /// initializes it, then the BGC thread takes over marking while
    /// mutators run.
    pub fn collect_background(&self) -> Result<()> {
        if !self.core.config.concurrent_gc {
            return Err(GcError::Configuration(
                "background collection is disabled".to_string(),
            ));
        }
        if self.bgc.in_progress() {
            return Ok(());
        }
        let _bgc_pause = self.bgc.pause_for_foreground();
        self.core.blocking_collection(1, GcReason::Induced)?;
        self.core.env.suspend_ee();
        self.bgc.initialize();
        self.core.env.restart_ee();
        Ok(())
    }

    /// Collection trigger shared by allocation and the host API.
    fn trigger_gc(&self, requested: usize, reason: GcReason) -> Result<GcMechanisms> {
        // A no-GC region defers collections until its budget runs dry.
        {
            let mut no_gc = self.no_gc.lock();
            if let Some(region) = no_gc.as_ref() {
                if region.remaining > 0 {
                    return Err(GcError::NoGcRegion(
                        "collection deferred inside no-GC region".to_string(),
                    ));
                }
                // Budget exhausted: the region ends and the GC runs.
                *no_gc = None;
                self.events.record(GcEvent::NoGcRegion {
                    active: false,
                    budget: 0,
                });
                log::warn!("no-GC region budget exhausted; collecting");
            }
        }

        // Sustained-low-latency hosts get a background gen2 even for
        // induced requests; hard-limit collections are always blocking.
        let induced_ok = reason != GcReason::Induced
            || self.core.config.latency_mode == crate::config::LatencyMode::SustainedLowLatency;
        let start_bgc = requested >= MAX_SOH_GENERATION
            && self.core.config.concurrent_gc
            && !self.core.tuner.lock().provisional_mode()
            && !self.bgc.in_progress()
            && reason != GcReason::HardLimit
            && reason != GcReason::Shutdown
            && induced_ok;

        // Hold the background collector at a phase boundary for the
        // whole blocking portion.
        let _bgc_pause = self.bgc.pause_for_foreground();

        // A blocking gen2 cannot run while a BGC owns gen2; degrade to
        // an ephemeral collection (the BGC will take care of gen2).
        let mut requested = requested;
        if self.bgc.in_progress() && requested >= MAX_SOH_GENERATION {
            requested = 1;
        }

        let number = self.core.gc_count.load(Ordering::Relaxed);
        self.events.record(GcEvent::CycleStart {
            number,
            generation: requested,
            reason: format!("{:?}", reason),
        });

        let settings = if start_bgc {
            // A foreground gen1 initializes the background collection.
            let mut settings = self.core.blocking_collection(1, reason)?;
            self.core.env.suspend_ee();
            self.bgc.initialize();
            self.core.env.restart_ee();
            settings.background = true;
            settings
        } else {
            self.core.blocking_collection(requested, reason)?
        };

        self.events.record(GcEvent::CycleEnd {
            number,
            generation: settings.condemned_generation,
            duration_us: 0,
            compacting: settings.compacting,
        });

        // Provisional mode: a gen1 that needs gen2 growth is followed
        // by a synchronous compacting gen2 without restarting the EE in
        // between (the pipeline restarts internally; the mutator never
        // gets to allocate in between because we still hold the GC
        // trigger).
        if settings.condemned_generation == 1 && self.core.tuner.lock().provisional_mode() {
            let gen2_exhausted = self.core.heaps.iter().any(|h| {
                h.core.lock().generations[MAX_SOH_GENERATION]
                    .dd
                    .budget_exhausted()
            });
            if gen2_exhausted {
                log::info!("provisional mode: immediate compacting gen2 after gen1");
                return self
                    .core
                    .blocking_collection(MAX_SOH_GENERATION, GcReason::MemoryPressure);
            }
        }

        Ok(settings)
    }

    // ---- No-GC region ----

    /// Defer collections while up to `budget` bytes are allocated.
    pub fn try_begin_no_gc_region(&self, budget: usize) -> Result<()> {
        if budget == 0 || budget > self.core.config.regions_range / 2 {
            return Err(GcError::NoGcRegion(format!(
                "no-GC region budget {} out of range",
                budget
            )));
        }
        let mut no_gc = self.no_gc.lock();
        if no_gc.is_some() {
            return Err(GcError::NoGcRegion("no-GC region already active".to_string()));
        }
        drop(no_gc);

        // Make room first so the region has its budget available.
        self.trigger_gc(1, GcReason::Induced)?;

        *self.no_gc.lock() = Some(NoGcRegion {
            remaining: budget as isize,
        });
        self.events.record(GcEvent::NoGcRegion {
            active: true,
            budget,
        });
        Ok(())
    }

    /// End the active no-GC region.
    pub fn end_no_gc_region(&self) -> Result<()> {
        let was = self.no_gc.lock().take();
        match was {
            Some(region) => {
                self.events.record(GcEvent::NoGcRegion {
                    active: false,
                    budget: 0,
                });
                if region.remaining <= 0 {
                    let _ = self.trigger_gc(0, GcReason::NoGcRegionEnd);
                }
                Ok(())
            }
            None => Err(GcError::NoGcRegion("no active no-GC region".to_string())),
        }
    }

    // ---- Handles ----

    pub fn create_handle(&self, ty: HandleType, obj: usize) -> Result<Handle> {
        self.core.handles.create(ty, obj)
    }

    pub fn create_handle_with_extra(
        &self,
        ty: HandleType,
        obj: usize,
        extra: usize,
    ) -> Result<Handle> {
        self.core.handles.create_with_extra(ty, obj, extra)
    }

    pub fn create_dependent_handle(&self, primary: usize, secondary: usize) -> Result<Handle> {
        self.core
            .handles
            .create_with_extra(HandleType::Dependent, primary, secondary)
    }

    pub fn destroy_handle(&self, handle: Handle, ty: HandleType) -> Result<()> {
        self.core.handles.destroy(handle, ty)
    }

    pub fn handle_fetch(&self, handle: Handle) -> usize {
        self.core.handles.fetch(handle)
    }

    pub fn handle_assign(&self, handle: Handle, obj: usize) -> Result<()> {
        self.core.handles.assign(handle, obj)
    }

    pub fn handle_compare_exchange(
        &self,
        handle: Handle,
        new: usize,
        compare: usize,
    ) -> Result<usize> {
        self.core.handles.compare_exchange(handle, new, compare)
    }

    pub fn set_dependent_secondary(&self, handle: Handle, secondary: usize) -> Result<()> {
        self.core.handles.set_dependent_secondary(handle, secondary)
    }

    // ---- Finalization ----

    /// Register an already-allocated object for finalization.
    pub fn register_for_finalization(&self, obj: usize, critical: bool) {
        self.core.finalize.register(obj, critical);
        unsafe {
            object::object_header(obj).set_finalize_registered();
        }
    }

    /// Remove an object from the finalization queue.
    pub fn suppress_finalization(&self, obj: usize) -> bool {
        let removed = self.core.finalize.suppress(obj);
        if removed {
            unsafe {
                object::object_header(obj).clear_finalize_registered();
            }
        }
        removed
    }

    /// Run pending finalizers on the calling thread (tests, shutdown).
    pub fn run_finalizers(&self) {
        self.finalizer.drain_now(self.core.env.as_ref());
    }

    /// Objects waiting for their finalizer.
    pub fn pending_finalizer_count(&self) -> usize {
        self.core.finalize.ready_count()
    }

    // ---- Introspection ----

    pub fn stats(&self) -> Arc<GcStats> {
        self.core.stats.clone()
    }

    pub fn events(&self) -> Arc<EventLog> {
        self.events.clone()
    }

    pub fn background_state(&self) -> BgcState {
        self.bgc.state()
    }

    /// Background collections completed so far.
    pub fn background_count(&self) -> u64 {
        self.bgc.bgc_count.load(Ordering::Relaxed)
    }

    /// Wait until no background collection is in flight.
    pub fn wait_for_background(&self) {
        while self.bgc.in_progress() {
            std::thread::yield_now();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub fn last_settings(&self) -> Option<GcMechanisms> {
        *self.core.last_settings.lock()
    }

    /// Collections that condemned `generation`.
    pub fn collection_count(&self, generation: usize) -> u64 {
        self.core.stats.collection_count(generation)
    }

    /// Heap bounds published to the barrier.
    pub fn heap_bounds(&self) -> (usize, usize) {
        (
            self.core.shared.lowest_address(),
            self.core.shared.highest_address(),
        )
    }

    /// Direct access to collector internals for advanced embedders and
    /// the test fixtures.
    pub fn core(&self) -> &Arc<GcCore> {
        &self.core
    }

    /// Generation an object currently lives in.
    pub fn generation_of(&self, obj: usize) -> usize {
        self.core.generation_of(obj)
    }

    /// Run the heap verifier now.
    pub fn verify_heap_now(&self) -> Result<()> {
        self.core.env.suspend_ee();
        let result = crate::verify::verify_heap(&self.core, "induced");
        self.core.env.restart_ee();
        result
    }

    /// Diagnostics snapshot in insertion order.
    pub fn diagnostics(&self) -> IndexMap<String, String> {
        let mut map = IndexMap::new();
        map.insert(
            "heap_type".to_string(),
            format!("{:?}", barrier::heap_type()),
        );
        map.insert("heaps".to_string(), self.core.heaps.len().to_string());
        map.insert(
            "gc_count".to_string(),
            self.core.gc_count.load(Ordering::Relaxed).to_string(),
        );
        map.insert(
            "bgc_state".to_string(),
            format!("{:?}", self.bgc.state()),
        );
        map.insert(
            "committed_bytes".to_string(),
            self.core.shared.committed_total().to_string(),
        );
        map.insert(
            "free_va_bytes".to_string(),
            self.core.shared.region_allocator.get_free_va().to_string(),
        );
        map.insert(
            "va_load_percent".to_string(),
            self.core
                .shared
                .region_allocator
                .va_memory_load_percent()
                .to_string(),
        );
        if let Some(settings) = self.last_settings() {
            map.insert("last_gc".to_string(), format!("{:?}", settings));
        }
        map
    }

    /// Stop the collector threads. Runs a final collection first.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.trigger_gc(MAX_SOH_GENERATION, GcReason::Shutdown);
        self.bgc.stop();
        self.finalizer.stop();
        Ok(())
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.bgc.stop();
        self.finalizer.stop();
    }
}
