//! Shared test fixture: a collector wired to a test execution
//! environment acting as the mutator runtime.
//!
//! The write-barrier globals are process-wide, so fixtures serialize
//! through a global lock: one collector per live fixture.

#![allow(dead_code)]

use lazy_static::lazy_static;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use rgc::{
    AllocContext, AllocFlags, ExecutionEnv, GarbageCollector, GcConfig, HandleType, MethodTable,
};
use std::cell::RefCell;
use std::sync::Arc;

pub const WORD: usize = std::mem::size_of::<usize>();
pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

static FIXTURE_LOCK: Mutex<()> = Mutex::new(());

lazy_static! {
    /// Two payload words; the first is a reference slot.
    pub static ref NODE_MT: MethodTable = MethodTable::plain(2, vec![WORD], "node");

    /// Two scalar payload words, no references.
    pub static ref LEAF_MT: MethodTable = MethodTable::plain(2, vec![], "leaf");

    /// Finalizable leaf.
    pub static ref FINALIZABLE_MT: MethodTable =
        MethodTable::plain(2, vec![], "finalizable").with_finalizer();

    /// Byte array (used for LOH-sized allocations).
    pub static ref BYTES_MT: MethodTable = MethodTable::array(1, false, "byte[]");
}

/// Test execution environment: explicit root slots, a cooperative
/// stop-the-world gate, and a finalization log.
pub struct TestEnv {
    /// Root slots; boxed so their addresses stay stable.
    roots: Mutex<Vec<Box<usize>>>,
    /// Objects whose finalizers ran, in order.
    pub finalized: Mutex<Vec<usize>>,
    /// Serializes suspend/restart pairs between collector threads.
    gate: RawMutex,
}

impl TestEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            roots: Mutex::new(Vec::new()),
            finalized: Mutex::new(Vec::new()),
            gate: RawMutex::INIT,
        })
    }

    /// Add a root referencing `obj`. Returns the root's index.
    pub fn push_root(&self, obj: usize) -> usize {
        let mut roots = self.roots.lock();
        roots.push(Box::new(obj));
        roots.len() - 1
    }

    /// Current value of a root (the GC may have relocated it).
    pub fn root(&self, index: usize) -> usize {
        *self.roots.lock()[index]
    }

    pub fn set_root(&self, index: usize, obj: usize) {
        *self.roots.lock()[index] = obj;
    }

    pub fn clear_roots(&self) {
        self.roots.lock().clear();
    }

    pub fn pop_root(&self) {
        self.roots.lock().pop();
    }

    pub fn finalized_count(&self) -> usize {
        self.finalized.lock().len()
    }
}

impl ExecutionEnv for TestEnv {
    fn suspend_ee(&self) {
        self.gate.lock();
    }

    fn restart_ee(&self) {
        unsafe { self.gate.unlock() };
    }

    fn enumerate_roots(&self, f: &mut dyn FnMut(usize)) {
        for slot in self.roots.lock().iter() {
            f(slot.as_ref() as *const usize as usize);
        }
    }

    fn enumerate_alloc_contexts(&self, _f: &mut dyn FnMut(&mut AllocContext)) {
        // The fixture seals its context before every collection, so
        // there is nothing to fix here.
    }

    fn invoke_finalizer(&self, obj: usize) {
        self.finalized.lock().push(obj);
    }

    fn handle_fatal_error(&self, msg: &str) -> ! {
        panic!("fatal GC error in test: {}", msg);
    }
}

/// A collector plus one mutator context.
pub struct GcFixture {
    pub env: Arc<TestEnv>,
    pub gc: GarbageCollector,
    pub ctx: RefCell<AllocContext>,
    _serial: MutexGuard<'static, ()>,
}

impl GcFixture {
    pub fn new(config: GcConfig) -> Self {
        let serial = FIXTURE_LOCK.lock();
        let env = TestEnv::new();
        let gc = GarbageCollector::new(config, env.clone()).expect("collector init failed");
        Self {
            env,
            gc,
            ctx: RefCell::new(AllocContext::default()),
            _serial: serial,
        }
    }

    /// Workstation, non-concurrent, small gen0 budget.
    pub fn with_defaults() -> Self {
        Self::new(GcConfig {
            concurrent_gc: false,
            regions_range: 256 * MB,
            regions_size: 4 * MB,
            gen0_size: 64 * KB,
            ..Default::default()
        })
    }

    /// Workstation with background collection enabled.
    pub fn concurrent() -> Self {
        Self::new(GcConfig {
            concurrent_gc: true,
            regions_range: 256 * MB,
            regions_size: 4 * MB,
            gen0_size: 64 * KB,
            ..Default::default()
        })
    }

    /// Parallel server configuration.
    pub fn server(heaps: usize) -> Self {
        Self::new(GcConfig {
            server_gc: true,
            heap_count: heaps,
            concurrent_gc: false,
            regions_range: 256 * MB,
            regions_size: 4 * MB,
            gen0_size: 64 * KB,
            ..Default::default()
        })
    }

    /// Allocate a plain object.
    pub fn alloc(&self, mt: &'static MethodTable) -> usize {
        self.gc
            .allocate(&mut self.ctx.borrow_mut(), mt, AllocFlags::NONE)
            .expect("allocation failed")
    }

    pub fn alloc_flags(&self, mt: &'static MethodTable, flags: AllocFlags) -> usize {
        self.gc
            .allocate(&mut self.ctx.borrow_mut(), mt, flags)
            .expect("allocation failed")
    }

    /// Allocate an array of `len` components.
    pub fn alloc_array(&self, mt: &'static MethodTable, len: usize) -> usize {
        self.gc
            .allocate_array(&mut self.ctx.borrow_mut(), mt, len, AllocFlags::NONE)
            .expect("array allocation failed")
    }

    /// Allocate `count` objects, returning their addresses.
    pub fn alloc_many(&self, mt: &'static MethodTable, count: usize) -> Vec<usize> {
        (0..count).map(|_| self.alloc(mt)).collect()
    }

    /// Run a blocking collection of `generation`, sealing the mutator
    /// context first (the fixture's safe point).
    pub fn collect(&self, generation: usize) -> rgc::collect::GcMechanisms {
        unsafe {
            self.ctx.borrow_mut().fix();
        }
        self.gc.collect(generation).expect("collection failed")
    }

    /// Store a reference into a field through the write barrier.
    pub fn write_ref_field(&self, obj: usize, offset: usize, value: usize) {
        unsafe {
            rgc::barrier::write_ref(obj + offset, value);
        }
    }

    /// Read a reference field.
    pub fn read_ref_field(&self, obj: usize, offset: usize) -> usize {
        unsafe { rgc::barrier::read_ref(obj + offset) }
    }

    /// Shorthand for the first field of `NODE_MT` objects.
    pub fn link(&self, parent: usize, child: usize) {
        self.write_ref_field(parent, WORD, child);
    }

    pub fn linked(&self, parent: usize) -> usize {
        self.read_ref_field(parent, WORD)
    }

    pub fn create_handle(&self, ty: HandleType, obj: usize) -> usize {
        self.gc.create_handle(ty, obj).expect("handle create failed")
    }

    pub fn generation_of(&self, obj: usize) -> usize {
        self.gc.generation_of(obj)
    }
}

// ---- Assertion helpers ----

/// Every address unique; duplicates mean the allocator handed out the
/// same memory twice.
pub fn assert_all_addresses_unique(addresses: &[usize], context: &str) {
    let mut seen = std::collections::HashSet::new();
    for &addr in addresses {
        assert!(
            seen.insert(addr),
            "{}: duplicate address {:#x} handed out twice",
            context,
            addr
        );
    }
}

/// Address must be 8-aligned.
pub fn assert_address_aligned(addr: usize, context: &str) {
    assert_eq!(
        addr % 8,
        0,
        "{}: address {:#x} is not 8-byte aligned",
        context,
        addr
    );
}

/// Address must lie inside the collector's published heap bounds.
pub fn assert_address_in_bounds(fixture: &GcFixture, addr: usize, context: &str) {
    let (lo, hi) = fixture.gc.heap_bounds();
    assert!(
        addr >= lo && addr < hi,
        "{}: address {:#x} outside heap bounds [{:#x}, {:#x})",
        context,
        addr,
        lo,
        hi
    );
}
