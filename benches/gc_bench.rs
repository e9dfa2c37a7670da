//! Collector benchmarks: allocation fast path, write barrier, handle
//! churn, and a full blocking collection over a small live set.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lazy_static::lazy_static;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use rgc::{AllocContext, AllocFlags, ExecutionEnv, GarbageCollector, GcConfig, MethodTable};
use std::sync::Arc;

lazy_static! {
    static ref LEAF_MT: MethodTable = MethodTable::plain(2, vec![], "bench-leaf");
}

struct BenchEnv {
    gate: RawMutex,
}

impl ExecutionEnv for BenchEnv {
    fn suspend_ee(&self) {
        self.gate.lock();
    }
    fn restart_ee(&self) {
        unsafe { self.gate.unlock() };
    }
    fn enumerate_roots(&self, _f: &mut dyn FnMut(usize)) {}
    fn enumerate_alloc_contexts(&self, _f: &mut dyn FnMut(&mut AllocContext)) {}
    fn invoke_finalizer(&self, _obj: usize) {}
}

fn collector() -> GarbageCollector {
    let config = GcConfig {
        concurrent_gc: false,
        regions_range: 512 * 1024 * 1024,
        regions_size: 4 * 1024 * 1024,
        gen0_size: 32 * 1024 * 1024,
        ..Default::default()
    };
    GarbageCollector::new(config, Arc::new(BenchEnv { gate: RawMutex::INIT }))
        .expect("collector init")
}

fn bench_allocation(c: &mut Criterion) {
    let gc = collector();
    let mut ctx = AllocContext::default();

    c.bench_function("alloc_32_bytes", |b| {
        b.iter(|| {
            let obj = gc
                .allocate(&mut ctx, &LEAF_MT, AllocFlags::NONE)
                .expect("alloc");
            black_box(obj)
        })
    });
}

fn bench_write_barrier(c: &mut Criterion) {
    let gc = collector();
    let mut ctx = AllocContext::default();
    let a = gc.allocate(&mut ctx, &LEAF_MT, AllocFlags::NONE).unwrap();
    let b_obj = gc.allocate(&mut ctx, &LEAF_MT, AllocFlags::NONE).unwrap();

    c.bench_function("write_barrier_store", |b| {
        b.iter(|| unsafe {
            rgc::barrier::write_ref(black_box(a + 8), black_box(b_obj));
        })
    });
}

fn bench_handle_churn(c: &mut Criterion) {
    let gc = collector();
    let mut ctx = AllocContext::default();
    let obj = gc.allocate(&mut ctx, &LEAF_MT, AllocFlags::NONE).unwrap();

    c.bench_function("handle_create_destroy", |b| {
        b.iter(|| {
            let h = gc.create_handle(rgc::HandleType::Strong, obj).unwrap();
            gc.destroy_handle(black_box(h), rgc::HandleType::Strong).unwrap();
        })
    });
}

fn bench_gen0_collection(c: &mut Criterion) {
    let gc = collector();
    let mut ctx = AllocContext::default();

    c.bench_function("gen0_collection_1000_dead", |b| {
        b.iter(|| {
            for _ in 0..1000 {
                gc.allocate(&mut ctx, &LEAF_MT, AllocFlags::NONE).unwrap();
            }
            unsafe { ctx.fix() };
            gc.collect(0).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_allocation,
    bench_write_barrier,
    bench_handle_churn,
    bench_gen0_collection
);
criterion_main!(benches);
