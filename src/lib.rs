//! # RGC - Generational Region-Based Garbage Collector
//!
//! RGC is the engine of a tracing, generational, mostly-concurrent,
//! optionally-parallel garbage collector for a managed runtime. The
//! mutator allocates through per-thread bump-pointer contexts; the
//! collector reclaims unreachable objects, compacts fragmented regions
//! and preserves a consistent heap view in the presence of concurrent
//! mutation.
//!
//! ## Overview
//!
//! - **Generational heap**: three small-object generations (0 youngest)
//!   plus the large and pinned object heaps, backed by regions carved
//!   out of one large VA reservation.
//! - **Remembered set**: a card table with a bundle layer, maintained
//!   by the mutator write barrier.
//! - **Blocking collections**: mark → plan → relocate → compact (or
//!   sweep), with pinned plugs anchoring compaction.
//! - **Background collection**: concurrent mark with write-watch
//!   revisits and a concurrent sweep onto doubly-linked free lists,
//!   overlapping mutation; ephemeral foreground collections interleave.
//! - **Parallel server configuration**: one collector thread per heap,
//!   work-stealing mark stacks, card-chunk stealing, heap balancing.
//! - **Handle table**: segmented, typed, rooted references (strong,
//!   weak-short/long, pinned, dependent, ref-counted, size-ref) with
//!   lock-free cache banks.
//! - **Finalization**: a partitioned queue with
//!   reachable-through-finalizers re-promotion and a finalizer thread.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rgc::{AllocContext, AllocFlags, GarbageCollector, GcConfig, MethodTable};
//! use std::sync::Arc;
//!
//! # struct MyEnv;
//! # impl rgc::ExecutionEnv for MyEnv {
//! #     fn suspend_ee(&self) {}
//! #     fn restart_ee(&self) {}
//! #     fn enumerate_roots(&self, _f: &mut dyn FnMut(usize)) {}
//! #     fn enumerate_alloc_contexts(&self, _f: &mut dyn FnMut(&mut AllocContext)) {}
//! #     fn invoke_finalizer(&self, _obj: usize) {}
//! # }
//! # fn mt() -> &'static MethodTable { Box::leak(Box::new(MethodTable::plain(2, vec![], "demo"))) }
//! fn main() -> rgc::Result<()> {
//!     let gc = GarbageCollector::new(GcConfig::default(), Arc::new(MyEnv))?;
//!     let mut ctx = AllocContext::default();
//!     let obj = gc.allocate(&mut ctx, mt(), AllocFlags::NONE)?;
//!     assert_ne!(obj, 0);
//!     gc.collect(0)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`alloc`]: allocation contexts, free lists, the slow path
//! - [`background`]: the concurrent collection state machine
//! - [`barrier`]: the card-marking write barrier and its globals
//! - [`collect`]: the blocking mark/plan/relocate/compact pipeline
//! - [`config`]: configuration and validation
//! - [`ee`]: the execution-environment boundary
//! - [`finalize`]: the finalization queue and finalizer thread
//! - [`handles`]: the handle table
//! - [`heap`]: regions, the region allocator, card/brick/mark tables
//! - [`object`]: the object model (header, method table, refmap)
//! - [`platform`]: the OS shim
//! - [`server`]: joins, parallel mark, heap balancing
//! - [`stats`], [`logging`]: counters, pause histogram, event ring
//! - [`tuning`]: budgets, elevation, provisional mode, PID FL tuning
//! - [`verify`]: the post-GC heap verifier

pub mod alloc;
pub mod background;
pub mod barrier;
pub mod collect;
pub mod config;
pub mod ee;
pub mod error;
pub mod finalize;
pub mod gc;
pub mod handles;
pub mod heap;
pub mod logging;
pub mod object;
pub mod platform;
pub mod server;
pub mod stats;
pub mod tuning;
pub mod util;
pub mod verify;

pub use alloc::{AllocContext, AllocFlags};
pub use config::{GcConfig, HeapVerifyLevel, LatencyMode, LohCompactionMode};
pub use ee::ExecutionEnv;
pub use error::{GcError, ObjectHeap, Result};
pub use gc::GarbageCollector;
pub use handles::{table::HandleType, Handle};
pub use object::{MethodTable, FREE_OBJECT_MT};

/// RGC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }
}
