//! Execution Environment Boundary
//!
//! Everything the collector needs from the surrounding runtime. The
//! embedder implements [`ExecutionEnv`]; the collector calls it for
//! stop-the-world gating, root enumeration, allocation-context
//! enumeration and finalizer invocation. Object layout stays inside the
//! collector (the method table is this crate's type descriptor).

use crate::alloc::AllocContext;

/// Services provided by the execution environment.
///
/// All methods may be called from collector threads; implementations
/// must be `Send + Sync`.
pub trait ExecutionEnv: Send + Sync {
    /// Bring every mutator to a safe point and keep it there. On
    /// return, all mutator stacks and allocation contexts are stable.
    fn suspend_ee(&self);

    /// Release mutators from the stop-the-world gate.
    fn restart_ee(&self);

    /// Invoke `f` with the address of every root slot (a `usize`
    /// location holding an object reference or 0). The collector reads
    /// the slot for marking and may write it during relocation.
    fn enumerate_roots(&self, f: &mut dyn FnMut(usize));

    /// Invoke `f` with every mutator allocation context so the
    /// collector can fix and refill them.
    fn enumerate_alloc_contexts(&self, f: &mut dyn FnMut(&mut AllocContext));

    /// Run a finalizer. Called on the finalizer thread, outside of GC.
    fn invoke_finalizer(&self, obj: usize);

    /// Report a non-fatal collector error.
    fn log_error(&self, msg: &str) {
        log::error!("{}", msg);
    }

    /// Irrecoverable corruption: the process must not continue running
    /// managed code. Implementations typically abort.
    fn handle_fatal_error(&self, msg: &str) -> ! {
        log::error!("fatal GC error: {}", msg);
        std::process::abort();
    }
}
