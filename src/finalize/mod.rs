//! Finalization Queue
//!
//! A bounded-array priority structure partitioned by fill pointers:
//!
//! ```text
//! │ gen0 │ gen1 │ gen2 │ critical │ ready-to-run │
//!        fill0  fill1  fill2     fillCrit       fillReady
//! ```
//!
//! Registration appends to the gen-0 partition (critical finalizers go
//! to the critical partition). During mark, after weak-short clearing
//! and before weak-long clearing, unreachable finalizable objects move
//! to the ready partition and are re-promoted, together with everything
//! they reach. A finalizer thread drains the ready partition outside of
//! GC.

use crate::ee::ExecutionEnv;
use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Partition indices.
const PART_GEN0: usize = 0;
const PART_GEN2: usize = 2;
const PART_CRITICAL: usize = 3;
const PART_READY: usize = 4;
const NUM_PARTS: usize = 5;

struct QueueInner {
    slots: Vec<usize>,
    /// `fill[i]` = one-past-last index of partition `i`.
    fill: [usize; NUM_PARTS],
}

impl QueueInner {
    fn part_start(&self, part: usize) -> usize {
        if part == 0 {
            0
        } else {
            self.fill[part - 1]
        }
    }

    /// Insert `obj` at the end of `part`, displacing one boundary
    /// element per later partition.
    fn insert(&mut self, part: usize, obj: usize) {
        self.slots.push(0);
        let mut hole = self.slots.len() - 1;
        for j in ((part + 1)..NUM_PARTS).rev() {
            let first = self.fill[j - 1];
            self.slots[hole] = self.slots[first];
            hole = first;
        }
        self.slots[hole] = obj;
        for f in &mut self.fill[part..] {
            *f += 1;
        }
    }

    /// Move the element at `idx` (in `part`) one partition up. Returns
    /// its new index.
    fn shift_up(&mut self, part: usize, idx: usize) -> usize {
        debug_assert!(idx >= self.part_start(part) && idx < self.fill[part]);
        let last = self.fill[part] - 1;
        self.slots.swap(idx, last);
        self.fill[part] -= 1;
        last
    }

    /// Move the element at `idx` (in `part`) to the ready partition.
    fn move_to_ready(&mut self, part: usize, idx: usize) {
        let mut idx = idx;
        for j in part..PART_READY {
            idx = self.shift_up(j, idx);
        }
    }

    /// Remove the element at `idx` in `part` entirely.
    fn remove_at(&mut self, part: usize, idx: usize) {
        self.move_to_ready(part, idx);
        // It is now the first element of the ready partition; rotate it
        // to the end and pop.
        let start = self.part_start(PART_READY);
        let last = self.slots.len() - 1;
        self.slots.swap(start, last);
        self.slots.pop();
        self.fill[PART_READY] -= 1;
    }
}

/// The finalization queue.
pub struct FinalizeQueue {
    inner: Mutex<QueueInner>,
    wake: Condvar,
}

impl FinalizeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                slots: Vec::new(),
                fill: [0; NUM_PARTS],
            }),
            wake: Condvar::new(),
        }
    }

    /// Register a finalizable object at allocation time.
    pub fn register(&self, obj: usize, critical: bool) {
        let mut inner = self.inner.lock();
        let part = if critical { PART_CRITICAL } else { PART_GEN0 };
        inner.insert(part, obj);
    }

    /// Drop an object from the queue (finalizer suppression). Returns
    /// true if it was present outside the ready partition.
    pub fn suppress(&self, obj: usize) -> bool {
        let mut inner = self.inner.lock();
        for part in PART_GEN0..=PART_CRITICAL {
            let start = inner.part_start(part);
            let end = inner.fill[part];
            if let Some(idx) = (start..end).find(|&i| inner.slots[i] == obj) {
                inner.remove_at(part, idx);
                return true;
            }
        }
        false
    }

    /// The finalizer pass of mark: move unreachable finalizable objects
    /// of the condemned generations into the ready partition,
    /// re-promoting each via `promote`. Returns whether any finalizer
    /// was found.
    ///
    /// `gen_of` maps an object to its current generation; `is_marked`
    /// reports reachability as established so far.
    pub fn scan_for_finalization(
        &self,
        condemned: usize,
        gen_of: &dyn Fn(usize) -> usize,
        is_marked: &dyn Fn(usize) -> bool,
        promote: &mut dyn FnMut(usize),
    ) -> bool {
        let mut inner = self.inner.lock();
        let mut found = false;
        // User partitions for the condemned generations, then the
        // critical partition (filtered by generation inside the loop).
        let parts = (PART_GEN0..=condemned.min(PART_GEN2)).chain([PART_CRITICAL]);
        for part in parts {
            let mut i = inner.part_start(part);
            while i < inner.fill[part] {
                let obj = inner.slots[i];
                if gen_of(obj) <= condemned && !is_marked(obj) {
                    inner.move_to_ready(part, i);
                    promote(obj);
                    found = true;
                    // A different element now occupies `i`.
                } else {
                    i += 1;
                }
            }
        }
        if found {
            self.wake.notify_one();
        }
        found
    }

    /// Re-partition survivors after a collection: entries whose object
    /// now lives in an older generation move to the matching partition.
    /// Partitions are visited youngest first, so a gen0→gen2 move
    /// passes through gen1 and is picked up again by the gen1 pass.
    pub fn update_generations(&self, gen_of: &dyn Fn(usize) -> usize) {
        let mut inner = self.inner.lock();
        for part in PART_GEN0..PART_GEN2 {
            let mut i = inner.part_start(part);
            while i < inner.fill[part] {
                let obj = inner.slots[i];
                let gen = gen_of(obj).min(PART_GEN2);
                if gen > part {
                    inner.shift_up(part, i);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Update every stored reference through `relocate` (compaction).
    pub fn relocate(&self, relocate: &mut dyn FnMut(usize) -> usize) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            if *slot != 0 {
                *slot = relocate(*slot);
            }
        }
    }

    /// Visit every queued object as `(obj, is_ready)`.
    pub fn for_each(&self, f: &mut dyn FnMut(usize, bool)) {
        let inner = self.inner.lock();
        let ready_start = inner.part_start(PART_READY);
        for (i, &obj) in inner.slots.iter().enumerate() {
            f(obj, i >= ready_start);
        }
    }

    /// Number of objects awaiting their finalizer.
    pub fn ready_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.fill[PART_READY] - inner.part_start(PART_READY)
    }

    /// Total registered objects.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop one ready-to-run object, if any.
    pub fn take_ready(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        let start = inner.part_start(PART_READY);
        if inner.fill[PART_READY] == start {
            return None;
        }
        let obj = inner.slots.pop();
        inner.fill[PART_READY] -= 1;
        obj
    }

    /// Block until woken or `timeout`, then report the ready count.
    fn wait_for_work(&self, timeout: std::time::Duration) -> usize {
        let mut inner = self.inner.lock();
        let ready = inner.fill[PART_READY] - inner.part_start(PART_READY);
        if ready > 0 {
            return ready;
        }
        self.wake.wait_for(&mut inner, timeout);
        inner.fill[PART_READY] - inner.part_start(PART_READY)
    }
}

impl Default for FinalizeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The finalizer thread: drains the ready partition outside of GC,
/// invoking finalizers through the execution environment.
pub struct FinalizerThread {
    queue: Arc<FinalizeQueue>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FinalizerThread {
    pub fn new(queue: Arc<FinalizeQueue>) -> Self {
        Self {
            queue,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the drain loop.
    pub fn start(&self, env: Arc<dyn ExecutionEnv>) -> Result<()> {
        self.running.store(true, Ordering::Release);
        let queue = self.queue.clone();
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("gc-finalizer".to_string())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if queue.wait_for_work(std::time::Duration::from_millis(50)) == 0 {
                        continue;
                    }
                    while let Some(obj) = queue.take_ready() {
                        env.invoke_finalizer(obj);
                        // The header flag is cleared so a resurrected
                        // object can re-register explicitly.
                        unsafe {
                            crate::object::object_header(obj).clear_finalize_registered();
                        }
                    }
                }
            })
            .map_err(|e| {
                crate::error::GcError::Internal(format!("failed to spawn finalizer thread: {}", e))
            })?;

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Drain synchronously on the calling thread (tests and shutdown).
    pub fn drain_now(&self, env: &dyn ExecutionEnv) {
        while let Some(obj) = self.queue.take_ready() {
            env.invoke_finalizer(obj);
            unsafe {
                crate::object::object_header(obj).clear_finalize_registered();
            }
        }
    }

    /// Stop the thread and join it.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.queue.wake.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
