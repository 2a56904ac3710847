//! # spindle-pool — bounded worker pools for reactor handoff
//!
//! `FixedPool` spawns N OS threads at creation. The reactor pushes actions
//! onto a lock-free MPMC queue; workers pop and run them. No dynamic
//! scaling. `submit` never blocks: a full queue or a stopped pool rejects
//! the action and the caller decides what that means.
//!
//! `InlinePool` runs every action synchronously in the submitting thread.
//! Only for unit tests — submitting from the polling thread would run
//! application code on the reactor thread.

use spindle_core::error::{Error, Result};
use spindle_core::worker::{Action, TaskPool};

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Shared state between submitters and workers.
struct PoolInner {
    /// Work queue: reactor (and anyone else) pushes, workers pop.
    work_queue: ArrayQueue<Action>,
    /// Number of workers currently executing an action.
    active: AtomicUsize,
    /// Shutdown flag.
    shutdown: AtomicBool,
    /// Total worker count.
    total: usize,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FixedPool {
    /// Create a pool with `n` workers.
    ///
    /// `queue_depth`: max pending actions before submit rejects.
    pub fn new(n: usize, queue_depth: usize) -> Self {
        let n = n.clamp(1, 32);
        let inner = Arc::new(PoolInner {
            work_queue: ArrayQueue::new(queue_depth),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            total: n,
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("spindle-worker-{}", worker_id))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        FixedPool {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Default pool sizing: min(8, nproc/2), at least 2.
    pub fn auto_sized(queue_depth: usize) -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let n = (cpus / 2).clamp(2, 8);
        Self::new(n, queue_depth)
    }
}

impl TaskPool for FixedPool {
    fn submit(&self, action: Action) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return Err(Error::SubmissionRejected);
        }
        self.inner
            .work_queue
            .push(action)
            .map_err(|_| Error::SubmissionRejected)
    }

    fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.inner.total
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Workers see the flag within one park interval; joining here keeps
        // shutdown deterministic for callers.
        let mut handles = self.handles.lock().expect("pool handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        // Workers exit on their next pop or park timeout. Call shutdown()
        // explicitly to join them.
    }
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match inner.work_queue.pop() {
            Some(action) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                action();
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                // No work available — brief park to avoid busy-wait.
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}

/// Executes every action synchronously in the submitting thread.
///
/// Only for tests and tools. A shutdown pool rejects like the real one.
#[derive(Debug, Default)]
pub struct InlinePool {
    stopped: AtomicBool,
}

impl InlinePool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskPool for InlinePool {
    fn submit(&self, action: Action) -> Result<()> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(Error::SubmissionRejected);
        }
        action();
        Ok(())
    }

    fn active_workers(&self) -> usize {
        0
    }

    fn total_workers(&self) -> usize {
        0
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
