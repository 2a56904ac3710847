//! Connection establishment token.
//!
//! An outbound connect can finish inside the initiating call (loopback
//! targets often do) or later, driven by the poll loop. Both paths complete
//! the same token, so callers observe "connected" through one mechanism
//! regardless of which path fired it.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A one-shot gate that flips from pending to complete exactly once.
///
/// Cloning yields another handle to the same gate. `complete()` is
/// idempotent.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

struct Inner {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                done: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Mark the gate complete and wake every waiter.
    pub fn complete(&self) {
        let mut done = self.inner.done.lock().expect("completion lock poisoned");
        if !*done {
            *done = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.done.lock().expect("completion lock poisoned")
    }

    /// Block until the gate completes.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().expect("completion lock poisoned");
        while !*done {
            done = self
                .inner
                .cond
                .wait(done)
                .expect("completion lock poisoned");
        }
    }

    /// Block until the gate completes or the timeout elapses.
    ///
    /// Returns `true` if the gate completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock().expect("completion lock poisoned");
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(done, deadline - now)
                .expect("completion lock poisoned");
            done = guard;
        }
        true
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
