//! Worker pool abstraction.
//!
//! All per-connection application logic runs here, so the polling thread
//! only ever classifies readiness and hands off.
//!
//! # Implementors
//!
//! - `FixedPool` (spindle-pool, default): spawns N OS threads at creation
//!   time over a bounded lock-free queue.
//! - `InlinePool` (spindle-pool, testing): executes synchronously in the
//!   caller. Only for unit tests — it would block the polling thread.

use crate::error::Result;

/// A unit of application work handed off by the reactor.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Executes reactor callbacks on a pool of threads.
///
/// **Contract:**
/// - `submit()` must NEVER block the caller. If the pool is saturated or
///   shut down it returns `Err(Error::SubmissionRejected)`.
/// - Actions may block (that's the whole point).
/// - Submission is fire-and-forget; the reactor never retries a rejected
///   action.
pub trait TaskPool: Send + Sync {
    /// Enqueue an action for execution on a worker thread.
    ///
    /// Returns immediately. The action runs at some later point on one of
    /// the pool's threads.
    fn submit(&self, action: Action) -> Result<()>;

    /// Number of workers currently executing an action (busy count).
    fn active_workers(&self) -> usize;

    /// Total number of workers (busy + idle).
    fn total_workers(&self) -> usize;

    /// Stop accepting work and wind the workers down.
    fn shutdown(&self);
}
