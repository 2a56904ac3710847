//! Injected diagnostic sink.
//!
//! The reactor reports recoverable, per-connection events here instead of
//! logging through process-global state. The sink is handed to the reactor
//! at construction; implementations decide severity and destination.

use std::io;
use std::net::SocketAddr;

/// A recoverable event observed by the reactor.
///
/// None of these are fatal: the poll loop continues after every one.
#[derive(Debug)]
pub enum Diagnostic {
    /// A ready key vanished between wakeup and inspection — the normal
    /// result of a handler closing its own channel concurrently.
    CancelledKey { token: usize },
    /// A fresh connection vanished before its registration completed.
    RegistrationRaced { token: usize },
    /// One accept iteration failed; the listener stays armed.
    AcceptFailed { error: io::Error },
    /// The connect step could not be finished; the connection is dropped.
    ConnectFailed { peer: SocketAddr, error: io::Error },
    /// The worker pool refused an action. The connection's callback will
    /// never run; nothing is retried.
    SubmissionRejected { token: usize },
    /// Deregistering a channel failed (usually because it already closed).
    DeregisterFailed { token: usize, error: io::Error },
}

/// Receives reactor diagnostics.
///
/// **Contract:** `report()` must not block; it is called from the polling
/// thread.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, event: Diagnostic);
}

/// Discards every event. Placeholder for embedders that do their own
/// accounting, and the default in tests.
#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&self, _event: Diagnostic) {}
}
