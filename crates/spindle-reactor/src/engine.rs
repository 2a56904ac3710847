//! # Reactor engine — the readiness poll loop
//!
//! One dedicated OS thread blocks on the multiplexer and routes every
//! ready key through a [`Dispatch`] strategy supplied by the variant
//! (see [`crate::server::ServerReactor`]). Everything the loop shares
//! with other threads lives in [`ReactorShared`]: the registration table,
//! a cloned registry handle for cross-thread (de)registration, and the
//! waker.
//!
//! The registration table is the one piece of state mutated from multiple
//! threads. It sits behind a mutex with short critical sections; the poll
//! thread never holds the lock while running accept, factory, pool, or
//! handler code.

use crate::handler::{Attachment, ChannelHandler, ConnectPending};
use crate::interest::InterestSet;

use spindle_core::diag::{Diagnostic, DiagnosticSink};
use spindle_core::error::{Error, Result};

use mio::event::Source;
use mio::{Events, Poll, Registry, Token, Waker};

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Token reserved for the waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);
/// Token reserved for the listening channel.
pub(crate) const LISTENER_TOKEN: Token = Token(1);
/// First token handed out to connection registrations.
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// Identity of one channel's registration.
///
/// Allocated once per channel and kept by its handler for rearm and
/// cancel calls. Re-registering under the same identity replaces the
/// existing registration; it never duplicates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Registration(Token);

impl Registration {
    pub fn token(&self) -> usize {
        (self.0).0
    }
}

/// Engine configuration.
pub struct ReactorConfig {
    /// Capacity of the per-iteration readiness event buffer.
    pub events_capacity: usize,
    /// Upper bound on one blocking wait. The waker cuts any wait short;
    /// the timeout is a safety heartbeat, not a scheduling mechanism.
    pub poll_timeout: Option<Duration>,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            events_capacity: 1024,
            poll_timeout: Some(Duration::from_secs(60)),
        }
    }
}

struct TableEntry {
    attachment: Attachment,
    interest: InterestSet,
}

/// State shared between the polling thread and everyone else.
pub struct ReactorShared {
    /// Cloned registry handle; safe to use from any thread.
    registry: Registry,
    /// Forces a blocked poll to return. Idempotent.
    waker: Waker,
    /// Registration table: token → attachment + interest.
    table: Mutex<HashMap<Token, TableEntry>>,
    /// Next dynamic token.
    next_token: AtomicUsize,
    /// Set once; registrations fail afterwards.
    shutdown: AtomicBool,
    /// Injected diagnostic sink.
    diag: Arc<dyn DiagnosticSink>,
}

/// Route decision for one ready dynamic token.
pub(crate) enum Routed {
    /// Established channel; the entry stays in the table.
    Handler(Arc<dyn ChannelHandler>),
    /// Pending connect; the entry has already been removed (one-shot).
    Connect(ConnectPending),
}

impl ReactorShared {
    /// Allocate a registration identity for a new channel.
    pub fn allocate(&self) -> Registration {
        Registration(Token(self.next_token.fetch_add(1, Ordering::Relaxed)))
    }

    /// Add or update the channel's registration.
    ///
    /// Safe to call from any thread, including pool workers rearming from
    /// inside a callback. A registration for a token that is already live
    /// replaces the old one. Fails with [`Error::ChannelClosed`] when the
    /// channel was concurrently closed — callers treat that as
    /// "connection gone", not as a reactor fault.
    pub fn register(
        &self,
        reg: Registration,
        channel: &mut dyn Source,
        attachment: Attachment,
        interest: InterestSet,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let mut table = self.table.lock().expect("registration table poisoned");
        let outcome = if table.contains_key(&reg.0) {
            self.registry.reregister(channel, reg.0, interest.to_mio())
        } else {
            self.registry.register(channel, reg.0, interest.to_mio())
        };
        match outcome {
            Ok(()) => {
                table.insert(
                    reg.0,
                    TableEntry {
                        attachment,
                        interest,
                    },
                );
                Ok(())
            }
            Err(e) => Err(registration_error(e)),
        }
    }

    /// Replace the interest of a live registration, keeping its attachment.
    pub fn rearm(
        &self,
        reg: Registration,
        channel: &mut dyn Source,
        interest: InterestSet,
    ) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let mut table = self.table.lock().expect("registration table poisoned");
        let entry = table.get_mut(&reg.0).ok_or(Error::ChannelClosed)?;
        self.registry
            .reregister(channel, reg.0, interest.to_mio())
            .map_err(registration_error)?;
        entry.interest = interest;
        Ok(())
    }

    /// Remove the channel's registration.
    ///
    /// Must happen at or before closing the channel. Failures from
    /// deregistering an already-closed channel are reported to the sink
    /// and otherwise ignored — the OS dropped the key with the channel.
    pub fn cancel(&self, reg: Registration, channel: &mut dyn Source) {
        let removed = self
            .table
            .lock()
            .expect("registration table poisoned")
            .remove(&reg.0);
        if removed.is_some() {
            self.deregister_channel(reg.0, channel);
        }
    }

    /// Force a blocked poll to return so queued registrations are seen.
    ///
    /// Idempotent; a no-op when the loop is mid-iteration.
    pub fn wakeup(&self) {
        // A failed wake leaves the loop to its poll timeout.
        let _ = self.waker.wake();
    }

    pub fn is_registered(&self, reg: Registration) -> bool {
        self.table
            .lock()
            .expect("registration table poisoned")
            .contains_key(&reg.0)
    }

    /// Interest of a live registration, if any.
    pub fn registered_interest(&self, reg: Registration) -> Option<InterestSet> {
        self.table
            .lock()
            .expect("registration table poisoned")
            .get(&reg.0)
            .map(|entry| entry.interest)
    }

    /// Number of live connection registrations (listener excluded).
    pub fn registration_count(&self) -> usize {
        self.table
            .lock()
            .expect("registration table poisoned")
            .len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn diag(&self) -> &dyn DiagnosticSink {
        &*self.diag
    }

    pub(crate) fn register_listener(&self, listener: &mut dyn Source) -> Result<()> {
        self.registry
            .register(listener, LISTENER_TOKEN, mio::Interest::READABLE)
            .map_err(Error::Multiplexer)
    }

    /// Deregister without touching the table. Used on the one-shot connect
    /// path where the entry is already gone.
    pub(crate) fn deregister_channel(&self, token: Token, channel: &mut dyn Source) {
        if let Err(error) = self.registry.deregister(channel) {
            self.diag.report(Diagnostic::DeregisterFailed {
                token: token.0,
                error,
            });
        }
    }

    /// Classify a ready dynamic token by its attachment tag.
    ///
    /// Connect entries are consumed here: a channel receives at most one
    /// connect dispatch before its key is gone.
    pub(crate) fn route(&self, token: Token) -> Option<Routed> {
        let mut table = self.table.lock().expect("registration table poisoned");
        match table.get(&token) {
            Some(entry) => {
                if let Attachment::Handler(handler) = &entry.attachment {
                    return Some(Routed::Handler(handler.clone()));
                }
            }
            None => return None,
        }
        // Connect interest is one-shot: consume the entry with the dispatch.
        match table.remove(&token) {
            Some(TableEntry {
                attachment: Attachment::ConnectCallback(pending),
                ..
            }) => Some(Routed::Connect(pending)),
            _ => None,
        }
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup();
    }
}

fn registration_error(e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(libc::EBADF) | Some(libc::ENOENT) => Error::ChannelClosed,
        _ => Error::Multiplexer(e),
    }
}

/// Routes one ready key. Supplied by the reactor variant.
///
/// Runs on the polling thread: classify and hand off, never block.
pub trait Dispatch: Send + 'static {
    fn dispatch(&self, event: &mio::event::Event);
}

/// Handle to the polling thread.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    thread: Option<thread::JoinHandle<Result<()>>>,
}

impl Reactor {
    /// Build the multiplexer and the shared state, without starting the
    /// loop. The variant registers its fixed channels in between.
    pub fn setup(diag: Arc<dyn DiagnosticSink>) -> Result<(Poll, Arc<ReactorShared>)> {
        let poll = Poll::new().map_err(Error::Multiplexer)?;
        let registry = poll.registry().try_clone().map_err(Error::Multiplexer)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Multiplexer)?;
        let shared = Arc::new(ReactorShared {
            registry,
            waker,
            table: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(FIRST_DYNAMIC_TOKEN),
            shutdown: AtomicBool::new(false),
            diag,
        });
        Ok((poll, shared))
    }

    /// Start the polling thread.
    pub fn start<D: Dispatch>(
        config: ReactorConfig,
        poll: Poll,
        shared: Arc<ReactorShared>,
        dispatch: D,
    ) -> Self {
        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("spindle-reactor".into())
            .spawn(move || poll_loop(poll, loop_shared, dispatch, config))
            .expect("failed to spawn reactor thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Handle to the shared state (for registrations and wakeups).
    pub fn shared(&self) -> Arc<ReactorShared> {
        self.shared.clone()
    }

    /// Stop the loop, join the thread, and surface any fatal multiplexer
    /// error the loop died with.
    pub fn shutdown(&mut self) -> Result<()> {
        self.shared.begin_shutdown();
        match self.thread.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Multiplexer(io::Error::new(
                    io::ErrorKind::Other,
                    "polling thread panicked",
                ))),
            },
            None => Ok(()),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// The poll loop — runs on the dedicated polling thread.
fn poll_loop<D: Dispatch>(
    mut poll: Poll,
    shared: Arc<ReactorShared>,
    dispatch: D,
    config: ReactorConfig,
) -> Result<()> {
    let mut events = Events::with_capacity(config.events_capacity);

    let outcome = loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break Ok(());
        }

        if let Err(e) = poll.poll(&mut events, config.poll_timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // The poll primitive itself is unusable. Fatal.
            break Err(Error::Multiplexer(e));
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                // Woken only to observe new registrations or shutdown.
                continue;
            }
            dispatch.dispatch(event);
        }
    };

    shared.shutdown.store(true, Ordering::Release);
    // Drop every remaining registration. Handlers own their channels and
    // close them when the last reference goes away; the multiplexer goes
    // down with `poll`.
    shared
        .table
        .lock()
        .expect("registration table poisoned")
        .clear();
    drop(poll);

    outcome
}
