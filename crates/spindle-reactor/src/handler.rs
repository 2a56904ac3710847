//! Channel handler contract and registration attachments.
//!
//! A [`ChannelHandler`] is one socket channel's application-facing side.
//! The reactor never runs handler code on the polling thread: readiness is
//! classified there, the callback itself executes on the worker pool (or,
//! for a connect that finished inside `connect_to`, in the calling thread).

use crate::engine::{ReactorShared, Registration};
use spindle_core::worker::Action;

use mio::net::TcpStream;

use std::net::SocketAddr;
use std::sync::{Arc, MutexGuard};

/// Application-facing behavior of one connected channel.
///
/// Implementors own their channel (behind a `Mutex`, so the reactor can
/// borrow it mutably for registry operations) and decide what to do on
/// each readiness callback. Callbacks may block — they run on the pool.
pub trait ChannelHandler: Send + Sync {
    /// Exclusive access to the underlying channel.
    fn channel(&self) -> MutexGuard<'_, TcpStream>;

    /// Runs exactly once per successful connection establishment:
    /// synchronously inside `connect_to` when the handshake finished
    /// immediately, via the worker pool otherwise (including for accepted
    /// connections).
    fn connected(self: Arc<Self>);

    /// Read readiness. The registration stays armed (edge-triggered);
    /// drain the channel or rearm as needed.
    fn readable(self: Arc<Self>);

    /// Write readiness.
    fn writable(self: Arc<Self>);
}

/// Builds a [`ChannelHandler`] for every accepted or outbound channel.
///
/// `reg` identifies the channel's registration for the handler's own
/// rearm/cancel calls; the reactor performs the initial registration right
/// after `create` returns.
pub trait HandlerFactory: Send + Sync {
    fn create(
        &self,
        channel: TcpStream,
        peer: SocketAddr,
        reactor: Arc<ReactorShared>,
        reg: Registration,
    ) -> Arc<dyn ChannelHandler>;
}

/// What a registration routes readiness to.
///
/// Decided once at registration time; dispatch never reinterprets it.
pub enum Attachment {
    /// Established channel: readiness goes to the handler.
    Handler(Arc<dyn ChannelHandler>),
    /// Pending outbound connect: one-shot completion record.
    ConnectCallback(ConnectPending),
}

/// One-shot state for a connect-registered channel.
///
/// The handler gives the dispatcher access to the channel for finishing
/// the connect; the action runs on the worker pool once it succeeds.
pub struct ConnectPending {
    pub handler: Arc<dyn ChannelHandler>,
    pub peer: SocketAddr,
    pub action: Action,
}
