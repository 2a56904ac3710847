//! # spindle-reactor — multiplexed socket readiness, dispatched
//!
//! One dedicated OS thread blocks on the readiness multiplexer and routes
//! every ready key to an action: accept, read, write, or connect. All
//! application logic runs on a separate worker pool (see `spindle-pool`),
//! so the polling thread never blocks on anything but the multiplexer.
//!
//! The engine ([`engine::Reactor`]) is generic over a [`engine::Dispatch`]
//! strategy; [`server::ServerReactor`] is the accepting/connecting variant
//! that most embedders want:
//!
//! ```ignore
//! let pool = Arc::new(FixedPool::auto_sized(1024));
//! let server = ServerReactor::bind(
//!     SocketOptions::default(),
//!     "0.0.0.0:9000".parse()?,
//!     pool,
//!     Arc::new(MyFactory),
//!     Arc::new(TraceSink),
//! )?;
//! let outbound = server.connect_to("10.0.0.7:9000".parse()?)?;
//! outbound.established.wait();
//! ```

pub mod diag;
pub mod engine;
pub mod handler;
pub mod interest;
pub mod options;
pub mod server;

pub use diag::TraceSink;
pub use engine::{Dispatch, Reactor, ReactorConfig, ReactorShared, Registration};
pub use handler::{Attachment, ChannelHandler, ConnectPending, HandlerFactory};
pub use interest::InterestSet;
pub use options::SocketOptions;
pub use server::{Outbound, ServerReactor};
