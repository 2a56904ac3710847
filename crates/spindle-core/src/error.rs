//! Spindle error types.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// The listening address could not be bound.
    Bind(io::Error),
    /// The readiness poller itself is unusable. Fatal to the whole reactor.
    Multiplexer(io::Error),
    /// The channel was closed concurrently; its registration is gone.
    /// Callers treat this as "connection gone", never as fatal.
    ChannelClosed,
    /// The worker pool is saturated or shut down.
    SubmissionRejected,
    /// An outbound connect could not be initiated.
    Connect(io::Error),
    /// The reactor has shut down; no further registrations are accepted.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "bind failed: {}", e),
            Self::Multiplexer(e) => write!(f, "multiplexer failure: {}", e),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::SubmissionRejected => write!(f, "worker pool rejected submission"),
            Self::Connect(e) => write!(f, "connect failed: {}", e),
            Self::Shutdown => write!(f, "reactor shut down"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
