//! Error taxonomy for the runtime.
//!
//! Invariant violations (double-arming an event, resuming a finished fiber)
//! are reportable errors rather than unconditional aborts, so an embedding
//! context can decide how loudly to fail. Transient OS failures carry the
//! underlying `io::Error` and are returned with no bookkeeping mutated.
//! A timeout is a distinct completion kind, not an OS failure.

use crate::fiber::FiberState;
use crate::io::EventKind;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An event kind was registered while already armed for that descriptor.
    #[error("event {kind:?} already armed for fd {fd}")]
    EventAlreadyArmed { fd: RawFd, kind: EventKind },

    /// A fiber was resumed from a state that does not permit resumption.
    #[error("fiber {id} is not resumable from state {state:?}")]
    NotResumable { id: u64, state: FiberState },

    /// An operation that binds the calling fiber was invoked outside one.
    #[error("no running fiber on this thread")]
    NoFiberContext,

    /// The thread is not driven by an event loop, or the loop has shut down.
    #[error("no event loop bound to this thread")]
    NoEventLoop,

    /// epoll registration or wait failed.
    #[error("epoll operation failed")]
    Epoll(#[source] io::Error),

    /// The wakeup pipe could not be created or written.
    #[error("wakeup pipe operation failed")]
    Pipe(#[source] io::Error),

    /// A hooked operation exceeded its configured timeout.
    #[error("operation timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error reports a broken invariant rather than an
    /// environmental failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Error::EventAlreadyArmed { .. } | Error::NotResumable { .. }
        )
    }
}
