use std::fmt;
use std::io;

use thiserror::Error;

use crate::context::ContextId;

/// Who holds, or is trying to release, a [`FiberEvent`](crate::FiberEvent).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Identity {
    /// A fiber, identified by its execution context.
    Fiber(ContextId),
    /// A bare OS thread, identified by its thread token.
    Thread(u64),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Fiber(id) => write!(f, "fiber({})", id),
            Identity::Thread(tid) => write!(f, "thread({})", tid),
        }
    }
}

/// Failures reported by [`FiberEvent`](crate::FiberEvent) operations.
///
/// Contention is not an error: [`FiberEvent::try_acquire()`](crate::FiberEvent::try_acquire)
/// reports it by returning `false`. Broken internal invariants are not reported here either, they
/// abort the process.
#[derive(Error, Debug)]
pub enum EventError {
    /// Reading from or writing to a wakeup channel failed. The acquire attempt that hit this has
    /// been abandoned and its context cleaned up.
    #[error("wakeup channel I/O failed: {0}")]
    Io(#[from] io::Error),

    /// `notify()` was called by someone other than the recorded owner. The event is still held.
    #[error("{caller} is not the owner of the event (held by {owner:?})")]
    NotOwner {
        caller: Identity,
        owner: Option<Identity>,
    },

    /// A bounded acquire gave up before the event became free.
    #[error("timed out waiting for the event")]
    TimedOut,
}

/// Logs `msg` and aborts the process.
///
/// Used when a state or lock word holds a value the protocol cannot produce, which means memory
/// corruption or a caller going around the API.
#[cold]
#[inline(never)]
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!(target: "fiber_event", "fatal: {}", msg);
    eprintln!("fiber_event: fatal: {}", msg);
    std::process::abort()
}
