//! Execution contexts: the things that block on an event and get woken up.
//!
//! A fiber scheduler owns one [`ExecutionContext`] per fiber and passes it into every event
//! operation made from that fiber. Code running on a plain OS thread passes `None` instead, and
//! the event allocates a short-lived standalone context for the duration of a contended wait.

use std::cell::Cell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::channel::WakeupChannel;
use crate::error::fatal;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: Cell<u64> = Cell::new(0);
}

/// Returns a non-zero token identifying the calling OS thread. Tokens are never reused within a
/// process, so they can be compared across threads the way `pthread_self()` values are.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| {
        let mut value = token.get();
        if value == 0 {
            value = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
            token.set(value);
        }
        value
    })
}

/// Process-unique identifier of an [`ExecutionContext`]. Zero is never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> ContextId {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn from_raw(raw: u64) -> Option<ContextId> {
        match raw {
            0 => None,
            raw => Some(ContextId(raw)),
        }
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The unit that can be blocked on a [`FiberEvent`](crate::FiberEvent) and woken again.
pub struct ExecutionContext {
    id: ContextId,
    channel: WakeupChannel,
    queued: AtomicBool,
    standalone: bool,
}

impl ExecutionContext {
    /// Creates the context a fiber scheduler hands out for one of its fibers.
    pub fn fiber() -> Arc<ExecutionContext> {
        Arc::new(Self::with_kind(false))
    }

    /// Creates a throwaway context standing in for the calling OS thread. It is freed by dropping
    /// the last `Arc`.
    pub fn standalone() -> Arc<ExecutionContext> {
        Arc::new(Self::with_kind(true))
    }

    fn with_kind(standalone: bool) -> ExecutionContext {
        Self {
            id: ContextId::next(),
            channel: WakeupChannel::new(),
            queued: AtomicBool::new(false),
            standalone,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// True if this context only represents a bare thread for the length of one wait.
    pub fn is_standalone(&self) -> bool {
        self.standalone
    }

    pub fn channel(&self) -> &WakeupChannel {
        &self.channel
    }

    /// The descriptor a blocked wait reads from, if a wait is in progress. A fiber scheduler can
    /// poll this instead of letting the read block the whole thread.
    pub fn wakeup_fd(&self) -> Option<RawFd> {
        self.channel.inbound_fd()
    }

    /// True while this context is linked into some event's waiter queue.
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn mark_queued(&self) {
        if self.queued.swap(true, Ordering::AcqRel) {
            fatal("execution context is already linked into a waiter queue");
        }
    }

    pub(crate) fn mark_unqueued(&self) {
        if !self.queued.swap(false, Ordering::AcqRel) {
            fatal("execution context was not linked into a waiter queue");
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("standalone", &self.standalone)
            .field("queued", &self.is_queued())
            .field("channel", &self.channel)
            .finish()
    }
}
