use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::config::{EventConfig, LockMode};
use crate::context::{current_thread_token, ContextId, ExecutionContext};
use crate::error::{fatal, EventError, Identity};
use crate::lock::QueueLock;
use crate::waiters::WaiterQueue;

const FREE: u32 = 0;
const HELD: u32 = 1;

/// Stored in the owner slot when the holder is a bare thread rather than a fiber.
const NO_FIBER: u64 = 0;
/// Stored in the owner thread slot while the event is free.
const NO_THREAD: u64 = 0;

/// The state of a [`FiberEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    /// Nobody holds the event; the next acquire goes through without blocking.
    Free,
    /// Exactly one acquisition is outstanding. Acquires block (or fail, for
    /// [`FiberEvent::try_acquire()`]) until the owner calls [`FiberEvent::notify()`].
    Held,
}

/// A non-recursive exclusive lock with owner tracking, shared between fibers and plain threads.
///
/// Every operation takes the caller's execution context: `Some(ctx)` when called from a fiber
/// (the scheduler's context for that fiber), or `None` from a bare OS thread. Uncontended
/// acquisition is a single compare-and-swap with no allocation. A contended caller links its
/// context into the waiter queue and blocks reading its wakeup channel until a release hands the
/// event over. Bare threads get a standalone context for the duration of that wait.
///
/// Only the recorded owner may release the event, and it may not acquire it again before doing
/// so: a second `acquire()` by the owner blocks forever.
pub struct FiberEvent {
    state: AtomicU32,
    owner: AtomicU64,
    owner_thread: AtomicU64,
    waiters: QueueLock<WaiterQueue>,
}

impl FiberEvent {
    /// Flag for [`FiberEvent::with_flags()`] selecting a mutex-guarded waiter queue.
    pub const FLAG_USE_MUTEX: u32 = LockMode::FLAG_USE_MUTEX;

    /// Creates a free event whose waiter queue is guarded by `mode`.
    pub fn new(mode: LockMode) -> FiberEvent {
        Self::with_config(mode.into())
    }

    /// Creates a free event from a raw flags word (see [`FiberEvent::FLAG_USE_MUTEX`]).
    pub fn with_flags(flags: u32) -> FiberEvent {
        Self::new(LockMode::from_flags(flags))
    }

    pub fn with_config(config: EventConfig) -> FiberEvent {
        Self {
            state: AtomicU32::new(FREE),
            owner: AtomicU64::new(NO_FIBER),
            owner_thread: AtomicU64::new(NO_THREAD),
            waiters: QueueLock::new(config, WaiterQueue::new()),
        }
    }

    pub fn lock_mode(&self) -> LockMode {
        self.waiters.mode()
    }

    pub fn state(&self) -> EventState {
        match self.state.load(Ordering::Acquire) {
            FREE => EventState::Free,
            _ => EventState::Held,
        }
    }

    pub fn is_held(&self) -> bool {
        self.state() == EventState::Held
    }

    /// The recorded holder, or `None` if the event is free.
    pub fn owner(&self) -> Option<Identity> {
        let thread = self.owner_thread.load(Ordering::Acquire);
        if thread == NO_THREAD {
            return None;
        }
        match ContextId::from_raw(self.owner.load(Ordering::Acquire)) {
            Some(id) => Some(Identity::Fiber(id)),
            None => Some(Identity::Thread(thread)),
        }
    }

    /// Number of contexts currently blocked in [`FiberEvent::acquire()`].
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Takes the event if it is free. Never blocks and never touches the waiter queue; returns
    /// `false` if someone else holds it.
    pub fn try_acquire(&self, current: Option<&Arc<ExecutionContext>>) -> bool {
        if !self.try_lock_state() {
            return false;
        }
        self.record_owner(current.map(|ctx| ctx.id()));
        true
    }

    /// Takes the event, blocking the calling thread until it is free.
    ///
    /// Fails only if the caller's wakeup channel breaks while waiting; the attempt is then
    /// abandoned and the caller no longer waits on the event.
    pub fn acquire(&self, current: Option<&Arc<ExecutionContext>>) -> Result<(), EventError> {
        if self.try_acquire(current) {
            return Ok(());
        }
        self.acquire_contended(current, None)
    }

    /// Like [`FiberEvent::acquire()`], but gives up with [`EventError::TimedOut`] once `limit`
    /// has elapsed without the event becoming available. A `limit` too large to represent as a
    /// deadline waits without bound, exactly like `acquire()`.
    pub fn acquire_timeout(
        &self,
        current: Option<&Arc<ExecutionContext>>,
        limit: Duration,
    ) -> Result<(), EventError> {
        if self.try_acquire(current) {
            return Ok(());
        }
        self.acquire_contended(current, Instant::now().checked_add(limit))
    }

    /// Releases the event and wakes one waiter, if any are queued.
    ///
    /// The caller must be the recorded owner; otherwise [`EventError::NotOwner`] is returned and
    /// the event stays held. A failure to deliver the wakeup is reported as [`EventError::Io`],
    /// but the event has been released by then.
    pub fn notify(&self, current: Option<&Arc<ExecutionContext>>) -> Result<(), EventError> {
        let caller = match current {
            Some(ctx) => Identity::Fiber(ctx.id()),
            None => Identity::Thread(current_thread_token()),
        };
        let owner = self.owner();
        if owner != Some(caller) {
            warn!(%caller, ?owner, "notify called by a non-owner");
            return Err(EventError::NotOwner { caller, owner });
        }

        self.owner.store(NO_FIBER, Ordering::Release);
        self.owner_thread.store(NO_THREAD, Ordering::Release);
        if self
            .state
            .compare_exchange(HELD, FREE, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal("event owner released an event that was not held");
        }
        self.wake_next()
    }

    /// Sends a wakeup to the waiter at the front of the queue, if there is one.
    pub(crate) fn wake_next(&self) -> Result<(), EventError> {
        // wakeup() does not block. While the queue is locked the waiter cannot detach and close
        // its channel.
        let waiters = self.waiters.lock();
        if let Some(waiter) = waiters.first() {
            trace!(waiter = %waiter.id(), "waking next waiter");
            waiter.channel().wakeup()?;
        }
        Ok(())
    }

    fn try_lock_state(&self) -> bool {
        self.state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn record_owner(&self, fiber: Option<ContextId>) {
        self.owner
            .store(fiber.map_or(NO_FIBER, ContextId::as_u64), Ordering::Release);
        self.owner_thread
            .store(current_thread_token(), Ordering::Release);
    }

    fn acquire_contended(
        &self,
        current: Option<&Arc<ExecutionContext>>,
        deadline: Option<Instant>,
    ) -> Result<(), EventError> {
        let context = match current {
            Some(ctx) => Arc::clone(ctx),
            None => ExecutionContext::standalone(),
        };
        // Standalone contexts are freed when `context` drops, so ownership is recorded against
        // the thread alone.
        let fiber = if context.is_standalone() {
            None
        } else {
            Some(context.id())
        };
        let channel = context.channel();

        channel.open();
        let slot = self.waiters.lock().prepend(Arc::clone(&context));
        trace!(context = %context.id(), "queued on contended event");

        loop {
            if self.try_lock_state() {
                self.waiters.lock().detach(slot);
                break;
            }

            let woken = match deadline {
                None => channel.wait().map(|()| true),
                Some(deadline) => {
                    channel.wait_timeout(deadline.saturating_duration_since(Instant::now()))
                }
            };

            match woken {
                Ok(true) => continue,
                Ok(false) => {
                    // A release may have picked this context just as the deadline passed. Once
                    // detached it can no longer be picked, so one last attempt settles it.
                    self.waiters.lock().detach(slot);
                    let won = self.try_lock_state();
                    channel.close();
                    if !won {
                        trace!(context = %context.id(), "timed out waiting for event");
                        return Err(EventError::TimedOut);
                    }
                    self.record_owner(fiber);
                    return Ok(());
                }
                Err(e) => {
                    self.waiters.lock().detach(slot);
                    channel.close();
                    warn!(context = %context.id(), error = %e, "event wait failed");
                    return Err(EventError::Io(e));
                }
            }
        }

        channel.close();
        self.record_owner(fiber);
        trace!(context = %context.id(), "acquired contended event");
        Ok(())
    }
}

impl Default for FiberEvent {
    fn default() -> Self {
        Self::with_config(EventConfig::default())
    }
}

impl Drop for FiberEvent {
    fn drop(&mut self) {
        let queue = self.waiters.get_mut();
        if !queue.is_empty() {
            warn!(waiting = queue.len(), "event dropped with contexts still queued");
        }
    }
}

impl fmt::Debug for FiberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberEvent")
            .field("state", &self.state())
            .field("owner", &self.owner())
            .field("lock_mode", &self.lock_mode())
            .finish()
    }
}
