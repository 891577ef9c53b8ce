//! Construction-time settings for a [`FiberEvent`](crate::FiberEvent).

/// Which primitive guards an event's waiter queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LockMode {
    /// A compare-and-swap spin lock on a single word.
    #[default]
    Spin,
    /// A real mutex, parking contended threads.
    Mutex,
}

impl LockMode {
    /// Bit in the flags word that selects [`LockMode::Mutex`].
    pub const FLAG_USE_MUTEX: u32 = 1;

    /// Maps a raw flags word onto a lock mode; unknown bits are ignored.
    pub const fn from_flags(flags: u32) -> LockMode {
        if flags & Self::FLAG_USE_MUTEX != 0 {
            LockMode::Mutex
        } else {
            LockMode::Spin
        }
    }
}

/// What a spin lock does between failed compare-and-swap attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately, forever.
    None,
    /// Spin with `parking_lot_core::SpinWait`, then yield the thread once the spin budget is spent.
    #[default]
    Yield,
}

/// Event configuration. Fixed for the lifetime of the event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct EventConfig {
    pub lock_mode: LockMode,
    /// Ignored unless `lock_mode` is [`LockMode::Spin`].
    pub backoff: Backoff,
}

impl EventConfig {
    /// Spin-locked queue with yielding backoff.
    pub const fn spin() -> Self {
        Self {
            lock_mode: LockMode::Spin,
            backoff: Backoff::Yield,
        }
    }

    /// Mutex-locked queue.
    pub const fn mutex() -> Self {
        Self {
            lock_mode: LockMode::Mutex,
            backoff: Backoff::Yield,
        }
    }

    pub const fn with_lock_mode(self, lock_mode: LockMode) -> Self {
        Self { lock_mode, ..self }
    }

    pub const fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }
}

impl From<LockMode> for EventConfig {
    fn from(lock_mode: LockMode) -> Self {
        EventConfig::default().with_lock_mode(lock_mode)
    }
}
