//! The internal lock that serializes waiter queue mutations.
//!
//! The lock is only ever held for a queue operation (enqueue, detach, or peek-and-wake) and never
//! across a blocking wait, so even the spin variant stays cheap.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use parking_lot::lock_api::RawMutex as _;
use parking_lot_core::SpinWait;

use crate::config::{Backoff, EventConfig, LockMode};
use crate::error::fatal;

/// The `{lock, unlock}` capability behind a [`QueueLock`].
pub(crate) trait RawLock: Send + Sync {
    fn lock(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must currently hold the lock.
    unsafe fn unlock(&self);
}

pub(crate) struct MutexLock(parking_lot::RawMutex);

impl MutexLock {
    pub(crate) const fn new() -> MutexLock {
        MutexLock(parking_lot::RawMutex::INIT)
    }
}

impl RawLock for MutexLock {
    fn lock(&self) {
        self.0.lock()
    }

    unsafe fn unlock(&self) {
        self.0.unlock()
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

pub(crate) struct SpinLock {
    word: AtomicU32,
    backoff: Backoff,
}

impl SpinLock {
    pub(crate) const fn new(backoff: Backoff) -> SpinLock {
        Self {
            word: AtomicU32::new(UNLOCKED),
            backoff,
        }
    }
}

impl RawLock for SpinLock {
    fn lock(&self) {
        let mut spin = SpinWait::new();
        while self
            .word
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            match self.backoff {
                Backoff::None => std::hint::spin_loop(),
                Backoff::Yield => {
                    if !spin.spin() {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    unsafe fn unlock(&self) {
        if self
            .word
            .compare_exchange(LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            fatal("spin lock released while not held");
        }
    }
}

/// A value guarded by one of the [`RawLock`] variants, picked once at construction.
pub(crate) struct QueueLock<T> {
    raw: Box<dyn RawLock>,
    mode: LockMode,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for QueueLock<T> {}
unsafe impl<T: Send> Sync for QueueLock<T> {}

impl<T> QueueLock<T> {
    pub(crate) fn new(config: EventConfig, data: T) -> QueueLock<T> {
        let raw: Box<dyn RawLock> = match config.lock_mode {
            LockMode::Mutex => Box::new(MutexLock::new()),
            LockMode::Spin => Box::new(SpinLock::new(config.backoff)),
        };
        Self {
            raw,
            mode: config.lock_mode,
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.mode
    }

    pub(crate) fn lock(&self) -> QueueGuard<'_, T> {
        self.raw.lock();
        QueueGuard { lock: self }
    }

    /// Direct access through an exclusive borrow; no locking needed.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub(crate) struct QueueGuard<'a, T> {
    lock: &'a QueueLock<T>,
}

impl<T> Deref for QueueGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for QueueGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for QueueGuard<'_, T> {
    fn drop(&mut self) {
        // The guard only exists while the lock is held.
        unsafe { self.lock.raw.unlock() }
    }
}
