//! `fiber_event` implements an owner-checked exclusive event that works the same whether the
//! caller is a fiber running under a cooperative scheduler or a plain OS thread with no scheduler
//! at all.
//!
//! A [`FiberEvent`] behaves like a non-recursive lock: [`FiberEvent::acquire()`] takes it (blocking
//! if needed), [`FiberEvent::try_acquire()`] takes it only if that can be done immediately, and
//! [`FiberEvent::notify()`] releases it and wakes one waiter. Only the recorded owner may notify.
//!
//! Uncontended acquisition is a single compare-and-swap. Contended callers queue their
//! [`ExecutionContext`] on the event and block on the context's [`WakeupChannel`], an `eventfd`
//! (or socket pair) that is opened for the wait and closed right after. Because the block point
//! is one read on one descriptor, a fiber scheduler can intercept it
//! (see [`ExecutionContext::wakeup_fd()`]) and run other fibers meanwhile.
//!
//! The waiter queue is guarded by either a mutex or a spin lock, chosen per event through
//! [`LockMode`] or a full [`EventConfig`]. Internal invariant violations (a state or lock word in a
//! value the protocol cannot produce) abort the process; everything recoverable is reported as an
//! [`EventError`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::thread;
//! use fiber_event::{FiberEvent, LockMode};
//!
//! let event = Arc::new(FiberEvent::new(LockMode::Spin));
//! event.acquire(None).unwrap();
//!
//! let worker = {
//!     let event = event.clone();
//!     thread::spawn(move || {
//!         // Blocks until the main thread lets go.
//!         event.acquire(None).unwrap();
//!         event.notify(None).unwrap();
//!     })
//! };
//!
//! event.notify(None).unwrap();
//! worker.join().unwrap();
//! ```

mod channel;
mod config;
mod context;
mod error;
mod event;
mod lock;
mod waiters;


pub use channel::WakeupChannel;
pub use config::{Backoff, EventConfig, LockMode};
pub use context::{current_thread_token, ContextId, ExecutionContext};
pub use error::{EventError, Identity};
pub use event::{EventState, FiberEvent};
