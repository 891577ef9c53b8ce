//! This example has a handful of worker threads take turns appending to a shared, unsynchronized
//! log while holding a [`FiberEvent`]. Half the workers pose as fibers and pass their own
//! execution context; the rest are plain threads and pass `None`.
//!
//! [`FiberEvent`]: fiber_event::FiberEvent

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::time::Duration;

use fiber_event::{EventConfig, EventError, ExecutionContext, FiberEvent};

// The event below serializes all access to this !Sync state.
struct SharedLog(UnsafeCell<Vec<String>>);
unsafe impl Sync for SharedLog {}

pub fn main() -> Result<(), EventError> {
    let event = Arc::new(FiberEvent::with_config(EventConfig::mutex()));
    let log = Arc::new(SharedLog(UnsafeCell::new(Vec::new())));

    const THREAD_COUNT: usize = 4;
    let mut threads = Vec::with_capacity(THREAD_COUNT);
    for thread_idx in 0..THREAD_COUNT {
        let event = event.clone();
        let log = log.clone();
        threads.push(std::thread::spawn(move || -> Result<(), EventError> {
            let fiber = (thread_idx % 2 == 0).then(ExecutionContext::fiber);
            for round in 0..3 {
                event.acquire(fiber.as_ref())?;

                // Safe: only the holder of `event` touches the log.
                let entries = unsafe { &mut *log.0.get() };
                entries.push(format!("worker {thread_idx} round {round}"));

                event.notify(fiber.as_ref())?;
            }
            Ok(())
        }));
    }

    // Give up on a contended acquire instead of waiting forever.
    event.acquire(None)?;
    let waited = {
        let event = event.clone();
        std::thread::spawn(move || event.acquire_timeout(None, Duration::from_millis(20)))
            .join()
            .expect("timeout thread panicked")
    };
    eprintln!("bounded acquire while held: {:?}", waited);
    event.notify(None)?;

    for jh in threads {
        jh.join().expect("Worker thread panicked!")?;
    }

    let entries = unsafe { &*log.0.get() };
    for entry in entries {
        eprintln!("{entry}");
    }
    eprintln!("{} entries logged - exiting!", entries.len());
    Ok(())
}
