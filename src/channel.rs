//! The per-context wakeup channel.
//!
//! Each [`ExecutionContext`](crate::ExecutionContext) carries a channel that is opened lazily
//! when the context has to block, and closed again as soon as the wait is over. Waking a context
//! writes one 8-byte token into the channel; waiting reads one back. A `pending` flag sits in
//! front of the descriptor so that any number of concurrent `wakeup()` calls made while a wakeup
//! is already in flight collapse into that single token.
//!
//! On Linux the channel is an `eventfd`, which serves as both ends. Elsewhere it is a connected
//! `AF_UNIX` socket pair: the waiter reads from the first socket, wakers write to the second.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::fatal;

const TOKEN_LEN: usize = std::mem::size_of::<u64>();
const CLOSED: RawFd = -1;

pub struct WakeupChannel {
    inbound: AtomicI32,
    outbound: AtomicI32,
    pending: AtomicBool,
}

impl WakeupChannel {
    pub(crate) const fn new() -> WakeupChannel {
        Self {
            inbound: AtomicI32::new(CLOSED),
            outbound: AtomicI32::new(CLOSED),
            pending: AtomicBool::new(false),
        }
    }

    /// Opens the channel if it is not open already. Running out of descriptors here is treated as
    /// an unrecoverable environment failure and aborts the process.
    pub fn open(&self) {
        if self.inbound.load(Ordering::Acquire) != CLOSED {
            return;
        }

        let (inbound, outbound) = match create_endpoints() {
            Ok(fds) => fds,
            Err(e) => fatal(&format!("cannot create wakeup channel: {}", e)),
        };
        debug!(inbound, outbound, "wakeup channel opened");
        self.outbound.store(outbound, Ordering::Release);
        self.inbound.store(inbound, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.inbound.load(Ordering::Acquire) != CLOSED
    }

    /// True if a wakeup has been sent and not yet consumed by [`WakeupChannel::wait()`].
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn inbound_fd(&self) -> Option<RawFd> {
        match self.inbound.load(Ordering::Acquire) {
            CLOSED => None,
            fd => Some(fd),
        }
    }

    /// Blocks the calling thread until a wakeup token can be read. On failure the channel is left
    /// open; closing it is up to the caller.
    pub fn wait(&self) -> io::Result<()> {
        let fd = self.inbound_or_abort();
        read_token(fd)?;
        self.consume_pending();
        Ok(())
    }

    /// Like [`WakeupChannel::wait()`], but gives up after `limit`. Returns `Ok(false)` if no
    /// wakeup arrived in time. A `limit` past the range of [`Instant`] never expires.
    pub fn wait_timeout(&self, limit: Duration) -> io::Result<bool> {
        let fd = self.inbound_or_abort();
        let deadline = Instant::now().checked_add(limit);

        loop {
            let millis = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    // Round up so a sub-millisecond remainder still sleeps instead of spinning.
                    ((remaining.as_micros() + 999) / 1000).min(libc::c_int::MAX as u128)
                        as libc::c_int
                }
                None => -1,
            };
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let ready = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                    return Ok(false);
                }
                continue;
            }

            read_token(fd)?;
            self.consume_pending();
            return Ok(true);
        }
    }

    /// Signals whoever is waiting on this channel. If a wakeup is already pending nothing is
    /// written, the waiter will observe the one already in flight.
    pub fn wakeup(&self) -> io::Result<()> {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let fd = self.outbound.load(Ordering::Acquire);
        if fd == CLOSED {
            fatal("wakeup sent to a closed channel");
        }

        let token: u64 = 1;
        loop {
            let written = unsafe {
                libc::write(
                    fd,
                    &token as *const u64 as *const libc::c_void,
                    TOKEN_LEN,
                )
            };
            if written == TOKEN_LEN as isize {
                return Ok(());
            }
            let err = if written < 0 {
                io::Error::last_os_error()
            } else {
                io::Error::new(io::ErrorKind::WriteZero, "short write to wakeup channel")
            };
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(fd, error = %err, "wakeup write failed");
            // No token went out, so the next wakeup must try again.
            self.pending.store(false, Ordering::Release);
            return Err(err);
        }
    }

    /// Closes both ends and forgets any pending wakeup.
    pub fn close(&self) {
        let inbound = self.inbound.swap(CLOSED, Ordering::AcqRel);
        let outbound = self.outbound.swap(CLOSED, Ordering::AcqRel);

        if inbound != CLOSED {
            unsafe { libc::close(inbound) };
        }
        if outbound != CLOSED && outbound != inbound {
            unsafe { libc::close(outbound) };
        }
        if inbound != CLOSED || outbound != CLOSED {
            debug!(inbound, outbound, "wakeup channel closed");
        }

        // Only the owning context closes its channel, and never while it is queued, so no waker
        // can race with this store.
        self.pending.store(false, Ordering::Release);
    }

    fn inbound_or_abort(&self) -> RawFd {
        match self.inbound.load(Ordering::Acquire) {
            CLOSED => fatal("wait on a closed wakeup channel"),
            fd => fd,
        }
    }

    fn consume_pending(&self) {
        if self
            .pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            fatal("wakeup token read without a pending wakeup");
        }
    }
}

impl Drop for WakeupChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for WakeupChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeupChannel")
            .field("inbound", &self.inbound.load(Ordering::Relaxed))
            .field("outbound", &self.outbound.load(Ordering::Relaxed))
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish()
    }
}

fn read_token(fd: RawFd) -> io::Result<()> {
    let mut token: u64 = 0;
    loop {
        let read = unsafe {
            libc::read(
                fd,
                &mut token as *mut u64 as *mut libc::c_void,
                TOKEN_LEN,
            )
        };
        if read == TOKEN_LEN as isize {
            return Ok(());
        }
        let err = if read < 0 {
            io::Error::last_os_error()
        } else {
            io::Error::new(io::ErrorKind::UnexpectedEof, "short read from wakeup channel")
        };
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        warn!(fd, error = %err, "wakeup read failed");
        return Err(err);
    }
}

#[cfg(target_os = "linux")]
fn create_endpoints() -> io::Result<(RawFd, RawFd)> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fd, fd))
}

#[cfg(not(target_os = "linux"))]
fn create_endpoints() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [libc::c_int; 2] = [CLOSED; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    for &fd in &fds {
        unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }
    Ok((fds[0], fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn open_is_idempotent() {
        let channel = WakeupChannel::new();
        assert!(!channel.is_open());
        channel.open();
        let fd = channel.inbound_fd();
        channel.open();
        assert_eq!(fd, channel.inbound_fd());
        channel.close();
        assert!(!channel.is_open());
        assert_eq!(None, channel.inbound_fd());
    }

    #[test]
    fn wakeup_then_wait() {
        let channel = WakeupChannel::new();
        channel.open();
        channel.wakeup().unwrap();
        assert!(channel.is_pending());
        channel.wait().unwrap();
        assert!(!channel.is_pending());
    }

    #[test]
    fn repeated_wakeups_coalesce_into_one_token() {
        let channel = WakeupChannel::new();
        channel.open();
        channel.wakeup().unwrap();
        channel.wakeup().unwrap();
        channel.wakeup().unwrap();

        assert_eq!(true, channel.wait_timeout(Duration::from_millis(100)).unwrap());
        // Nothing else may be readable.
        assert_eq!(false, channel.wait_timeout(Duration::from_millis(20)).unwrap());

        // And the channel still delivers the next round.
        channel.wakeup().unwrap();
        assert_eq!(true, channel.wait_timeout(Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn close_resets_pending() {
        let channel = WakeupChannel::new();
        channel.open();
        channel.wakeup().unwrap();
        channel.close();
        assert!(!channel.is_pending());

        // A reopened channel starts out empty.
        channel.open();
        assert_eq!(false, channel.wait_timeout(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn unrepresentable_timeout_waits_without_bound() {
        let channel = WakeupChannel::new();
        channel.open();
        channel.wakeup().unwrap();
        assert_eq!(true, channel.wait_timeout(Duration::MAX).unwrap());
        assert!(!channel.is_pending());
    }

    /// Points `fd` at `/dev/null` opened with `flags`, so that the other direction fails.
    fn break_descriptor(fd: RawFd, flags: libc::c_int) {
        let sink = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, flags) };
        assert!(sink >= 0, "cannot open /dev/null");
        assert_eq!(fd, unsafe { libc::dup2(sink, fd) });
        unsafe { libc::close(sink) };
    }

    #[test]
    fn failed_wait_leaves_channel_open() {
        let channel = WakeupChannel::new();
        channel.open();
        break_descriptor(channel.inbound_fd().unwrap(), libc::O_WRONLY);

        assert!(channel.wait().is_err());
        assert!(channel.is_open());

        channel.close();
        assert!(!channel.is_open());
    }

    #[test]
    fn failed_wakeup_clears_pending() {
        let channel = WakeupChannel::new();
        channel.open();
        break_descriptor(channel.outbound.load(Ordering::Acquire), libc::O_RDONLY);

        assert!(channel.wakeup().is_err());
        assert!(!channel.is_pending());
        // The next wakeup is not swallowed as a coalesced one.
        assert!(channel.wakeup().is_err());
        channel.close();
    }

    #[test]
    fn wakes_a_thread_blocked_in_wait() {
        let channel = Arc::new(WakeupChannel::new());
        channel.open();

        let waiter = {
            let channel = channel.clone();
            thread::spawn(move || channel.wait())
        };

        for _ in 0..100 {
            thread::yield_now();
        }
        channel.wakeup().unwrap();
        waiter.join().unwrap().unwrap();
        assert!(!channel.is_pending());
    }
}
