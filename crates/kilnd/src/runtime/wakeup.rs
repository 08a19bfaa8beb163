//! Cross-thread wakeup handle for the reactor loop.
//!
//! Foreign threads never touch loop-owned state directly: they write one
//! byte into this handle and the loop observes it during its own turn.
//! The handle is the only legitimate crossing for shutdown requests and
//! connection-set changes made outside the loop thread.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

/// Pair of connected non-blocking stream halves used as a doorbell.
#[derive(Debug)]
pub struct WakeupHandle {
    sender: UnixStream,
    receiver: UnixStream,
    enabled: AtomicBool,
}

impl WakeupHandle {
    /// Creates the handle.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the underlying pair cannot be created.
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = UnixStream::pair()?;
        sender.set_nonblocking(true)?;
        receiver.set_nonblocking(true)?;
        Ok(Self {
            sender,
            receiver,
            enabled: AtomicBool::new(true),
        })
    }

    /// Wakes the loop. Safe from any thread; a full doorbell buffer means
    /// a wakeup is already pending, which is just as good.
    pub fn send(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let _ = (&self.sender).write(&[1]);
    }

    /// Consumes every pending wakeup byte.
    pub fn drain(&self) {
        let mut sink = [0_u8; 64];
        while let Ok(count) = (&self.receiver).read(&mut sink) {
            if count == 0 {
                break;
            }
        }
    }

    /// Stops further wakeups; part of the idempotent shutdown sequence.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// File descriptor the loop waits on.
    #[must_use]
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.receiver.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    fn readable(handle: &WakeupHandle) -> bool {
        let mut fds = [PollFd::new(handle.poll_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, PollTimeout::ZERO).expect("poll");
        ready > 0
    }

    #[test]
    fn send_makes_the_handle_readable() {
        let handle = WakeupHandle::new().expect("create");
        assert!(!readable(&handle));
        handle.send();
        assert!(readable(&handle));
    }

    #[test]
    fn drain_clears_pending_wakeups() {
        let handle = WakeupHandle::new().expect("create");
        handle.send();
        handle.send();
        handle.drain();
        assert!(!readable(&handle));
    }

    #[test]
    fn disabled_handle_stays_quiet() {
        let handle = WakeupHandle::new().expect("create");
        handle.disable();
        handle.send();
        assert!(!readable(&handle));
    }
}
