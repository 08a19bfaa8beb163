//! Signal watchers feeding the reactor loop.
//!
//! Each watched signal writes a byte into a dedicated non-blocking pipe
//! when delivered, so the loop observes signals through the same wait
//! primitive as every other event. Resetting a watcher unregisters the
//! handler; reset is idempotent and part of the shutdown sequence.

use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::signal::{SIGHUP, SIGINT};
use signal_hook::low_level;

/// One registered signal watcher.
#[derive(Debug)]
pub struct SignalWatcher {
    signal: i32,
    id: SigId,
    receiver: UnixStream,
    registered: AtomicBool,
}

impl SignalWatcher {
    /// Installs a watcher for `signal`.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the pipe cannot be created or the signal
    /// handler cannot be registered.
    pub fn install(signal: i32) -> io::Result<Self> {
        let (sender, receiver) = UnixStream::pair()?;
        sender.set_nonblocking(true)?;
        receiver.set_nonblocking(true)?;
        let id = low_level::pipe::register(signal, sender)?;
        Ok(Self {
            signal,
            id,
            receiver,
            registered: AtomicBool::new(true),
        })
    }

    /// The watched signal number.
    #[must_use]
    pub const fn signal(&self) -> i32 {
        self.signal
    }

    /// Consumes pending notifications, reporting whether any arrived.
    pub fn drain(&self) -> bool {
        let mut fired = false;
        let mut sink = [0_u8; 64];
        while let Ok(count) = (&self.receiver).read(&mut sink) {
            if count == 0 {
                break;
            }
            fired = true;
        }
        fired
    }

    /// Unregisters the signal handler. Idempotent.
    pub fn reset(&self) {
        if self.registered.swap(false, Ordering::SeqCst) {
            low_level::unregister(self.id);
        }
    }

    /// File descriptor the loop waits on.
    #[must_use]
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.receiver.as_fd()
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The daemon's pair of shutdown-signal watchers.
#[derive(Debug)]
pub struct SignalWatchers {
    /// SIGINT watcher.
    pub interrupt: SignalWatcher,
    /// SIGHUP watcher.
    pub hangup: SignalWatcher,
}

impl SignalWatchers {
    /// Installs watchers for SIGINT and SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns the IO error from either registration.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: SignalWatcher::install(SIGINT)?,
            hangup: SignalWatcher::install(SIGHUP)?,
        })
    }

    /// Unregisters both watchers. Idempotent.
    pub fn reset(&self) {
        self.interrupt.reset();
        self.hangup.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_and_reset_are_idempotent() {
        let watchers = SignalWatchers::install().expect("install");
        assert_eq!(watchers.interrupt.signal(), SIGINT);
        assert_eq!(watchers.hangup.signal(), SIGHUP);
        watchers.reset();
        watchers.reset();
    }

    #[test]
    fn drain_reports_nothing_without_a_signal() {
        let watchers = SignalWatchers::install().expect("install");
        assert!(!watchers.interrupt.drain());
        watchers.reset();
    }
}
