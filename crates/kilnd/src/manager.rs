//! Ownership and lifecycle of the live connection set.
//!
//! The manager is the only cross-thread-shared resource: the reactor loop
//! iterates the set to poll and broadcast while a foreign thread may add
//! or remove connections and request shutdown. Reads take the shared side
//! of the lock, mutations the exclusive side, and the shutdown sequence
//! executes exactly once no matter how many callers race into it.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::connection::{Connection, PipeListener};
use crate::runtime::signals::SignalWatchers;
use crate::runtime::wakeup::WakeupHandle;

/// Tracing target for manager operations.
pub(crate) const MANAGER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::manager");

/// Thread-safe owner of the live connection set.
#[derive(Debug)]
pub struct ConnectionManager {
    connections: RwLock<Vec<Arc<Connection>>>,
    wakeup: WakeupHandle,
    listener: Mutex<Option<Arc<PipeListener>>>,
    signals: Mutex<Option<Arc<SignalWatchers>>>,
    shutdown_requested: AtomicBool,
    teardown_started: AtomicBool,
    torn_down: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager with an empty connection set.
    ///
    /// # Errors
    ///
    /// Returns the IO error when the wakeup handle cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            connections: RwLock::new(Vec::new()),
            wakeup: WakeupHandle::new()?,
            listener: Mutex::new(None),
            signals: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
            teardown_started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    /// The loop's wakeup handle.
    #[must_use]
    pub const fn wakeup(&self) -> &WakeupHandle {
        &self.wakeup
    }

    /// Hands the pipe listener to the manager so shutdown can close it.
    pub fn install_listener(&self, listener: Arc<PipeListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Current listener, if one is installed.
    #[must_use]
    pub fn listener(&self) -> Option<Arc<PipeListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands the signal watchers to the manager so shutdown can reset them.
    pub fn install_signals(&self, signals: Arc<SignalWatchers>) {
        *self.signals.lock().unwrap_or_else(PoisonError::into_inner) = Some(signals);
    }

    /// Current signal watchers, if installed.
    #[must_use]
    pub fn signals(&self) -> Option<Arc<SignalWatchers>> {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Takes ownership of a connection and wakes the loop so the new
    /// endpoint is polled. Connections arriving after teardown began are
    /// closed immediately.
    pub fn add_connection(&self, connection: Arc<Connection>) {
        if self.teardown_started.load(Ordering::SeqCst) {
            warn!(
                target: MANAGER_TARGET,
                "refusing connection during shutdown"
            );
            connection.force_close();
            return;
        }
        {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.push(connection);
        }
        debug!(target: MANAGER_TARGET, "connection added");
        self.wakeup.send();
    }

    /// Snapshot of the live set for iteration without holding the lock.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes a connection by identity. An empty set afterwards means
    /// there is nothing left to serve, so shutdown is requested.
    pub fn on_disconnect(&self, connection: &Arc<Connection>) {
        connection.force_close();
        let now_empty = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            connections.retain(|candidate| !Arc::ptr_eq(candidate, connection));
            connections.is_empty()
        };
        info!(
            target: MANAGER_TARGET,
            kind = ?connection.kind(),
            "connection removed"
        );
        if now_empty {
            self.request_shutdown();
        }
    }

    /// Runs a callback over every live connection under the shared lock.
    pub fn broadcast(&self, mut callback: impl FnMut(&Arc<Connection>)) {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for connection in connections.iter() {
            callback(connection);
        }
    }

    /// Marshals a shutdown request onto the loop thread.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.wakeup.send();
    }

    /// Whether a shutdown request is pending or already honoured.
    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Executes the shutdown sequence: resets the signal watchers and the
    /// wakeup handle, notifies every live connection, clears the set, and
    /// forces every remaining OS handle closed. Exactly one invocation
    /// tears down; concurrent and repeated calls return immediately.
    pub fn start_shutdown(&self) {
        if self.teardown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: MANAGER_TARGET, "shutting down");

        if let Some(signals) = self
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            signals.reset();
        }
        // Final wake in case the loop is parked in the wait primitive while
        // a foreign thread tears down, then silence the handle.
        self.wakeup.send();
        self.wakeup.disable();

        let drained = {
            let mut connections = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *connections)
        };
        for connection in &drained {
            connection.notify_shutting_down();
        }
        for connection in &drained {
            connection.force_close();
        }

        drop(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.torn_down.store(true, Ordering::SeqCst);
    }

    /// Whether the shutdown sequence has completed.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// OS handles still owned by the manager; non-zero after the loop
    /// exits indicates a teardown-ordering bug.
    #[must_use]
    pub fn open_handle_count(&self) -> usize {
        let connections = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        let listener = usize::from(
            self.listener
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        );
        connections + listener
    }
}
