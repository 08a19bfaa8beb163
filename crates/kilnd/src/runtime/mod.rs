//! The reactor runtime.
//!
//! Exactly one thread runs the event loop: it blocks in the wait
//! primitive and nowhere else, and every inbound callback (data arrival,
//! accept, close, signal, wakeup) executes on it, strictly serialised.
//! Foreign threads reach the loop only through the connection manager's
//! lock and the wakeup handle. The loop exits when the shutdown sequence
//! has run; exiting with handles still open is a teardown-ordering bug
//! surfaced as [`ServeError::UncleanExit`], never a panic.

pub(crate) mod signals;
pub(crate) mod wakeup;

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use kiln_config::{EndpointPreparationError, ServerEndpoint, Settings};

use crate::connection::{Connection, ConnectionState, ListenerError, PipeListener};
use crate::dispatch::Dispatcher;
use crate::engine::EngineHandle;
use crate::manager::ConnectionManager;

use self::signals::SignalWatchers;

/// Tracing target for runtime operations.
pub(crate) const RUNTIME_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::runtime");

/// Errors surfaced while building or running the server.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The wakeup handle could not be created.
    #[error("failed to create wakeup handle: {source}")]
    Wakeup {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The signal watchers could not be installed.
    #[error("failed to install signal watchers: {source}")]
    Signals {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The endpoint filesystem could not be prepared.
    #[error(transparent)]
    Endpoint(#[from] EndpointPreparationError),
    /// The pipe listener could not be bound.
    #[error(transparent)]
    Listener(#[from] ListenerError),
    /// The wait primitive failed.
    #[error("wait primitive failed: {source}")]
    Poll {
        /// Underlying errno.
        #[source]
        source: Errno,
    },
    /// The serve thread panicked.
    #[error("serve thread panicked")]
    ThreadPanic,
    /// The loop exited while handles remained open: a teardown-ordering
    /// bug, never an expected runtime condition.
    #[error("internal error: event loop stopped with {open_handles} handles still open")]
    UncleanExit {
        /// Number of handles left open.
        open_handles: usize,
    },
}

/// What one ready poll slot refers to.
#[derive(Clone, Copy)]
enum WaitSource {
    Wakeup,
    Interrupt,
    Hangup,
    Listener,
    Connection(usize),
}

/// The protocol server.
pub struct Server {
    manager: Arc<ConnectionManager>,
    settings: Settings,
    engine: EngineHandle,
    serve_thread: Mutex<Option<JoinHandle<Result<(), ServeError>>>>,
}

impl Server {
    /// Builds a server for the configured endpoint: binds the pipe
    /// listener, or wires the process standard streams as the single
    /// connection.
    ///
    /// # Errors
    ///
    /// Returns a [`ServeError`] when the wakeup handle or the endpoint
    /// cannot be set up.
    pub fn new(settings: Settings, engine: EngineHandle) -> Result<Arc<Self>, ServeError> {
        let manager = Arc::new(
            ConnectionManager::new().map_err(|source| ServeError::Wakeup { source })?,
        );
        match &settings.endpoint {
            ServerEndpoint::Pipe { path } => {
                settings.endpoint.prepare_filesystem()?;
                let listener = PipeListener::bind(path)?;
                manager.install_listener(Arc::new(listener));
            }
            ServerEndpoint::Stdio => {
                manager.add_connection(Arc::new(Connection::stdio()));
            }
        }
        Ok(Arc::new(Self {
            manager,
            settings,
            engine,
            serve_thread: Mutex::new(None),
        }))
    }

    /// The connection manager, shared with management threads.
    #[must_use]
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Runs the event loop on the calling thread until the shutdown
    /// sequence completes.
    ///
    /// # Errors
    ///
    /// Returns a [`ServeError`] for watcher installation failures, wait
    /// primitive failures, or the unclean-exit invariant violation.
    pub fn serve(&self) -> Result<(), ServeError> {
        let watchers = Arc::new(
            SignalWatchers::install().map_err(|source| ServeError::Signals { source })?,
        );
        self.manager.install_signals(Arc::clone(&watchers));

        let mut dispatcher = Dispatcher::new(
            self.engine.clone(),
            self.settings.support_experimental,
            self.settings.debug_protocol,
        );

        info!(
            target: RUNTIME_TARGET,
            endpoint = %self.settings.endpoint,
            "serving"
        );

        // Endpoints wired before the loop starts (the stdio connection)
        // are greeted here; accepted pipe clients are greeted on accept.
        for connection in self.manager.connections() {
            if connection.state() == ConnectionState::Connecting {
                self.greet(&dispatcher, &connection);
            }
        }

        self.run_loop(&mut dispatcher, &watchers)?;

        let open_handles = self.manager.open_handle_count();
        if open_handles > 0 {
            error!(
                target: RUNTIME_TARGET,
                open_handles,
                "event loop stopped in unclean state"
            );
            return Err(ServeError::UncleanExit { open_handles });
        }
        info!(target: RUNTIME_TARGET, "server stopped");
        Ok(())
    }

    fn run_loop(
        &self,
        dispatcher: &mut Dispatcher,
        watchers: &SignalWatchers,
    ) -> Result<(), ServeError> {
        loop {
            if self.manager.is_torn_down() {
                return Ok(());
            }

            let listener = self.manager.listener();
            let connections: Vec<Arc<Connection>> = self
                .manager
                .connections()
                .into_iter()
                .filter(|connection| connection.pollable())
                .collect();

            let mut sources = Vec::with_capacity(4 + connections.len());
            let mut wait_set = Vec::with_capacity(4 + connections.len());
            sources.push(WaitSource::Wakeup);
            wait_set.push(PollFd::new(
                self.manager.wakeup().poll_fd(),
                PollFlags::POLLIN,
            ));
            sources.push(WaitSource::Interrupt);
            wait_set.push(PollFd::new(watchers.interrupt.poll_fd(), PollFlags::POLLIN));
            sources.push(WaitSource::Hangup);
            wait_set.push(PollFd::new(watchers.hangup.poll_fd(), PollFlags::POLLIN));
            if let Some(listener) = &listener {
                sources.push(WaitSource::Listener);
                wait_set.push(PollFd::new(listener.poll_fd(), PollFlags::POLLIN));
            }
            for (index, connection) in connections.iter().enumerate() {
                sources.push(WaitSource::Connection(index));
                wait_set.push(PollFd::new(connection.poll_fd(), PollFlags::POLLIN));
            }

            match poll(&mut wait_set, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(source) => return Err(ServeError::Poll { source }),
            }

            let ready_mask = PollFlags::POLLIN
                | PollFlags::POLLHUP
                | PollFlags::POLLERR
                | PollFlags::POLLNVAL;
            let ready: Vec<usize> = wait_set
                .iter()
                .enumerate()
                .filter(|(_, slot)| {
                    slot.revents()
                        .is_some_and(|revents| revents.intersects(ready_mask))
                })
                .map(|(index, _)| index)
                .collect();
            drop(wait_set);

            for index in ready {
                match sources[index] {
                    WaitSource::Wakeup => {
                        self.manager.wakeup().drain();
                        if self.manager.shutdown_requested() && !self.manager.is_torn_down() {
                            self.manager.start_shutdown();
                        }
                    }
                    WaitSource::Interrupt => {
                        if watchers.interrupt.drain() {
                            self.on_signal(watchers.interrupt.signal());
                        }
                    }
                    WaitSource::Hangup => {
                        if watchers.hangup.drain() {
                            self.on_signal(watchers.hangup.signal());
                        }
                    }
                    WaitSource::Listener => {
                        if let Some(listener) = &listener {
                            self.accept_pending(listener, dispatcher);
                        }
                    }
                    WaitSource::Connection(slot) => {
                        if let Some(connection) = connections.get(slot) {
                            self.service_connection(connection, dispatcher);
                        }
                    }
                }
            }
        }
    }

    /// Signal-watcher callback: any watched signal triggers the shutdown
    /// sequence on the loop thread.
    pub fn on_signal(&self, signal: i32) {
        info!(target: RUNTIME_TARGET, signal, "shutdown signal received");
        self.manager.start_shutdown();
    }

    fn accept_pending(&self, listener: &PipeListener, dispatcher: &Dispatcher) {
        loop {
            match listener.accept() {
                Ok(Some(stream)) => match Connection::pipe(stream) {
                    Ok(connection) => {
                        let connection = Arc::new(connection);
                        self.manager.add_connection(Arc::clone(&connection));
                        self.greet(dispatcher, &connection);
                    }
                    Err(accept_error) => {
                        warn!(
                            target: RUNTIME_TARGET,
                            error = %accept_error,
                            "failed to wrap accepted stream"
                        );
                    }
                },
                Ok(None) => break,
                Err(accept_error) => {
                    warn!(
                        target: RUNTIME_TARGET,
                        error = %accept_error,
                        "pipe accept error"
                    );
                    break;
                }
            }
        }
    }

    fn greet(&self, dispatcher: &Dispatcher, connection: &Arc<Connection>) {
        match dispatcher.greet(connection) {
            Ok(()) => {
                connection.mark_open();
                info!(
                    target: RUNTIME_TARGET,
                    kind = ?connection.kind(),
                    "client connected"
                );
            }
            Err(greet_error) => {
                warn!(
                    target: RUNTIME_TARGET,
                    error = %greet_error,
                    "failed to greet connection"
                );
                self.manager.on_disconnect(connection);
            }
        }
    }

    fn service_connection(&self, connection: &Arc<Connection>, dispatcher: &mut Dispatcher) {
        match connection.read_available() {
            Ok(outcome) => {
                for message in &outcome.messages {
                    dispatcher.process_request(connection, message);
                }
                if outcome.eof {
                    debug!(target: RUNTIME_TARGET, "peer closed connection");
                    self.manager.on_disconnect(connection);
                }
            }
            Err(read_error) => {
                warn!(
                    target: RUNTIME_TARGET,
                    error = %read_error,
                    "connection read failed"
                );
                self.manager.on_disconnect(connection);
            }
        }
    }

    /// Spawns the dedicated serve thread and returns immediately. The
    /// thread is joined by [`Server::close`].
    pub fn start_serve_thread(self: &Arc<Self>) {
        let server = Arc::clone(self);
        let handle = std::thread::spawn(move || server.serve());
        *self
            .serve_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Requests shutdown through the wakeup handle and joins the serve
    /// thread; runs the shutdown sequence directly when no thread was
    /// started.
    ///
    /// # Errors
    ///
    /// Returns the serve thread's result, or [`ServeError::ThreadPanic`]
    /// when it did not exit cleanly.
    pub fn close(&self) -> Result<(), ServeError> {
        let handle = self
            .serve_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => {
                self.manager.request_shutdown();
                match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(ServeError::ThreadPanic),
                }
            }
            None => {
                self.manager.start_shutdown();
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Server")
            .field("endpoint", &self.settings.endpoint)
            .finish_non_exhaustive()
    }
}
