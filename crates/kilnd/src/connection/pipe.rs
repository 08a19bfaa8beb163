//! Pipe endpoint listener.
//!
//! Binds the unix domain socket backing a pipe endpoint, probing and
//! cleaning stale socket files left by a crashed daemon, and hands
//! accepted streams to the reactor without blocking it.

use std::fs;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use super::CONNECTION_TARGET;

/// Listener bound to a pipe endpoint path.
#[derive(Debug)]
pub struct PipeListener {
    path: Utf8PathBuf,
    listener: UnixListener,
}

impl PipeListener {
    /// Binds the listener, replacing a stale socket file when its previous
    /// owner is gone.
    ///
    /// # Errors
    ///
    /// Returns a [`ListenerError`] when the path is occupied by a live
    /// daemon, is not a socket, or cannot be bound.
    pub fn bind(path: &Utf8PathBuf) -> Result<Self, ListenerError> {
        probe_existing_socket(path.as_std_path())?;
        let listener =
            UnixListener::bind(path.as_std_path()).map_err(|source| ListenerError::Bind {
                path: path.clone(),
                source,
            })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ListenerError::NonBlocking { source })?;
        info!(
            target: CONNECTION_TARGET,
            path = %path,
            "pipe listener bound"
        );
        Ok(Self {
            path: path.clone(),
            listener,
        })
    }

    /// Accepts one pending stream, or `None` when no client is waiting.
    ///
    /// # Errors
    ///
    /// Returns the accept error; callers log and keep serving.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// File descriptor the reactor waits on.
    #[must_use]
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    /// Path the listener is bound to.
    #[must_use]
    pub fn path(&self) -> &Utf8PathBuf {
        &self.path
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(self.path.as_std_path())
            && error.kind() != io::ErrorKind::NotFound
        {
            warn!(
                target: CONNECTION_TARGET,
                path = %self.path,
                error = %error,
                "failed to remove pipe socket file"
            );
        }
    }
}

/// Probes an existing path before binding: live sockets are an error,
/// stale ones are removed.
fn probe_existing_socket(path: &Path) -> Result<(), ListenerError> {
    if !path.exists() {
        return Ok(());
    }
    let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::Metadata {
        path: path.display().to_string(),
        source,
    })?;
    if !metadata.file_type().is_socket() {
        return Err(ListenerError::NotSocket {
            path: path.display().to_string(),
        });
    }
    match UnixStream::connect(path) {
        Ok(_stream) => Err(ListenerError::InUse {
            path: path.display().to_string(),
        }),
        Err(error)
            if error.kind() == io::ErrorKind::ConnectionRefused
                || error.kind() == io::ErrorKind::NotFound =>
        {
            warn!(
                target: CONNECTION_TARGET,
                path = %path.display(),
                "removing stale pipe socket file"
            );
            fs::remove_file(path).map_err(|source| ListenerError::Cleanup {
                path: path.display().to_string(),
                source,
            })
        }
        Err(source) => Err(ListenerError::Probe {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// Errors raised while binding or operating the pipe listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding the socket failed.
    #[error("failed to bind pipe endpoint '{path}': {source}")]
    Bind {
        /// Endpoint path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Switching the listener to non-blocking mode failed.
    #[error("failed to configure pipe listener: {source}")]
    NonBlocking {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Reading metadata of an existing path failed.
    #[error("failed to inspect '{path}': {source}")]
    Metadata {
        /// Inspected path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The endpoint path exists and is not a socket.
    #[error("pipe endpoint path '{path}' exists and is not a socket")]
    NotSocket {
        /// Offending path.
        path: String,
    },
    /// Another daemon is serving on the endpoint.
    #[error("pipe endpoint '{path}' is already in use")]
    InUse {
        /// Occupied path.
        path: String,
    },
    /// Probing an existing socket failed.
    #[error("failed to probe existing socket '{path}': {source}")]
    Probe {
        /// Probed path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Removing a stale socket file failed.
    #[error("failed to remove stale socket '{path}': {source}")]
    Cleanup {
        /// Stale path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}
