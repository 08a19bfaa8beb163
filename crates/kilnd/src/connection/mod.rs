//! Connection endpoints served by the reactor loop.
//!
//! A connection couples one transport (a pipe stream or the process
//! standard streams) with an inbound byte accumulator and a framing
//! strategy. The reactor is the only reader; the connection manager and
//! the dispatcher write through `send_frame`. Lifecycle transitions move
//! strictly forward: Connecting → Open → ShuttingDown → Closed.

mod pipe;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::trace;

use kiln_protocol::{EnvelopeFraming, FramingStrategy};

pub use pipe::{ListenerError, PipeListener};

/// Tracing target for connection operations.
pub(crate) const CONNECTION_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::connection");

/// Chunk size for transport reads. Larger than the standard input handle's
/// internal buffer capacity so reads bypass it and the poll loop never
/// waits on bytes already buffered in-process.
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Transport kind of a connection endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Local named pipe (unix domain socket) stream.
    Pipe,
    /// The process standard input/output streams.
    Stdio,
}

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet greeted.
    Connecting,
    /// Serving requests.
    Open,
    /// Notified of shutdown; no further writes accepted.
    ShuttingDown,
    /// Transport closed.
    Closed,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::ShuttingDown,
            _ => Self::Closed,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::ShuttingDown => 2,
            Self::Closed => 3,
        }
    }
}

enum Transport {
    Pipe(UnixStream),
    Stdio(io::Stdin),
}

struct ReadState {
    buffer: Vec<u8>,
    framing: Box<dyn FramingStrategy>,
}

/// Messages extracted from one read event.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete messages in arrival order.
    pub messages: Vec<String>,
    /// Whether the peer closed its end of the transport.
    pub eof: bool,
}

/// One transport endpoint owned by the connection manager.
pub struct Connection {
    kind: TransportKind,
    transport: Transport,
    state: AtomicU8,
    read_state: Mutex<ReadState>,
}

impl Connection {
    /// Wraps an accepted pipe stream. The stream is switched to
    /// non-blocking mode so the reactor can drain it fully per event.
    pub fn pipe(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(TransportKind::Pipe, Transport::Pipe(stream)))
    }

    /// Wraps the process standard streams.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(TransportKind::Stdio, Transport::Stdio(io::stdin()))
    }

    fn new(kind: TransportKind, transport: Transport) -> Self {
        Self {
            kind,
            transport,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            read_state: Mutex::new(ReadState {
                buffer: Vec::new(),
                framing: Box::new(EnvelopeFraming::new()),
            }),
        }
    }

    /// Transport kind of this endpoint.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the reactor should wait on this endpoint.
    #[must_use]
    pub fn pollable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Open
        )
    }

    /// Marks the connection open once greeted. A no-op outside
    /// `Connecting`.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting.as_u8(),
            ConnectionState::Open.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Notifies the connection that the server is shutting down. Closed
    /// connections stay closed.
    pub fn notify_shutting_down(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ConnectionState::Closed.as_u8())
                    .then_some(ConnectionState::ShuttingDown.as_u8())
            });
    }

    /// Forces the transport closed. Pipe streams are shut down at the OS
    /// level; the standard streams cannot be revoked, so stdio close is a
    /// state transition that stops all polling and writing.
    pub fn force_close(&self) {
        self.state
            .store(ConnectionState::Closed.as_u8(), Ordering::SeqCst);
        if let Transport::Pipe(stream) = &self.transport {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// File descriptor the reactor waits on.
    #[must_use]
    pub fn poll_fd(&self) -> BorrowedFd<'_> {
        match &self.transport {
            Transport::Pipe(stream) => stream.as_fd(),
            Transport::Stdio(stdin) => stdin.as_fd(),
        }
    }

    /// Drains readable bytes and extracts every complete message.
    ///
    /// # Errors
    ///
    /// Returns the transport's IO error; the caller disconnects the
    /// connection in response.
    pub fn read_available(&self) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        let mut incoming = Vec::new();
        let mut chunk = vec![0_u8; READ_CHUNK_BYTES];

        match &self.transport {
            Transport::Pipe(stream) => loop {
                match (&*stream).read(&mut chunk) {
                    Ok(0) => {
                        outcome.eof = true;
                        break;
                    }
                    Ok(count) => incoming.extend_from_slice(&chunk[..count]),
                    Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                    Err(error) => return Err(error),
                }
            },
            Transport::Stdio(stdin) => {
                let mut lock = stdin.lock();
                match lock.read(&mut chunk) {
                    Ok(0) => outcome.eof = true,
                    Ok(count) => incoming.extend_from_slice(&chunk[..count]),
                    Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                    Err(error) => return Err(error),
                }
            }
        }

        let mut read_state = self
            .read_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        read_state.buffer.extend_from_slice(&incoming);
        let ReadState { buffer, framing } = &mut *read_state;
        while let Some(message) = framing.extract_message(buffer) {
            trace!(
                target: CONNECTION_TARGET,
                bytes = message.len(),
                "extracted message"
            );
            outcome.messages.push(message);
        }
        Ok(outcome)
    }

    /// Frames and writes one payload to the transport.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` when the connection no longer accepts
    /// writes, or the transport's IO error.
    pub fn send_frame(&self, payload: &str) -> io::Result<()> {
        if !matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection no longer accepts writes",
            ));
        }
        let frame = {
            let read_state = self
                .read_state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            read_state.framing.frame_outgoing(payload)
        };
        match &self.transport {
            Transport::Pipe(stream) => write_all_nonblocking(stream, &frame),
            Transport::Stdio(_) => {
                let stdout = io::stdout();
                let mut lock = stdout.lock();
                lock.write_all(&frame)?;
                lock.flush()
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Writes the whole buffer to a non-blocking stream, waiting for
/// writability between short writes.
fn write_all_nonblocking(stream: &UnixStream, mut remaining: &[u8]) -> io::Result<()> {
    while !remaining.is_empty() {
        match (&*stream).write(remaining) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport accepted no bytes",
                ));
            }
            Ok(count) => remaining = &remaining[count..],
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
                poll(&mut fds, PollTimeout::NONE).map_err(io::Error::from)?;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use kiln_protocol::{END_MAGIC, START_MAGIC};

    fn pipe_pair() -> (Connection, UnixStream) {
        let (server_end, client_end) = UnixStream::pair().expect("socket pair");
        let connection = Connection::pipe(server_end).expect("wrap connection");
        (connection, client_end)
    }

    #[test]
    fn starts_connecting_and_opens_once() {
        let (connection, _client) = pipe_pair();
        assert_eq!(connection.state(), ConnectionState::Connecting);
        connection.mark_open();
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn reads_framed_messages_from_the_peer() {
        let (connection, mut client) = pipe_pair();
        let wire = format!("{START_MAGIC}\n{{\"type\":\"ping\"}}\n{END_MAGIC}\n");
        client.write_all(wire.as_bytes()).expect("client write");

        let outcome = connection.read_available().expect("read");
        assert_eq!(outcome.messages, vec!["{\"type\":\"ping\"}".to_owned()]);
        assert!(!outcome.eof);
    }

    #[test]
    fn reports_eof_when_the_peer_disconnects() {
        let (connection, client) = pipe_pair();
        drop(client);
        let outcome = connection.read_available().expect("read");
        assert!(outcome.eof);
        assert!(outcome.messages.is_empty());
    }

    #[test]
    fn writes_enveloped_frames() {
        let (connection, mut client) = pipe_pair();
        connection.send_frame("{\"type\":\"hello\"}").expect("send");
        drop(connection);

        let mut received = Vec::new();
        client.read_to_end(&mut received).expect("client read");
        let text = String::from_utf8_lossy(&received).into_owned();
        assert!(text.contains(START_MAGIC));
        assert!(text.contains("{\"type\":\"hello\"}"));
        assert!(text.contains(END_MAGIC));
    }

    #[test]
    fn refuses_writes_after_shutdown_notice() {
        let (connection, _client) = pipe_pair();
        connection.notify_shutting_down();
        let error = connection.send_frame("{}").expect_err("must refuse");
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn force_close_is_terminal() {
        let (connection, _client) = pipe_pair();
        connection.force_close();
        connection.notify_shutting_down();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.pollable());
    }
}
