//! Wire types for the kiln server protocol.
//!
//! Messages travel as JSON payloads wrapped in a newline-delimited envelope
//! bounded by magic marker lines. This crate owns the envelope framing state
//! machine, the JSON message shapes exchanged with clients, and the protocol
//! version types used during the handshake. It carries no I/O: the daemon
//! feeds raw bytes in and writes framed bytes out.

mod envelope;
mod message;
mod version;

pub use envelope::{END_MAGIC, EnvelopeFraming, FramingStrategy, START_MAGIC};
pub use message::ServerMessage;
pub use version::{ProtocolVersion, RequestedVersion, VersionParseError};
