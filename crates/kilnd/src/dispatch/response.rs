//! Response serialization for the dispatch loop.
//!
//! The writer turns [`ServerMessage`] values into wire JSON and hands the
//! payload to the connection's framing. With debug tracing enabled the
//! serialised envelope gains a `zzzDebug` object carrying timing and size
//! metadata; the logical payload is never altered.

use std::io;
use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::warn;

use kiln_protocol::ServerMessage;

use crate::connection::{Connection, ConnectionState};
use crate::manager::ConnectionManager;

use super::DISPATCH_TARGET;
use super::errors::DispatchError;

/// Serialises server messages onto connections.
#[derive(Debug, Clone, Copy)]
pub struct ResponseWriter {
    debug: bool,
}

impl ResponseWriter {
    /// Creates a writer; `debug` controls the timing metadata.
    #[must_use]
    pub const fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Writes one message to a connection.
    ///
    /// # Errors
    ///
    /// Returns the transport's IO error; callers treat it as a
    /// connection-scoped failure.
    pub fn write(&self, connection: &Connection, message: &ServerMessage) -> io::Result<()> {
        let payload = self.serialise(message)?;
        connection.send_frame(&payload)
    }

    /// Writes a dispatch failure as a structured error response.
    ///
    /// # Errors
    ///
    /// Returns the transport's IO error.
    pub fn write_error(
        &self,
        connection: &Connection,
        error: &DispatchError,
        in_reply_to: Option<String>,
        cookie: Option<String>,
    ) -> io::Result<()> {
        let message = ServerMessage::error(error.to_string(), in_reply_to, cookie);
        self.write(connection, &message)
    }

    /// Broadcasts a signal to every open connection. Per-connection write
    /// failures are logged and skipped; a broadcast never fails as a whole.
    pub fn broadcast_signal(
        &self,
        manager: &ConnectionManager,
        name: &str,
        fields: Map<String, Value>,
    ) {
        let message = ServerMessage::signal(name, fields);
        manager.broadcast(|connection| {
            if connection.state() != ConnectionState::Open {
                return;
            }
            if let Err(error) = self.write(connection, &message) {
                warn!(
                    target: DISPATCH_TARGET,
                    signal = name,
                    error = %error,
                    "failed to write signal"
                );
            }
        });
    }

    fn serialise(&self, message: &ServerMessage) -> io::Result<String> {
        if !self.debug {
            return serde_json::to_string(message).map_err(io::Error::other);
        }
        let started = Instant::now();
        let mut value = serde_json::to_value(message).map_err(io::Error::other)?;
        let body = serde_json::to_string(&value).map_err(io::Error::other)?;
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        if let Value::Object(object) = &mut value {
            object.insert(
                "zzzDebug".to_owned(),
                json!({
                    "frameBytes": body.len(),
                    "serialiseMicros": micros,
                }),
            );
        }
        serde_json::to_string(&value).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_writer_serialises_the_message_alone() {
        let writer = ResponseWriter::new(false);
        let message = ServerMessage::error("oops", None, None);
        let payload = writer.serialise(&message).expect("serialise");
        let value: Value = serde_json::from_str(&payload).expect("json");
        assert!(value.get("zzzDebug").is_none());
        assert_eq!(value["errorMessage"], "oops");
    }

    #[test]
    fn debug_writer_attaches_metadata_without_touching_the_payload() {
        let writer = ResponseWriter::new(true);
        let message = ServerMessage::error("oops", None, None);
        let payload = writer.serialise(&message).expect("serialise");
        let value: Value = serde_json::from_str(&payload).expect("json");
        assert_eq!(value["errorMessage"], "oops");
        assert_eq!(value["type"], "error");
        let debug = value.get("zzzDebug").expect("metadata");
        assert!(debug.get("frameBytes").is_some());
        assert!(debug.get("serialiseMicros").is_some());
    }
}
