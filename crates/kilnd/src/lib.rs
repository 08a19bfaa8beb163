//! The kiln protocol daemon.
//!
//! `kilnd` is a long-lived, process-local protocol server. It accepts
//! connections over a local pipe (unix domain socket) or the process
//! standard streams, extracts JSON payloads from a magic-marker envelope,
//! negotiates a protocol version per server instance, and forwards
//! evaluation work to an external engine through a pair of callbacks.
//!
//! One dedicated thread runs the reactor loop; every inbound callback is
//! serialised on it. A management thread may add or remove connections
//! and request shutdown, crossing into the loop through the connection
//! manager's lock and a wakeup handle. Shutdown is idempotent whatever
//! the trigger: an OS signal, the last client disconnecting, or an
//! explicit [`Server::close`].

mod connection;
mod dispatch;
mod engine;
mod manager;
mod runtime;
mod telemetry;

pub use connection::{
    Connection, ConnectionState, ListenerError, PipeListener, ReadOutcome, TransportKind,
};
pub use dispatch::{
    DispatchError, Dispatcher, HANDSHAKE_TYPE, NotificationSink, ProtocolHandler,
    ProtocolRegistry, ProtocolV1, ResponseWriter, ServerRequest,
};
pub use engine::EngineHandle;
pub use manager::ConnectionManager;
pub use runtime::{ServeError, Server};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
