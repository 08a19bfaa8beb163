//! Request dispatch for the daemon.
//!
//! The dispatcher owns the negotiation state machine and the active
//! protocol handler. Every extracted envelope payload flows through
//! [`Dispatcher::process_request`] on the loop thread: parse failures,
//! missing handshakes, and handler errors all become structured error
//! responses on the originating connection and never disturb its
//! siblings or the loop itself.
//!
//! ## Protocol
//!
//! A client opens with a handshake, optionally pinning a version:
//!
//! ```json
//! {"type":"handshake","cookie":"1","protocolVersion":{"major":1,"minor":0}}
//! ```
//!
//! and receives a reply echoing the negotiated version. Ordinary requests
//! are then routed to the active handler; progress and message
//! notifications echo the request's `cookie`, signals broadcast to every
//! open connection.

mod errors;
mod negotiation;
mod protocol;
mod request;
mod response;

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use kiln_protocol::{ProtocolVersion, ServerMessage};

use crate::connection::Connection;
use crate::engine::EngineHandle;
use crate::manager::ConnectionManager;

pub use errors::DispatchError;
pub use protocol::{NotificationSink, ProtocolHandler, ProtocolRegistry, ProtocolV1};
pub use request::ServerRequest;
pub use response::ResponseWriter;

/// Tracing target for dispatch operations.
pub(crate) const DISPATCH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dispatch");

/// Reserved request type that triggers negotiation.
pub const HANDSHAKE_TYPE: &str = "handshake";

/// Routes parsed requests to the active protocol handler.
///
/// Owned and driven exclusively by the loop thread; the active protocol
/// and the registry need no locking.
pub struct Dispatcher {
    registry: ProtocolRegistry,
    active: Option<Box<dyn ProtocolHandler>>,
    support_experimental: bool,
    writer: ResponseWriter,
}

impl Dispatcher {
    /// Creates a dispatcher over the daemon's stock protocol table.
    #[must_use]
    pub fn new(engine: EngineHandle, support_experimental: bool, debug_protocol: bool) -> Self {
        Self::with_registry(
            ProtocolRegistry::with_default_protocols(engine),
            support_experimental,
            debug_protocol,
        )
    }

    /// Creates a dispatcher over a caller-assembled registry.
    #[must_use]
    pub const fn with_registry(
        registry: ProtocolRegistry,
        support_experimental: bool,
        debug_protocol: bool,
    ) -> Self {
        Self {
            registry,
            active: None,
            support_experimental,
            writer: ResponseWriter::new(debug_protocol),
        }
    }

    /// The negotiated version, when one is active.
    #[must_use]
    pub fn active_version(&self) -> Option<ProtocolVersion> {
        self.active.as_ref().map(|handler| handler.version())
    }

    /// Writes the greeting advertising negotiable versions.
    ///
    /// # Errors
    ///
    /// Returns the transport's IO error.
    pub fn greet(&self, connection: &Connection) -> std::io::Result<()> {
        let hello = ServerMessage::hello(self.registry.advertised(self.support_experimental));
        self.writer.write(connection, &hello)
    }

    /// Processes one extracted message on the loop thread.
    pub fn process_request(&mut self, connection: &Arc<Connection>, raw: &str) {
        let request = match ServerRequest::parse(raw) {
            Ok(request) => request,
            Err(error) => {
                debug!(target: DISPATCH_TARGET, error = %error, "rejecting message");
                self.write_failure(connection, &error, None, None);
                return;
            }
        };

        debug!(
            target: DISPATCH_TARGET,
            kind = request.kind(),
            cookie = request.cookie().unwrap_or_default(),
            "dispatching request"
        );

        if request.kind() == HANDSHAKE_TYPE {
            self.negotiate(connection, &request);
            return;
        }

        if self.active.is_none() {
            let error = DispatchError::handshake_required(request.kind());
            self.write_failure(
                connection,
                &error,
                Some(request.kind().to_owned()),
                request.cookie_owned(),
            );
            return;
        }

        let Self { active, writer, .. } = self;
        if let Some(handler) = active.as_mut() {
            let sink = ConnectionSink {
                writer,
                connection: connection.as_ref(),
                in_reply_to: request.kind(),
                cookie: request.cookie_owned(),
            };
            match handler.handle(&request, &sink) {
                Ok(payload) => {
                    let reply =
                        ServerMessage::reply(request.kind(), request.cookie_owned(), payload);
                    if let Err(error) = writer.write(connection, &reply) {
                        warn!(target: DISPATCH_TARGET, error = %error, "failed to write reply");
                    }
                }
                Err(error) => {
                    let in_reply_to = Some(request.kind().to_owned());
                    let cookie = request.cookie_owned();
                    if let Err(write_error) =
                        writer.write_error(connection, &error, in_reply_to, cookie)
                    {
                        warn!(
                            target: DISPATCH_TARGET,
                            error = %write_error,
                            "failed to write error response"
                        );
                    }
                }
            }
        }
    }

    /// Broadcasts a server-scoped signal to every open connection.
    pub fn broadcast_signal(
        &self,
        manager: &ConnectionManager,
        name: &str,
        fields: Map<String, Value>,
    ) {
        self.writer.broadcast_signal(manager, name, fields);
    }

    fn write_failure(
        &self,
        connection: &Connection,
        error: &DispatchError,
        in_reply_to: Option<String>,
        cookie: Option<String>,
    ) {
        if let Err(write_error) = self
            .writer
            .write_error(connection, error, in_reply_to, cookie)
        {
            warn!(
                target: DISPATCH_TARGET,
                error = %write_error,
                "failed to write error response"
            );
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("active_version", &self.active_version())
            .field("support_experimental", &self.support_experimental)
            .finish_non_exhaustive()
    }
}

struct ConnectionSink<'a> {
    writer: &'a ResponseWriter,
    connection: &'a Connection,
    in_reply_to: &'a str,
    cookie: Option<String>,
}

impl NotificationSink for ConnectionSink<'_> {
    fn progress(&self, minimum: i64, current: i64, maximum: i64, message: &str) {
        let progress = ServerMessage::progress(
            self.in_reply_to,
            self.cookie.clone(),
            minimum,
            current,
            maximum,
            message,
        );
        if let Err(error) = self.writer.write(self.connection, &progress) {
            warn!(target: DISPATCH_TARGET, error = %error, "failed to write progress");
        }
    }

    fn message(&self, text: &str, title: Option<&str>) {
        let message = ServerMessage::message(
            self.in_reply_to,
            self.cookie.clone(),
            text,
            title.map(ToOwned::to_owned),
        );
        if let Err(error) = self.writer.write(self.connection, &message) {
            warn!(target: DISPATCH_TARGET, error = %error, "failed to write message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use serde_json::json;

    use kiln_eval::ExecutionStatus;
    use kiln_protocol::{EnvelopeFraming, FramingStrategy};

    use super::*;

    /// A dispatcher wired to one pipe connection and a client-side decoder.
    struct DispatchHarness {
        dispatcher: Dispatcher,
        connection: Arc<Connection>,
        client: UnixStream,
    }

    impl DispatchHarness {
        fn new(support_experimental: bool) -> Self {
            let engine = EngineHandle::new(
                |_| ExecutionStatus::Continue,
                |name| (name == "answer").then(|| "42".to_owned()),
            );
            Self::with_dispatcher(Dispatcher::new(engine, support_experimental, false))
        }

        fn with_dispatcher(dispatcher: Dispatcher) -> Self {
            let (server_end, client) = UnixStream::pair().expect("socket pair");
            client
                .set_read_timeout(Some(Duration::from_millis(300)))
                .expect("timeout");
            let connection = Arc::new(Connection::pipe(server_end).expect("wrap"));
            connection.mark_open();
            Self {
                dispatcher,
                connection,
                client,
            }
        }

        fn send(&mut self, raw: &str) {
            self.dispatcher.process_request(&self.connection, raw);
        }

        /// Decodes every response frame written so far, stopping once the
        /// stream falls silent.
        fn responses(&mut self) -> Vec<Value> {
            let mut framing = EnvelopeFraming::new();
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 4096];
            let mut messages = Vec::new();
            loop {
                match self.client.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        buffer.extend_from_slice(&chunk[..count]);
                        while let Some(message) = framing.extract_message(&mut buffer) {
                            messages.push(
                                serde_json::from_str(&message).expect("response is JSON"),
                            );
                        }
                    }
                }
            }
            messages
        }
    }

    #[test]
    fn handshake_installs_the_requested_version() {
        let mut harness = DispatchHarness::new(false);
        harness.send(
            "{\"type\":\"handshake\",\"cookie\":\"1\",\
             \"protocolVersion\":{\"major\":1,\"minor\":0}}",
        );

        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 0))
        );
        let responses = harness.responses();
        assert_eq!(responses[0]["type"], json!("reply"));
        assert_eq!(responses[0]["inReplyTo"], json!("handshake"));
        assert_eq!(responses[0]["cookie"], json!("1"));
        assert_eq!(responses[0]["protocolVersion"]["major"], json!(1));
        assert_eq!(responses[0]["protocolVersion"]["minor"], json!(0));
        assert!(responses[0].get("supportExperimental").is_none());
    }

    #[test]
    fn failed_negotiation_leaves_the_active_protocol_untouched() {
        let mut harness = DispatchHarness::new(false);
        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":1,\"minor\":0}}",
        );
        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":9,\"minor\":0}}",
        );

        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 0))
        );
        let responses = harness.responses();
        assert_eq!(responses[1]["type"], json!("error"));
        let text = responses[1]["errorMessage"].as_str().expect("message");
        assert!(text.contains("9.0"));
        assert!(text.contains("1.0, 1.1"));
    }

    #[test]
    fn renegotiation_replaces_the_active_protocol() {
        let mut harness = DispatchHarness::new(false);
        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":1,\"minor\":0}}",
        );
        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":1,\"minor\":1}}",
        );
        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 1))
        );
    }

    #[test]
    fn bare_handshake_selects_the_default_version() {
        let mut harness = DispatchHarness::new(false);
        harness.send("{\"type\":\"handshake\"}");
        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 1))
        );
    }

    #[test]
    fn major_without_minor_selects_the_default_minor() {
        let mut harness = DispatchHarness::new(false);
        harness.send("{\"type\":\"handshake\",\"protocolVersion\":{\"major\":1}}");
        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 1))
        );
    }

    #[test]
    fn experimental_flag_is_echoed_when_configured() {
        let mut harness = DispatchHarness::new(true);
        harness.send("{\"type\":\"handshake\"}");
        let responses = harness.responses();
        assert_eq!(responses[0]["supportExperimental"], json!(true));
    }

    #[test]
    fn dispatch_before_handshake_is_a_structured_error() {
        let mut harness = DispatchHarness::new(false);
        harness.send("{\"type\":\"evaluate\",\"cookie\":\"7\",\"source\":\"emit(a)\"}");

        assert_eq!(harness.dispatcher.active_version(), None);
        let responses = harness.responses();
        assert_eq!(responses[0]["type"], json!("error"));
        assert_eq!(responses[0]["inReplyTo"], json!("evaluate"));
        assert_eq!(responses[0]["cookie"], json!("7"));
        assert!(
            responses[0]["errorMessage"]
                .as_str()
                .expect("message")
                .contains("handshake")
        );
    }

    #[test]
    fn malformed_json_yields_a_parse_error_response() {
        let mut harness = DispatchHarness::new(false);
        harness.send("this is not json");
        let responses = harness.responses();
        assert_eq!(responses[0]["type"], json!("error"));
        assert!(responses[0].get("inReplyTo").is_none());
    }

    #[test]
    fn evaluate_streams_progress_then_replies() {
        let mut harness = DispatchHarness::new(false);
        harness.send("{\"type\":\"handshake\"}");
        harness.send(
            "{\"type\":\"evaluate\",\"cookie\":\"9\",\
             \"source\":\"first()\\nsecond()\\n\"}",
        );

        let responses = harness.responses();
        let progress: Vec<_> = responses
            .iter()
            .filter(|value| value["type"] == json!("progress"))
            .collect();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0]["progressCurrent"], json!(1));
        assert_eq!(progress[0]["progressMaximum"], json!(2));
        assert_eq!(progress[0]["inReplyTo"], json!("evaluate"));
        assert_eq!(progress[0]["cookie"], json!("9"));

        let reply = responses
            .iter()
            .find(|value| value["type"] == json!("reply") && value["inReplyTo"] == json!("evaluate"))
            .expect("evaluate reply");
        assert_eq!(reply["executed"], json!(2));
    }

    #[test]
    fn greeting_advertises_supported_versions() {
        let mut harness = DispatchHarness::new(false);
        harness
            .dispatcher
            .greet(&harness.connection)
            .expect("greet");
        let responses = harness.responses();
        assert_eq!(responses[0]["type"], json!("hello"));
        assert_eq!(
            responses[0]["supportedProtocolVersions"],
            json!([{"major": 1, "minor": 0}, {"major": 1, "minor": 1}])
        );
    }

    #[test]
    fn signals_broadcast_to_every_open_connection() {
        use crate::manager::ConnectionManager;

        let engine = EngineHandle::new(|_| ExecutionStatus::Continue, |_| None);
        let dispatcher = Dispatcher::new(engine, false, false);
        let manager = ConnectionManager::new().expect("manager");

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (server_end, client) = UnixStream::pair().expect("socket pair");
            client
                .set_read_timeout(Some(Duration::from_millis(300)))
                .expect("timeout");
            let connection = Arc::new(Connection::pipe(server_end).expect("wrap"));
            connection.mark_open();
            manager.add_connection(connection);
            clients.push(client);
        }

        let mut fields = Map::new();
        fields.insert("path".to_owned(), json!("/tmp/build.kiln"));
        dispatcher.broadcast_signal(&manager, "fileChange", fields);

        for client in &mut clients {
            let mut framing = EnvelopeFraming::new();
            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 4096];
            let signal = loop {
                if let Some(message) = framing.extract_message(&mut buffer) {
                    break serde_json::from_str::<Value>(&message).expect("signal JSON");
                }
                let count = client.read(&mut chunk).expect("read signal");
                buffer.extend_from_slice(&chunk[..count]);
            };
            assert_eq!(signal["type"], json!("signal"));
            assert_eq!(signal["name"], json!("fileChange"));
            assert_eq!(signal["path"], json!("/tmp/build.kiln"));
        }
    }

    #[test]
    fn activation_failure_keeps_the_previous_protocol() {
        struct RefusingHandler;
        impl ProtocolHandler for RefusingHandler {
            fn version(&self) -> ProtocolVersion {
                ProtocolVersion::new(3, 0)
            }
            fn activate(&mut self, _request: &ServerRequest) -> Result<(), DispatchError> {
                Err(DispatchError::activation(
                    ProtocolVersion::new(3, 0),
                    "refusing to start",
                ))
            }
            fn handle(
                &mut self,
                _request: &ServerRequest,
                _sink: &dyn NotificationSink,
            ) -> Result<Map<String, Value>, DispatchError> {
                Ok(Map::new())
            }
        }

        let engine = EngineHandle::new(|_| ExecutionStatus::Continue, |_| None);
        let mut registry = ProtocolRegistry::with_default_protocols(engine);
        registry.register(ProtocolVersion::new(3, 0), false, |_| {
            Box::new(RefusingHandler)
        });
        let mut harness =
            DispatchHarness::with_dispatcher(Dispatcher::with_registry(registry, false, false));

        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":1,\"minor\":0}}",
        );
        harness.send(
            "{\"type\":\"handshake\",\"protocolVersion\":{\"major\":3,\"minor\":0}}",
        );

        assert_eq!(
            harness.dispatcher.active_version(),
            Some(ProtocolVersion::new(1, 0))
        );
        let responses = harness.responses();
        assert!(
            responses[1]["errorMessage"]
                .as_str()
                .expect("message")
                .contains("refusing to start")
        );
    }
}
