//! End-to-end daemon behaviour over a pipe endpoint.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use kiln_config::{ServerEndpoint, Settings};
use kiln_eval::ExecutionStatus;
use kiln_protocol::{EnvelopeFraming, FramingStrategy};

use crate::{EngineHandle, Server};

fn test_settings(endpoint: ServerEndpoint) -> Settings {
    Settings {
        endpoint,
        log_filter: "info".to_owned(),
        log_format: kiln_config::LogFormat::Compact,
        support_experimental: false,
        debug_protocol: false,
    }
}

fn pipe_endpoint(dir: &tempfile::TempDir) -> ServerEndpoint {
    let path = dir.path().join("kilnd.pipe");
    ServerEndpoint::pipe(path.to_str().expect("utf8 path"))
}

fn recording_engine() -> (EngineHandle, Arc<Mutex<Vec<String>>>) {
    let executed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&executed);
    let engine = EngineHandle::new(
        move |invocation| {
            sink.lock().expect("lock").push(invocation.name.clone());
            ExecutionStatus::Continue
        },
        |name| (name == "answer").then(|| "42".to_owned()),
    );
    (engine, executed)
}

/// Wire-level client speaking the envelope protocol.
struct TestClient {
    stream: UnixStream,
    framing: EnvelopeFraming,
    buffer: Vec<u8>,
}

impl TestClient {
    fn connect(endpoint: &ServerEndpoint) -> Self {
        let path = endpoint.pipe_path().expect("pipe endpoint");
        let stream = UnixStream::connect(path.as_std_path()).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        Self {
            stream,
            framing: EnvelopeFraming::new(),
            buffer: Vec::new(),
        }
    }

    fn send(&mut self, payload: &str) {
        let frame = self.framing.frame_outgoing(payload);
        self.stream.write_all(&frame).expect("send frame");
    }

    /// Blocks until the next complete message arrives.
    fn next_message(&mut self) -> Value {
        let mut chunk = [0_u8; 4096];
        loop {
            if let Some(message) = self.framing.extract_message(&mut self.buffer) {
                return serde_json::from_str(&message).expect("message is JSON");
            }
            let count = self.stream.read(&mut chunk).expect("read");
            assert!(count > 0, "server closed the connection unexpectedly");
            self.buffer.extend_from_slice(&chunk[..count]);
        }
    }

    /// Reads until the server closes the stream.
    fn read_to_eof(&mut self) {
        let mut sink = Vec::new();
        let _ = self.stream.read_to_end(&mut sink);
    }
}

#[test]
fn full_session_over_a_pipe_endpoint() {
    let dir = tempfile::tempdir().expect("temp dir");
    let endpoint = pipe_endpoint(&dir);
    let (engine, executed) = recording_engine();
    let server = Server::new(test_settings(endpoint.clone()), engine).expect("server");
    server.start_serve_thread();

    let mut client = TestClient::connect(&endpoint);

    let hello = client.next_message();
    assert_eq!(hello["type"], json!("hello"));
    assert_eq!(
        hello["supportedProtocolVersions"],
        json!([{"major": 1, "minor": 0}, {"major": 1, "minor": 1}])
    );

    client.send(
        "{\"type\":\"handshake\",\"cookie\":\"1\",\
         \"protocolVersion\":{\"major\":1,\"minor\":0}}",
    );
    let reply = client.next_message();
    assert_eq!(reply["type"], json!("reply"));
    assert_eq!(reply["inReplyTo"], json!("handshake"));
    assert_eq!(reply["protocolVersion"], json!({"major": 1, "minor": 0}));

    client.send(
        "{\"type\":\"evaluate\",\"cookie\":\"2\",\
         \"source\":\"prepare()\\nemit(result)\\n\"}",
    );
    let mut progress_seen = 0;
    let evaluate_reply = loop {
        let message = client.next_message();
        match message["type"].as_str() {
            Some("progress") => {
                progress_seen += 1;
                assert_eq!(message["inReplyTo"], json!("evaluate"));
                assert_eq!(message["cookie"], json!("2"));
            }
            Some("reply") => break message,
            other => panic!("unexpected message type {other:?}"),
        }
    };
    assert_eq!(progress_seen, 2);
    assert_eq!(evaluate_reply["executed"], json!(2));
    assert_eq!(
        *executed.lock().expect("lock"),
        vec!["prepare".to_owned(), "emit".to_owned()]
    );

    client.send("{\"type\":\"resolve\",\"name\":\"answer\"}");
    let resolve_reply = client.next_message();
    assert_eq!(resolve_reply["value"], json!("42"));

    // Last client leaving triggers the shutdown sequence.
    drop(client);
    server.close().expect("clean close");
    assert!(server.manager().is_torn_down());
}

#[test]
fn dispatch_before_handshake_over_the_wire() {
    let dir = tempfile::tempdir().expect("temp dir");
    let endpoint = pipe_endpoint(&dir);
    let (engine, _) = recording_engine();
    let server = Server::new(test_settings(endpoint.clone()), engine).expect("server");
    server.start_serve_thread();

    let mut client = TestClient::connect(&endpoint);
    let hello = client.next_message();
    assert_eq!(hello["type"], json!("hello"));

    client.send("{\"type\":\"evaluate\",\"source\":\"emit(a)\\n\"}");
    let response = client.next_message();
    assert_eq!(response["type"], json!("error"));
    assert!(
        response["errorMessage"]
            .as_str()
            .expect("message")
            .contains("handshake")
    );

    drop(client);
    server.close().expect("clean close");
}

#[test]
fn malformed_payload_keeps_the_connection_alive() {
    let dir = tempfile::tempdir().expect("temp dir");
    let endpoint = pipe_endpoint(&dir);
    let (engine, _) = recording_engine();
    let server = Server::new(test_settings(endpoint.clone()), engine).expect("server");
    server.start_serve_thread();

    let mut client = TestClient::connect(&endpoint);
    let _hello = client.next_message();

    client.send("not json at all");
    let response = client.next_message();
    assert_eq!(response["type"], json!("error"));

    // The connection survives; a handshake still works afterwards.
    client.send("{\"type\":\"handshake\"}");
    let reply = client.next_message();
    assert_eq!(reply["type"], json!("reply"));
    assert_eq!(reply["inReplyTo"], json!("handshake"));

    drop(client);
    server.close().expect("clean close");
}

#[test]
fn close_tears_down_while_a_client_is_connected() {
    let dir = tempfile::tempdir().expect("temp dir");
    let endpoint = pipe_endpoint(&dir);
    let (engine, _) = recording_engine();
    let server = Server::new(test_settings(endpoint.clone()), engine).expect("server");
    server.start_serve_thread();

    let mut client = TestClient::connect(&endpoint);
    let _hello = client.next_message();

    server.close().expect("clean close");
    assert!(server.manager().is_torn_down());

    // The client observes the forced close as end of stream.
    client.read_to_eof();

    // Closing again is a no-op.
    server.close().expect("idempotent close");
}

#[test]
fn socket_file_is_removed_after_shutdown() {
    let dir = tempfile::tempdir().expect("temp dir");
    let endpoint = pipe_endpoint(&dir);
    let (engine, _) = recording_engine();
    let server = Server::new(test_settings(endpoint.clone()), engine).expect("server");
    server.start_serve_thread();

    let socket_path = endpoint.pipe_path().expect("pipe endpoint").to_owned();
    assert!(socket_path.as_std_path().exists());

    server.close().expect("clean close");
    assert!(
        !socket_path.as_std_path().exists(),
        "socket file removed on teardown"
    );
}
