//! The version-negotiation handshake.
//!
//! Negotiation moves the server between `NoProtocol` and `Active(v)`:
//! a successful handshake constructs a fresh handler and installs it,
//! replacing any previous one; every failure path leaves the active
//! protocol exactly as it was. There is no automatic reversion to
//! `NoProtocol`.

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use kiln_protocol::{ProtocolVersion, RequestedVersion, ServerMessage};

use crate::connection::Connection;

use super::errors::DispatchError;
use super::request::ServerRequest;
use super::{DISPATCH_TARGET, Dispatcher, HANDSHAKE_TYPE};

impl Dispatcher {
    /// Runs the handshake for one request, writing the outcome to the
    /// originating connection.
    pub(super) fn negotiate(&mut self, connection: &Connection, request: &ServerRequest) {
        match self.try_negotiate(request) {
            Ok(version) => {
                info!(
                    target: DISPATCH_TARGET,
                    version = %version,
                    "protocol negotiated"
                );
                let mut payload = Map::new();
                payload.insert(
                    "protocolVersion".to_owned(),
                    json!({"major": version.major, "minor": version.minor}),
                );
                if self.support_experimental {
                    payload.insert("supportExperimental".to_owned(), json!(true));
                }
                let reply =
                    ServerMessage::reply(HANDSHAKE_TYPE, request.cookie_owned(), payload);
                if let Err(error) = self.writer.write(connection, &reply) {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %error,
                        "failed to write handshake reply"
                    );
                }
            }
            Err(error) => {
                warn!(target: DISPATCH_TARGET, error = %error, "handshake failed");
                if let Err(write_error) = self.writer.write_error(
                    connection,
                    &error,
                    Some(HANDSHAKE_TYPE.to_owned()),
                    request.cookie_owned(),
                ) {
                    warn!(
                        target: DISPATCH_TARGET,
                        error = %write_error,
                        "failed to write handshake error"
                    );
                }
            }
        }
    }

    /// Resolves, constructs, and activates the requested version. The
    /// previous handler is discarded only after the new one activates.
    fn try_negotiate(&mut self, request: &ServerRequest) -> Result<ProtocolVersion, DispatchError> {
        let requested = requested_version(request)?;
        let version =
            self.registry
                .resolve(requested.major, requested.minor, self.support_experimental)?;
        let mut handler = self.registry.construct(version).ok_or_else(|| {
            DispatchError::activation(version, "no handler factory registered")
        })?;
        handler.activate(request)?;
        self.active = Some(handler);
        Ok(version)
    }
}

/// Extracts the optional `protocolVersion` object from a handshake.
fn requested_version(request: &ServerRequest) -> Result<RequestedVersion, DispatchError> {
    match request.field("protocolVersion") {
        None | Some(Value::Null) => Ok(RequestedVersion::default()),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
            .map_err(|error| DispatchError::malformed_handshake(error.to_string())),
        Some(_) => Err(DispatchError::malformed_handshake(
            "'protocolVersion' must be an object",
        )),
    }
}
