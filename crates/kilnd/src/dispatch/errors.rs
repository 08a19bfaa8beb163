//! Error types for request dispatch failures.
//!
//! Each variant maps to one failure mode of the dispatch pipeline and is
//! converted into a structured error response on the originating
//! connection. No dispatch failure ever closes a connection or leaks to
//! its siblings.

use thiserror::Error;

use kiln_protocol::ProtocolVersion;

/// Errors surfaced during request parsing and dispatch.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Message content was not a valid JSON request object.
    #[error("failed to parse request: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
        /// Underlying JSON error, when one exists.
        #[source]
        source: Option<serde_json::Error>,
    },

    /// A request arrived before any protocol version was negotiated.
    #[error("request '{kind}' rejected: no protocol version negotiated, send a handshake first")]
    HandshakeRequired {
        /// The rejected request type.
        kind: String,
    },

    /// Handshake payload did not match the expected shape.
    #[error("malformed handshake: {message}")]
    MalformedHandshake {
        /// Description of the shape mismatch.
        message: String,
    },

    /// Requested protocol version is not in the supported set.
    #[error(
        "protocol version {requested} is not supported (supported versions: {})",
        join_versions(.supported)
    )]
    UnsupportedVersion {
        /// The version the client asked for.
        requested: ProtocolVersion,
        /// Every version available for negotiation.
        supported: Vec<ProtocolVersion>,
    },

    /// A freshly constructed handler failed its activation step.
    #[error("failed to activate protocol version {version}: {message}")]
    Activation {
        /// Version whose handler refused to activate.
        version: ProtocolVersion,
        /// Handler-reported reason.
        message: String,
    },

    /// Request type is not an operation of the active protocol version.
    #[error("unknown request type '{kind}' for protocol version {version}")]
    UnknownOperation {
        /// The unrecognised request type.
        kind: String,
        /// The active protocol version.
        version: ProtocolVersion,
    },

    /// Request arguments were missing or of the wrong shape.
    #[error("invalid arguments: {message}")]
    InvalidArguments {
        /// Description of the argument problem.
        message: String,
    },

    /// The handler or the engine reported a failure.
    #[error("{message}")]
    Handler {
        /// Handler-reported message.
        message: String,
    },
}

impl DispatchError {
    /// Creates a parse error from a serde error.
    pub fn from_json_error(source: serde_json::Error) -> Self {
        Self::Parse {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Creates a parse error with a custom message.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a handshake-required error.
    pub fn handshake_required(kind: impl Into<String>) -> Self {
        Self::HandshakeRequired { kind: kind.into() }
    }

    /// Creates a malformed-handshake error.
    pub fn malformed_handshake(message: impl Into<String>) -> Self {
        Self::MalformedHandshake {
            message: message.into(),
        }
    }

    /// Creates an unsupported-version error.
    #[must_use]
    pub fn unsupported_version(
        requested: ProtocolVersion,
        supported: Vec<ProtocolVersion>,
    ) -> Self {
        Self::UnsupportedVersion {
            requested,
            supported,
        }
    }

    /// Creates an activation error.
    pub fn activation(version: ProtocolVersion, message: impl Into<String>) -> Self {
        Self::Activation {
            version,
            message: message.into(),
        }
    }

    /// Creates an unknown-operation error.
    pub fn unknown_operation(kind: impl Into<String>, version: ProtocolVersion) -> Self {
        Self::UnknownOperation {
            kind: kind.into(),
            version,
        }
    }

    /// Creates an invalid-arguments error.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Creates a handler-reported error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}

fn join_versions(versions: &[ProtocolVersion]) -> String {
    versions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
