//! JSON message shapes exchanged with clients.
//!
//! Every message carries a `type` discriminator. Replies, errors, progress
//! and message notifications echo the triggering request's `cookie` so
//! clients can correlate them; signals are server-scoped notifications with
//! no originating request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::ProtocolVersion;

/// Messages written by the server.
///
/// Serialised as a JSON object tagged by `type`, matching the wire shapes
/// read by clients:
///
/// ```json
/// {"type":"reply","inReplyTo":"evaluate","cookie":"1","executed":3}
/// {"type":"progress","progressMinimum":0,"progressCurrent":1,"progressMaximum":3,"message":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Greeting sent once when a connection opens, advertising the versions
    /// a handshake may request.
    Hello {
        /// Versions available for negotiation, oldest first.
        supported_protocol_versions: Vec<ProtocolVersion>,
    },
    /// Successful result of a request.
    Reply {
        /// `type` of the request this answers.
        in_reply_to: String,
        /// Correlation cookie echoed from the request.
        #[serde(skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
        /// Handler-specific result fields, merged into the object.
        #[serde(flatten)]
        payload: Map<String, Value>,
    },
    /// Failure result of a request, or a server-level fault.
    Error {
        /// Human-readable description of the failure.
        error_message: String,
        /// `type` of the request this answers, when one exists.
        #[serde(skip_serializing_if = "Option::is_none")]
        in_reply_to: Option<String>,
        /// Correlation cookie echoed from the request.
        #[serde(skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
    },
    /// Progress report for a long-running request.
    Progress {
        /// Lower bound of the progress range.
        progress_minimum: i64,
        /// Current position within the range.
        progress_current: i64,
        /// Upper bound of the progress range.
        progress_maximum: i64,
        /// Description of the work in flight.
        message: String,
        /// `type` of the request reporting progress.
        in_reply_to: String,
        /// Correlation cookie echoed from the request.
        #[serde(skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
    },
    /// Informational text tied to a request.
    Message {
        /// The text itself.
        message: String,
        /// Optional display title.
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        /// `type` of the request this message belongs to.
        in_reply_to: String,
        /// Correlation cookie echoed from the request.
        #[serde(skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
    },
    /// Server-scoped broadcast notification.
    Signal {
        /// Signal name.
        name: String,
        /// Free-form signal fields, merged into the object.
        #[serde(flatten)]
        fields: Map<String, Value>,
    },
}

impl ServerMessage {
    /// Builds the connection greeting.
    #[must_use]
    pub fn hello(versions: Vec<ProtocolVersion>) -> Self {
        Self::Hello {
            supported_protocol_versions: versions,
        }
    }

    /// Builds a reply to the named request type.
    #[must_use]
    pub fn reply(
        in_reply_to: impl Into<String>,
        cookie: Option<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self::Reply {
            in_reply_to: in_reply_to.into(),
            cookie,
            payload,
        }
    }

    /// Builds an error tied to the named request type, when one exists.
    #[must_use]
    pub fn error(
        message: impl Into<String>,
        in_reply_to: Option<String>,
        cookie: Option<String>,
    ) -> Self {
        Self::Error {
            error_message: message.into(),
            in_reply_to,
            cookie,
        }
    }

    /// Builds a progress report for the named request type.
    #[must_use]
    pub fn progress(
        in_reply_to: impl Into<String>,
        cookie: Option<String>,
        minimum: i64,
        current: i64,
        maximum: i64,
        message: impl Into<String>,
    ) -> Self {
        Self::Progress {
            progress_minimum: minimum,
            progress_current: current,
            progress_maximum: maximum,
            message: message.into(),
            in_reply_to: in_reply_to.into(),
            cookie,
        }
    }

    /// Builds an informational message for the named request type.
    #[must_use]
    pub fn message(
        in_reply_to: impl Into<String>,
        cookie: Option<String>,
        text: impl Into<String>,
        title: Option<String>,
    ) -> Self {
        Self::Message {
            message: text.into(),
            title,
            in_reply_to: in_reply_to.into(),
            cookie,
        }
    }

    /// Builds a broadcast signal.
    #[must_use]
    pub fn signal(name: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self::Signal {
            name: name.into(),
            fields,
        }
    }
}
