//! Request deserialization for the dispatch loop.
//!
//! Every extracted envelope payload must be a JSON object carrying a
//! `type` discriminator and, optionally, a correlation `cookie`. The rest
//! of the object is kept verbatim for the active protocol handler.

use serde_json::{Map, Value};

use super::errors::DispatchError;

/// Parsed request from a client.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    kind: String,
    cookie: Option<String>,
    payload: Map<String, Value>,
}

impl ServerRequest {
    /// Parses one extracted message payload.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Parse`] when the payload is not a JSON
    /// object, lacks a `type` string, or carries a non-string `cookie`.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let value: Value = serde_json::from_str(raw).map_err(DispatchError::from_json_error)?;
        let Value::Object(payload) = value else {
            return Err(DispatchError::parse("request is not a JSON object"));
        };

        let kind = match payload.get("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind.clone(),
            Some(Value::String(_)) => {
                return Err(DispatchError::parse("request 'type' is empty"));
            }
            Some(_) => return Err(DispatchError::parse("request 'type' must be a string")),
            None => return Err(DispatchError::parse("request lacks a 'type' field")),
        };

        let cookie = match payload.get("cookie") {
            None | Some(Value::Null) => None,
            Some(Value::String(cookie)) => Some(cookie.clone()),
            Some(_) => return Err(DispatchError::parse("request 'cookie' must be a string")),
        };

        Ok(Self {
            kind,
            cookie,
            payload,
        })
    }

    /// The request type discriminator.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The correlation cookie, when present.
    #[must_use]
    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Owned copy of the correlation cookie for response echoing.
    #[must_use]
    pub fn cookie_owned(&self) -> Option<String> {
        self.cookie.clone()
    }

    /// A raw request field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// A request field narrowed to a string.
    #[must_use]
    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }
}
