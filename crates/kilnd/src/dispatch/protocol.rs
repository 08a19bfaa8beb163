//! Protocol handlers and the version registry.
//!
//! A protocol handler is a capability: it reports its version, runs an
//! optional activation step, and handles one parsed request at a time.
//! Concrete handlers are selected from the version registry during
//! negotiation and constructed fresh on every successful handshake.

use std::cell::Cell;
use std::path::Path;

use serde_json::{Map, Value, json};

use kiln_eval::{Backtrace, Invocation, parse_file, parse_source};
use kiln_protocol::ProtocolVersion;

use crate::engine::EngineHandle;

use super::errors::DispatchError;
use super::request::ServerRequest;

/// Sink for notifications a handler emits while working on a request.
pub trait NotificationSink {
    /// Reports progress within `[minimum, maximum]`.
    fn progress(&self, minimum: i64, current: i64, maximum: i64, message: &str);

    /// Emits an informational message.
    fn message(&self, text: &str, title: Option<&str>);
}

/// One protocol version's request handler.
pub trait ProtocolHandler: Send {
    /// The version this handler implements.
    fn version(&self) -> ProtocolVersion;

    /// Activation step run after construction, before installation.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Activation`] when the handler cannot
    /// start; the previously active protocol stays installed.
    fn activate(&mut self, request: &ServerRequest) -> Result<(), DispatchError> {
        let _ = request;
        Ok(())
    }

    /// Handles one request, returning the reply payload.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] converted into an error response on the
    /// originating connection.
    fn handle(
        &mut self,
        request: &ServerRequest,
        sink: &dyn NotificationSink,
    ) -> Result<Map<String, Value>, DispatchError>;
}

type HandlerFactory = Box<dyn Fn(EngineHandle) -> Box<dyn ProtocolHandler> + Send>;

struct ProtocolEntry {
    version: ProtocolVersion,
    experimental: bool,
    factory: HandlerFactory,
}

/// Ordered table of negotiable protocol versions.
pub struct ProtocolRegistry {
    engine: EngineHandle,
    entries: Vec<ProtocolEntry>,
}

impl ProtocolRegistry {
    /// Creates an empty registry over the engine callbacks.
    #[must_use]
    pub const fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            entries: Vec::new(),
        }
    }

    /// Creates the registry carrying the daemon's stock protocols.
    #[must_use]
    pub fn with_default_protocols(engine: EngineHandle) -> Self {
        let mut registry = Self::new(engine);
        registry.register(ProtocolVersion::new(1, 0), false, |engine| {
            Box::new(ProtocolV1::new(0, engine))
        });
        registry.register(ProtocolVersion::new(1, 1), false, |engine| {
            Box::new(ProtocolV1::new(1, engine))
        });
        registry
    }

    /// Adds a version to the registry, keeping entries ordered.
    pub fn register(
        &mut self,
        version: ProtocolVersion,
        experimental: bool,
        factory: impl Fn(EngineHandle) -> Box<dyn ProtocolHandler> + Send + 'static,
    ) {
        self.entries.push(ProtocolEntry {
            version,
            experimental,
            factory: Box::new(factory),
        });
        self.entries.sort_by_key(|entry| entry.version);
    }

    /// Versions a client may negotiate, oldest first.
    #[must_use]
    pub fn advertised(&self, allow_experimental: bool) -> Vec<ProtocolVersion> {
        self.eligible(allow_experimental)
            .map(|entry| entry.version)
            .collect()
    }

    /// Resolves a handshake's requested version to a concrete supported
    /// version: an absent major selects the registry default, an absent
    /// minor selects the default minor for the requested major.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnsupportedVersion`] enumerating the
    /// supported set when no entry matches.
    pub fn resolve(
        &self,
        major: Option<u32>,
        minor: Option<u32>,
        allow_experimental: bool,
    ) -> Result<ProtocolVersion, DispatchError> {
        let supported = self.advertised(allow_experimental);
        let resolved = match major {
            None => self
                .eligible(allow_experimental)
                .map(|entry| entry.version)
                .next_back(),
            Some(major) => {
                // Default minor: the newest eligible minor of that major.
                let resolved_minor = minor.or_else(|| {
                    self.eligible(allow_experimental)
                        .filter(|entry| entry.version.major == major)
                        .map(|entry| entry.version.minor)
                        .next_back()
                });
                Some(ProtocolVersion::new(major, resolved_minor.unwrap_or(0)))
            }
        };
        let Some(requested) = resolved else {
            return Err(DispatchError::unsupported_version(
                ProtocolVersion::new(0, 0),
                supported,
            ));
        };
        let matched = self
            .eligible(allow_experimental)
            .any(|entry| entry.version == requested);
        if matched {
            Ok(requested)
        } else {
            Err(DispatchError::unsupported_version(requested, supported))
        }
    }

    /// Constructs a fresh handler for a previously resolved version.
    #[must_use]
    pub fn construct(&self, version: ProtocolVersion) -> Option<Box<dyn ProtocolHandler>> {
        self.entries
            .iter()
            .find(|entry| entry.version == version)
            .map(|entry| (entry.factory)(self.engine.clone()))
    }

    fn eligible(&self, allow_experimental: bool) -> impl DoubleEndedIterator<Item = &ProtocolEntry> {
        self.entries
            .iter()
            .filter(move |entry| allow_experimental || !entry.experimental)
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ProtocolRegistry")
            .field(
                "versions",
                &self
                    .entries
                    .iter()
                    .map(|entry| entry.version)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

/// The version 1 protocol family.
///
/// Minor 0 carries `evaluate` and `resolve`; minor 1 adds `parse`.
#[derive(Debug)]
pub struct ProtocolV1 {
    minor: u32,
    engine: EngineHandle,
}

impl ProtocolV1 {
    /// Creates the handler for a 1.x minor.
    #[must_use]
    pub const fn new(minor: u32, engine: EngineHandle) -> Self {
        Self { minor, engine }
    }

    fn evaluate(
        &self,
        request: &ServerRequest,
        sink: &dyn NotificationSink,
    ) -> Result<Map<String, Value>, DispatchError> {
        let program = load_program(request)?;
        let total = i64::try_from(program.invocations().len()).unwrap_or(i64::MAX);
        let position = Cell::new(0_i64);

        let executor = |invocation: &Invocation| {
            let current = position.get().saturating_add(1);
            position.set(current);
            sink.progress(
                0,
                current,
                total,
                &format!("executing {}", invocation.name),
            );
            self.engine.execute(invocation)
        };
        let resolver = |name: &str| self.engine.resolve(name);

        let summary = program
            .execute(&executor, &resolver, &Backtrace::empty())
            .map_err(|error| DispatchError::handler(error.to_string()))?;
        if summary.returned_early {
            sink.message("evaluation returned before the end of the program", None);
        }

        let value =
            serde_json::to_value(summary).map_err(|error| DispatchError::handler(error.to_string()))?;
        match value {
            Value::Object(payload) => Ok(payload),
            _ => Ok(Map::new()),
        }
    }

    fn resolve(&self, request: &ServerRequest) -> Result<Map<String, Value>, DispatchError> {
        let name = request
            .string_field("name")
            .ok_or_else(|| DispatchError::invalid_arguments("resolve requires a 'name' field"))?;
        let value = self
            .engine
            .resolve(name)
            .ok_or_else(|| DispatchError::handler(format!("variable '{name}' is not defined")))?;
        let mut payload = Map::new();
        payload.insert("name".to_owned(), json!(name));
        payload.insert("value".to_owned(), json!(value));
        Ok(payload)
    }

    fn parse_only(&self, request: &ServerRequest) -> Result<Map<String, Value>, DispatchError> {
        let program = load_program(request)?;
        let invocations = serde_json::to_value(program.invocations())
            .map_err(|error| DispatchError::handler(error.to_string()))?;
        let mut payload = Map::new();
        payload.insert("file".to_owned(), json!(program.file_name()));
        payload.insert("invocations".to_owned(), invocations);
        Ok(payload)
    }
}

impl ProtocolHandler for ProtocolV1 {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::new(1, self.minor)
    }

    fn handle(
        &mut self,
        request: &ServerRequest,
        sink: &dyn NotificationSink,
    ) -> Result<Map<String, Value>, DispatchError> {
        match request.kind() {
            "evaluate" => self.evaluate(request, sink),
            "resolve" => self.resolve(request),
            "parse" if self.minor >= 1 => self.parse_only(request),
            other => Err(DispatchError::unknown_operation(other, self.version())),
        }
    }
}

/// Loads the program a request names, inline source winning over a path.
fn load_program(
    request: &ServerRequest,
) -> Result<Box<dyn kiln_eval::SourceProgram>, DispatchError> {
    if let Some(source) = request.string_field("source") {
        let file_name = request.string_field("file").unwrap_or("<request>");
        return parse_source(source, file_name)
            .map_err(|error| DispatchError::handler(error.to_string()));
    }
    if let Some(path) = request.string_field("path") {
        return parse_file(Path::new(path))
            .map_err(|error| DispatchError::handler(error.to_string()));
    }
    Err(DispatchError::invalid_arguments(
        "request requires a 'source' or 'path' field",
    ))
}
