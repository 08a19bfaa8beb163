//! Configuration types for the kiln daemon.
//!
//! The daemon reads one transport endpoint (a local pipe or the process
//! standard streams), logging settings, and two protocol switches
//! (experimental-version support and debug tracing of wire frames). This
//! crate owns the typed representations and their text forms; flag parsing
//! lives with the binaries.

mod defaults;
mod endpoint;
mod logging;
mod settings;

pub use defaults::{DEFAULT_LOG_FILTER, default_endpoint, default_log_filter};
pub use endpoint::{EndpointParseError, EndpointPreparationError, ServerEndpoint};
pub use logging::{LogFormat, LogFormatParseError};
pub use settings::{LOG_FILTER_ENV_VAR, LOG_FORMAT_ENV_VAR, Settings};
