//! Resolved daemon settings.

use serde::{Deserialize, Serialize};

use crate::defaults::{default_endpoint, default_log_filter};
use crate::endpoint::ServerEndpoint;
use crate::logging::LogFormat;

/// Environment variable overriding the log filter expression.
pub const LOG_FILTER_ENV_VAR: &str = "KILN_LOG";

/// Environment variable overriding the log output format.
pub const LOG_FORMAT_ENV_VAR: &str = "KILN_LOG_FORMAT";

/// Fully resolved daemon settings.
///
/// The binaries assemble this from command-line flags with environment
/// fallbacks; library code only ever sees the resolved values.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    /// Transport endpoint to serve on.
    pub endpoint: ServerEndpoint,
    /// Log filter expression (`tracing` `EnvFilter` syntax).
    pub log_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Whether experimental protocol versions may be negotiated.
    pub support_experimental: bool,
    /// Whether wire frames carry debug timing metadata.
    pub debug_protocol: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            log_filter: resolved_log_filter(),
            log_format: resolved_log_format(),
            support_experimental: false,
            debug_protocol: false,
        }
    }
}

impl Settings {
    /// Log filter expression for telemetry initialisation.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Log output format for telemetry initialisation.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

fn resolved_log_filter() -> String {
    std::env::var(LOG_FILTER_ENV_VAR).unwrap_or_else(|_| default_log_filter().to_owned())
}

fn resolved_log_format() -> LogFormat {
    std::env::var(LOG_FORMAT_ENV_VAR)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default()
}
