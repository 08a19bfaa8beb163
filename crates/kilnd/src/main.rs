//! Daemon entry point: flag parsing, telemetry, and the serve loop.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::{Mutex, PoisonError};

use clap::Parser;
use tracing::{error, info};

use kiln_config::{LogFormat, ServerEndpoint, Settings};
use kiln_eval::{ExecutionStatus, Invocation};
use kilnd::{EngineHandle, Server, initialise_telemetry};

/// The kiln protocol server.
#[derive(Debug, Parser)]
#[command(name = "kilnd", version, about = "kiln protocol server")]
struct Cli {
    /// Endpoint to serve on (`pipe://<path>` or `stdio://`).
    #[arg(long)]
    endpoint: Option<ServerEndpoint>,

    /// Log filter expression (overrides KILN_LOG).
    #[arg(long)]
    log_filter: Option<String>,

    /// Log output format (overrides KILN_LOG_FORMAT).
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Allow clients to negotiate experimental protocol versions.
    #[arg(long)]
    experimental: bool,

    /// Attach timing metadata to outgoing frames.
    #[arg(long)]
    debug_protocol: bool,
}

impl Cli {
    fn into_settings(self) -> Settings {
        let mut settings = Settings::default();
        if let Some(endpoint) = self.endpoint {
            settings.endpoint = endpoint;
        }
        if let Some(log_filter) = self.log_filter {
            settings.log_filter = log_filter;
        }
        if let Some(log_format) = self.log_format {
            settings.log_format = log_format;
        }
        settings.support_experimental = self.experimental;
        settings.debug_protocol = self.debug_protocol;
        settings
    }
}

/// Bootstrap engine glue: a variable table fed by `set` invocations.
/// The real evaluation engine is an external collaborator; this stands in
/// so the daemon is usable on its own.
fn bootstrap_engine() -> EngineHandle {
    let variables = std::sync::Arc::new(Mutex::new(HashMap::<String, String>::new()));
    let store = std::sync::Arc::clone(&variables);
    EngineHandle::new(
        move |invocation: &Invocation| {
            if invocation.lowercase_name() == "set" {
                let mut arguments = invocation.arguments.iter();
                let (Some(name), Some(value)) = (arguments.next(), arguments.next()) else {
                    return ExecutionStatus::Error(
                        "set requires a name and a value".to_owned(),
                    );
                };
                store
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name.value.clone(), value.value.clone());
                return ExecutionStatus::Continue;
            }
            info!(command = %invocation.name, line = invocation.line, "executed");
            ExecutionStatus::Continue
        },
        move |name| {
            variables
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(name)
                .cloned()
        },
    )
}

fn main() -> ExitCode {
    let settings = Cli::parse().into_settings();

    if initialise_telemetry(&settings).is_err() {
        return ExitCode::FAILURE;
    }

    let server = match Server::new(settings, bootstrap_engine()) {
        Ok(server) => server,
        Err(serve_error) => {
            error!(error = %serve_error, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(serve_error) => {
            error!(error = %serve_error, "server terminated abnormally");
            ExitCode::FAILURE
        }
    }
}
