//! Transport endpoint configuration.

use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Where the daemon accepts connections.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerEndpoint {
    /// Local named pipe (unix domain socket) endpoint.
    Pipe {
        /// Filesystem path of the pipe.
        path: Utf8PathBuf,
    },
    /// The process standard input/output streams.
    Stdio,
}

impl ServerEndpoint {
    /// Builds a pipe endpoint.
    #[must_use]
    pub fn pipe(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Pipe { path: path.into() }
    }

    /// Returns the pipe path when the endpoint uses the pipe transport.
    #[must_use]
    pub fn pipe_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Pipe { path } => Some(path.as_ref()),
            Self::Stdio => None,
        }
    }

    /// Ensures the pipe's parent directory exists with restrictive
    /// permissions. A no-op for the stdio transport.
    pub fn prepare_filesystem(&self) -> Result<(), EndpointPreparationError> {
        let Some(path) = self.pipe_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent() else {
            return Err(EndpointPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(parent.as_std_path())
            && source.kind() != std::io::ErrorKind::AlreadyExists
        {
            return Err(EndpointPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe { path } => write!(formatter, "pipe://{path}"),
            Self::Stdio => write!(formatter, "stdio://"),
        }
    }
}

impl FromStr for ServerEndpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if matches!(input, "stdio" | "stdio:" | "stdio://") {
            return Ok(Self::Stdio);
        }
        let url = Url::parse(input)?;
        match url.scheme() {
            "pipe" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingPipePath(input.to_owned()));
                }
                Ok(Self::pipe(path))
            }
            "stdio" => Ok(Self::Stdio),
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing a [`ServerEndpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not recognised.
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    /// Pipe endpoint was missing its path component.
    #[error("missing pipe path in '{0}'")]
    MissingPipePath(String),
    /// Input was not a valid URL.
    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Errors encountered while preparing the endpoint filesystem.
#[derive(Debug, Error)]
pub enum EndpointPreparationError {
    /// The pipe path lacked a parent directory.
    #[error("pipe path '{path}' has no parent directory")]
    MissingParent {
        /// Offending pipe path.
        path: Utf8PathBuf,
    },
    /// Creating the parent directory failed.
    #[error("failed to create directory '{path}': {source}")]
    CreateDirectory {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("stdio", ServerEndpoint::Stdio)]
    #[case("stdio://", ServerEndpoint::Stdio)]
    #[case("pipe:///tmp/kiln/kilnd.pipe", ServerEndpoint::pipe("/tmp/kiln/kilnd.pipe"))]
    fn parses_endpoint_strings(#[case] input: &str, #[case] expected: ServerEndpoint) {
        let parsed: ServerEndpoint = input.parse().expect("parse endpoint");
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_unknown_scheme() {
        let error = "tcp://localhost:1".parse::<ServerEndpoint>();
        assert!(matches!(
            error,
            Err(EndpointParseError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        let endpoint = ServerEndpoint::pipe("/run/kiln/kilnd.pipe");
        let reparsed: ServerEndpoint = endpoint.to_string().parse().expect("reparse");
        assert_eq!(reparsed, endpoint);
    }

    #[test]
    fn prepares_pipe_parent_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("kilnd.pipe");
        let endpoint = ServerEndpoint::pipe(path.to_str().expect("utf8 path"));
        endpoint.prepare_filesystem().expect("prepare");
        assert!(path.parent().expect("parent").is_dir());
    }

    #[test]
    fn stdio_preparation_is_a_no_op() {
        ServerEndpoint::Stdio.prepare_filesystem().expect("prepare");
    }
}
