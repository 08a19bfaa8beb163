//! Default values shared by the binaries.

use std::env;

use camino::Utf8PathBuf;

use crate::endpoint::ServerEndpoint;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Default log filter expression used by the binaries.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Computes the default endpoint: a pipe under the system temp directory.
#[must_use]
pub fn default_endpoint() -> ServerEndpoint {
    let base = Utf8PathBuf::from_path_buf(env::temp_dir())
        .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
    ServerEndpoint::pipe(base.join("kiln").join("kilnd.pipe"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_is_a_pipe() {
        let endpoint = default_endpoint();
        let path = endpoint.pipe_path().expect("pipe endpoint");
        assert!(path.as_str().ends_with("kilnd.pipe"));
    }
}
