//! Protocol version types used during the handshake.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A negotiated protocol version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProtocolVersion {
    /// Major version; incompatible revisions bump this.
    pub major: u32,
    /// Minor version; additive revisions bump this.
    pub minor: u32,
}

impl ProtocolVersion {
    /// Builds a version from its parts.
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (major, minor) = input
            .split_once('.')
            .ok_or_else(|| VersionParseError::MissingSeparator(input.to_owned()))?;
        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| VersionParseError::InvalidComponent(input.to_owned()))
        };
        Ok(Self::new(parse(major)?, parse(minor)?))
    }
}

/// Errors encountered while parsing a [`ProtocolVersion`] from text.
#[derive(Debug, Error)]
pub enum VersionParseError {
    /// Input did not contain a `major.minor` separator.
    #[error("missing '.' separator in protocol version '{0}'")]
    MissingSeparator(String),
    /// Major or minor component was not a non-negative integer.
    #[error("invalid numeric component in protocol version '{0}'")]
    InvalidComponent(String),
}

/// The version a handshake request asks for.
///
/// Both parts are optional on the wire: a missing minor resolves to the
/// server's default minor for the requested major, and a fully absent
/// version resolves to the server's default version.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RequestedVersion {
    /// Requested major version, if any.
    pub major: Option<u32>,
    /// Requested minor version, if any.
    pub minor: Option<u32>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1.0", ProtocolVersion::new(1, 0))]
    #[case("10.42", ProtocolVersion::new(10, 42))]
    fn parses_dotted_versions(#[case] input: &str, #[case] expected: ProtocolVersion) {
        let parsed: ProtocolVersion = input.parse().expect("parse version");
        assert_eq!(parsed, expected);
    }

    #[rstest]
    #[case::no_separator("1")]
    #[case::negative("-1.0")]
    #[case::alpha("one.zero")]
    fn rejects_malformed_versions(#[case] input: &str) {
        assert!(input.parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn orders_by_major_then_minor() {
        assert!(ProtocolVersion::new(1, 1) > ProtocolVersion::new(1, 0));
        assert!(ProtocolVersion::new(2, 0) > ProtocolVersion::new(1, 9));
    }

    #[test]
    fn serialises_as_object() {
        let value = serde_json::to_value(ProtocolVersion::new(1, 2)).expect("serialise");
        assert_eq!(value, serde_json::json!({"major": 1, "minor": 2}));
    }

    #[test]
    fn requested_version_accepts_partial_fields() {
        let requested: RequestedVersion =
            serde_json::from_str("{\"major\": 1}").expect("deserialise");
        assert_eq!(requested.major, Some(1));
        assert_eq!(requested.minor, None);
    }
}
