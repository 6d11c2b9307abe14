//! Protocol versioning for Relay.
//!
//! Clients only send the major version in their `connect` frame; the minor
//! version is informational and advertised by the server.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if a peer announcing `major` can talk to this version.
    #[must_use]
    pub fn accepts(&self, major: u8) -> bool {
        self.major == major
    }

    /// Negotiate against the major version a client announced.
    ///
    /// Returns the version to answer with, or `None` if the client must be
    /// rejected.
    #[must_use]
    pub fn negotiate(&self, client_major: u8) -> Option<Version> {
        self.accepts(client_major).then_some(*self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        let server = Version::new(1, 3);

        assert_eq!(server.negotiate(1), Some(server));
        assert_eq!(server.negotiate(2), None);
        assert_eq!(server.negotiate(0), None);
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
