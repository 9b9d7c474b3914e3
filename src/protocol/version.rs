//! Wire protocol versioning
//!
//! Both handshake bodies carry the sender's version. The acceptor admits an
//! initiator when the major versions match and its own minor is not older.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Version spoken by this build
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// Protocol version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a peer speaking `other` can be served by this version
    ///
    /// - Major version must match exactly
    /// - Minor version of self must be >= other
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Accept `remote` or fail with [`Error::ProtocolVersion`]
    pub fn ensure_compatible(&self, remote: &ProtocolVersion) -> Result<()> {
        if self.is_compatible_with(remote) {
            Ok(())
        } else {
            Err(Error::ProtocolVersion {
                local: self.to_string(),
                remote: remote.to_string(),
            })
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
