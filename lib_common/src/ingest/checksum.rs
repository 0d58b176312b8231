//! Content checksums for change detection.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of an exact byte sequence.
///
/// Whitespace-sensitive on purpose: reformatting the same data counts as a
/// change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Hashes `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Checksum(hex::encode(Sha256::digest(bytes)))
    }

    /// Rebuilds a checksum read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Checksum(hex.into())
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
