//! Content hashing shared by documents, snapshots, and finding identities.

use serde::{Deserialize, Serialize};

/// blake3 digest of a document's bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw content.
    pub fn of(content: &[u8]) -> Self {
        Self(blake3::hash(content).to_hex().to_string())
    }

    /// Wrap an already computed hex digest (e.g. read back from a manifest).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and narrative reports.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable short key for a target path, used to name lock files and snapshot
/// directories without leaking path separators into file names.
pub fn target_key(target: &str) -> String {
    let hex = blake3::hash(target.as_bytes()).to_hex();
    hex[..16].to_string()
}
