use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Strongly typed submission id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
pub struct Sid(pub Uuid);

impl Sid {
    pub fn new() -> Self {
        Sid(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Sid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lowercase hex sha256 digest naming file content.
///
/// The pipeline never touches file bytes, only digests; every queue payload
/// and store key that names a file goes through this type.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sha256(String);

impl Sha256 {
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.len() != 64
            || !normalized.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ModelError::InvalidSha256(raw.to_string()));
        }
        Ok(Sha256(normalized))
    }

    /// Digest of raw content, used by tests and intake shims.
    pub fn of_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256 as Hasher};
        let mut hasher = Hasher::new();
        hasher.update(data);
        Sha256(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deserialized digests bypass `parse`; intake re-checks them here.
    pub fn is_valid(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic fingerprint of a (file, service selection, parameters)
/// tuple. Two requests with the same scan key produce equivalent results, so
/// this is the unit of deduplication and score caching.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ScanKey(String);

impl ScanKey {
    /// Wrap a fingerprint already rendered as hex.
    pub(crate) fn from_digest(digest: String) -> Self {
        ScanKey(digest)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
