//! Query text fingerprinting.
//!
//! Cache keys are SHA-256 digests of the exact query text. The digest alone is
//! never trusted: every entry keeps its source text and the cache compares it
//! on lookup, so a collision replaces the entry instead of serving the wrong
//! statement.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Deterministic digest of a query string, used as the cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest `query` with SHA-256.
    #[must_use]
    pub fn of(query: &str) -> Self {
        Self(Sha256::digest(query.as_bytes()).into())
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 8 bytes is plenty to tell entries apart in logs
        write!(f, "Fingerprint({}..)", hex::encode(&self.0[..8]))
    }
}

/// Strategy for deriving cache keys from query text.
///
/// Implementations must be deterministic and practically collision-resistant.
pub trait Fingerprinter: Send + Sync {
    /// Compute the fingerprint of `query`.
    fn fingerprint(&self, query: &str) -> Fingerprint;
}

/// Default fingerprinter backed by SHA-256.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, query: &str) -> Fingerprint {
        Fingerprint::of(query)
    }
}

/// Compare a stored query text against an incoming one.
///
/// Case-insensitive matching lowercases both sides character by character, so
/// it also holds for non-ASCII text.
#[must_use]
pub fn query_matches(stored: &str, incoming: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        return stored == incoming;
    }
    if stored.eq_ignore_ascii_case(incoming) {
        return true;
    }
    stored
        .chars()
        .flat_map(char::to_lowercase)
        .eq(incoming.chars().flat_map(char::to_lowercase))
}
