//! Fingerprinters that force collisions.

use std::collections::HashSet;

use stmt_memo::{Fingerprint, Fingerprinter};

/// Fingerprint every colliding query maps to.
pub const COLLIDING_FINGERPRINT: Fingerprint = Fingerprint::from_bytes([0xAB; 32]);

/// Maps a chosen set of queries (or all of them) to one fingerprint.
///
/// Queries outside the set get their normal SHA-256 digest.
#[derive(Debug, Clone, Default)]
pub struct CollidingFingerprinter {
    colliding: Option<HashSet<String>>,
}

impl CollidingFingerprinter {
    /// Make every query collide.
    #[must_use]
    pub fn all() -> Self {
        Self { colliding: None }
    }

    /// Make only `queries` collide with each other.
    #[must_use]
    pub fn only<I, S>(queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            colliding: Some(queries.into_iter().map(Into::into).collect()),
        }
    }
}

impl Fingerprinter for CollidingFingerprinter {
    fn fingerprint(&self, query: &str) -> Fingerprint {
        match &self.colliding {
            Some(set) if !set.contains(query) => Fingerprint::of(query),
            _ => COLLIDING_FINGERPRINT,
        }
    }
}
