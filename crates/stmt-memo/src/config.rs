//! Cache configuration.

use std::time::Duration;

/// Default maximum number of cached entries.
///
/// Used when no capacity is configured, or when the configured capacity is 0.
pub const DEFAULT_CAPACITY: usize = 256;

/// Configuration for a [`StatementCache`](crate::StatementCache).
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
#[non_exhaustive]
pub struct MemoConfig {
    /// Maximum number of cache entries. `0` means [`DEFAULT_CAPACITY`].
    ///
    /// An entry holds up to two handles (positional and named) for one query
    /// text and counts once.
    pub capacity: usize,

    /// Upper bound on a single preparation call.
    ///
    /// `None` leaves cancellation entirely to the caller, who can drop the
    /// future or wrap it in their own timeout.
    pub prepare_timeout: Option<Duration>,

    /// Compare query texts exactly instead of case-insensitively when
    /// verifying a fingerprint hit.
    pub case_sensitive: bool,
}

impl Default for MemoConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            prepare_timeout: None,
            case_sensitive: false,
        }
    }
}

impl MemoConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of cache entries.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the preparation timeout.
    #[must_use]
    pub fn prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = Some(timeout);
        self
    }

    /// Enable or disable case-sensitive query matching.
    #[must_use]
    pub fn case_sensitive(mut self, enabled: bool) -> Self {
        self.case_sensitive = enabled;
        self
    }

    /// Capacity actually used by the cache, with the zero fallback applied.
    #[must_use]
    pub fn effective_capacity(&self) -> usize {
        if self.capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        }
    }
}
