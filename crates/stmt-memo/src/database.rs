//! Database client seams.
//!
//! The cache never opens connections. It only asks an already-connected client
//! to prepare statements and later closes the handles it was given.

use std::fmt;

/// A prepared statement handle owned by the cache.
///
/// `close` is synchronous so that it can run inside the cache's critical
/// section when an entry is evicted, replaced, or purged. Drivers whose
/// server-side release is asynchronous should queue the release here and
/// return immediately.
pub trait Statement: Send + Sync + 'static {
    /// Error returned when the handle cannot be released.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Release the underlying statement resource.
    fn close(&self) -> Result<(), Self::Error>;
}

/// A live database client able to prepare statements.
///
/// Uses `#[async_trait]` so that futures returned by the cache are `Send`
/// for any implementation and the trait stays usable as a trait object.
#[async_trait::async_trait]
pub trait Preparer: Send + Sync {
    /// Positional-parameter statement handle.
    type Statement: Statement;
    /// Named-parameter statement handle.
    type NamedStatement: Statement;
    /// Error returned by the driver when preparation fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Prepare a statement whose parameters are bound by position.
    async fn prepare(&self, query: &str) -> Result<Self::Statement, Self::Error>;

    /// Prepare a statement whose parameters are bound by name.
    async fn prepare_named(&self, query: &str) -> Result<Self::NamedStatement, Self::Error>;
}

/// Which statement variant an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Positional parameters (`?`, `$1`, `@p1`).
    Positional,
    /// Named parameters (`:name`).
    Named,
}

impl StatementKind {
    /// Label used in logs and metric attributes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positional => "positional",
            Self::Named => "named",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
