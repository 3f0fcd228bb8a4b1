//! Cache error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::database::StatementKind;
use crate::fingerprint::Fingerprint;

/// Errors returned from [`StatementCache::prepare`](crate::StatementCache::prepare)
/// and [`StatementCache::prepare_named`](crate::StatementCache::prepare_named).
///
/// Only preparation problems surface here. Failures to close evicted handles
/// are logged and counted, never returned to the caller that triggered the
/// eviction.
#[derive(Debug, Error)]
pub enum MemoError<E> {
    /// The query text was empty.
    #[error("query text must not be empty")]
    EmptyQuery,

    /// The database client rejected the statement.
    #[error("statement preparation failed: {0}")]
    Prepare(#[source] E),

    /// Preparation did not finish within the configured timeout.
    #[error("statement preparation timed out after {0:?}")]
    Timeout(Duration),
}

impl<E> MemoError<E> {
    /// Get the driver error, if this is a preparation failure.
    #[must_use]
    pub fn prepare_error(&self) -> Option<&E> {
        match self {
            Self::Prepare(err) => Some(err),
            _ => None,
        }
    }

    /// Take the driver error, if this is a preparation failure.
    pub fn into_prepare_error(self) -> Option<E> {
        match self {
            Self::Prepare(err) => Some(err),
            _ => None,
        }
    }

    /// Check if the error came from the timeout configured on the cache.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A statement handle that failed to close.
///
/// The owning entry is removed from the cache regardless.
#[derive(Debug, Error)]
#[error("failed to close {kind} statement {fingerprint}: {source}")]
pub struct CloseFailure {
    /// Fingerprint of the entry the handle belonged to.
    pub fingerprint: Fingerprint,
    /// Query text the handle was prepared from.
    pub query: String,
    /// Which handle of the entry failed.
    pub kind: StatementKind,
    /// Error reported by the driver.
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Every close failure encountered while purging or removing entries.
#[derive(Debug)]
pub struct PurgeError {
    failures: Vec<CloseFailure>,
}

impl PurgeError {
    pub(crate) fn new(failures: Vec<CloseFailure>) -> Self {
        Self { failures }
    }

    /// All close failures, in the order they occurred.
    #[must_use]
    pub fn failures(&self) -> &[CloseFailure] {
        &self.failures
    }

    /// Consume the error and return the individual failures.
    #[must_use]
    pub fn into_failures(self) -> Vec<CloseFailure> {
        self.failures
    }
}

impl fmt::Display for PurgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} statement handle(s) failed to close",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PurgeError {}
