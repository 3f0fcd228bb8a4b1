//! # stmt-memo
//!
//! Prepared statement memoization for relational database clients.
//!
//! A [`StatementCache`] sits in front of a database client and maps query
//! text to a previously prepared statement handle, so repeated calls with
//! identical SQL skip preparation. The cache is bounded by an LRU policy and
//! closes every handle it drops.
//!
//! ## Features
//!
//! - **Get-or-create**: [`StatementCache::prepare`] and
//!   [`StatementCache::prepare_named`] return a cached handle or prepare one
//! - **Bounded**: least recently used entries are closed and evicted
//! - **Collision-safe keys**: SHA-256 fingerprints, verified against the
//!   stored query text on every hit
//! - **Single-flight**: concurrent misses for one query prepare it once
//! - **Observability**: built-in counters plus a pluggable [`MemoMetrics`]
//!   sink (OpenTelemetry with the `otel` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stmt_memo::{MemoConfig, StatementCache};
//!
//! let cache = Arc::new(StatementCache::new(MemoConfig::new().capacity(512)));
//!
//! let entry = cache.prepare(&db, "SELECT * FROM users WHERE id = $1").await?;
//! let stmt = entry.statement().expect("positional handle");
//! // execute with stmt...
//!
//! // At shutdown
//! cache.purge().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod instrumentation;

pub use cache::{CacheEntry, EntryFor, StatementCache};
pub use config::{DEFAULT_CAPACITY, MemoConfig};
pub use database::{Preparer, Statement, StatementKind};
pub use error::{CloseFailure, MemoError, PurgeError};
pub use fingerprint::{Fingerprint, Fingerprinter, Sha256Fingerprinter};
#[cfg(feature = "otel")]
pub use instrumentation::OtelMetrics;
pub use instrumentation::{MemoMetrics, MemoStats, NoopMetrics, RemovalReason};
