//! Observability hooks for the statement cache.
//!
//! The cache always keeps its own [`MemoStats`] counters. Applications that
//! export metrics plug a [`MemoMetrics`] implementation in as well; with the
//! `otel` feature enabled, [`OtelMetrics`] records OpenTelemetry counters.
//!
//! ## Metric names
//!
//! - `stmt_memo.prepared_statement_created`: one per statement actually
//!   prepared by the database client (cache miss), labelled by `kind`
//! - `stmt_memo.cache_hits`: one per request served from the cache,
//!   labelled by `kind`
//! - `stmt_memo.statements_evicted`: one per removed entry, labelled by
//!   `reason`

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::database::StatementKind;

/// Metric names following the `stmt_memo.*` namespace.
pub mod metric_names {
    /// Counter of statements created on a cache miss.
    pub const STATEMENT_CREATED: &str = "stmt_memo.prepared_statement_created";
    /// Counter of requests served from the cache.
    pub const CACHE_HITS: &str = "stmt_memo.cache_hits";
    /// Counter of entries removed from the cache.
    pub const STATEMENTS_EVICTED: &str = "stmt_memo.statements_evicted";
}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Least-recently-used eviction to make room for a new entry.
    Capacity,
    /// A different query text produced the same fingerprint.
    Collision,
    /// Explicit removal of a single query.
    Invalidated,
    /// The whole cache was purged or dropped.
    Purged,
}

impl RemovalReason {
    /// Label used in logs and metric attributes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Collision => "collision",
            Self::Invalidated => "invalidated",
            Self::Purged => "purged",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver for cache events.
///
/// All methods default to no-ops so implementations only override what they
/// export. Methods are called while the cache index is locked and must not
/// block.
pub trait MemoMetrics: Send + Sync {
    /// A new statement was prepared by the database client.
    fn statement_created(&self, _kind: StatementKind) {}

    /// A request was served by an existing handle.
    fn cache_hit(&self, _kind: StatementKind) {}

    /// An entry was removed and its handles closed.
    fn statement_evicted(&self, _reason: RemovalReason) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MemoMetrics for NoopMetrics {}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoStats {
    /// Requests served from the cache.
    pub hits: u64,
    /// Requests that found no usable handle.
    pub misses: u64,
    /// Statements actually prepared by the database client.
    pub created: u64,
    /// Entries removed by LRU eviction.
    pub evictions: u64,
    /// Entries replaced because of a fingerprint collision.
    pub collisions: u64,
    /// Handles that failed to close.
    pub close_failures: u64,
}

impl MemoStats {
    /// Cache hit ratio (0.0 to 1.0).
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    evictions: AtomicU64,
    collisions: AtomicU64,
    close_failures: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn removed(&self, reason: RemovalReason) {
        match reason {
            RemovalReason::Capacity => {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            RemovalReason::Collision => {
                self.collisions.fetch_add(1, Ordering::Relaxed);
            }
            RemovalReason::Invalidated | RemovalReason::Purged => {}
        }
    }

    pub(crate) fn close_failed(&self) {
        self.close_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
        }
    }
}

/// OpenTelemetry metrics sink.
#[cfg(feature = "otel")]
pub struct OtelMetrics {
    created: opentelemetry::metrics::Counter<u64>,
    hits: opentelemetry::metrics::Counter<u64>,
    evicted: opentelemetry::metrics::Counter<u64>,
}

#[cfg(feature = "otel")]
impl OtelMetrics {
    /// Build counters on the global meter provider.
    #[must_use]
    pub fn new() -> Self {
        Self::from_meter(&opentelemetry::global::meter("stmt-memo"))
    }

    /// Build counters on a specific meter.
    #[must_use]
    pub fn from_meter(meter: &opentelemetry::metrics::Meter) -> Self {
        Self {
            created: meter
                .u64_counter(metric_names::STATEMENT_CREATED)
                .with_description("Number of prepared statements created on cache miss")
                .build(),
            hits: meter
                .u64_counter(metric_names::CACHE_HITS)
                .with_description("Number of prepare requests served from the cache")
                .build(),
            evicted: meter
                .u64_counter(metric_names::STATEMENTS_EVICTED)
                .with_description("Number of cache entries removed and closed")
                .build(),
        }
    }
}

#[cfg(feature = "otel")]
impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "otel")]
impl MemoMetrics for OtelMetrics {
    fn statement_created(&self, kind: StatementKind) {
        self.created
            .add(1, &[opentelemetry::KeyValue::new("kind", kind.as_str())]);
    }

    fn cache_hit(&self, kind: StatementKind) {
        self.hits
            .add(1, &[opentelemetry::KeyValue::new("kind", kind.as_str())]);
    }

    fn statement_evicted(&self, reason: RemovalReason) {
        self.evicted
            .add(1, &[opentelemetry::KeyValue::new("reason", reason.as_str())]);
    }
}

#[cfg(feature = "otel")]
impl fmt::Debug for OtelMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelMetrics").finish_non_exhaustive()
    }
}
