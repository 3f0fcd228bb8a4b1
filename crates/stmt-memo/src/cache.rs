//! Prepared statement memoization with LRU eviction.
//!
//! This module caches prepared statements by a fingerprint of their query text
//! so that repeated calls with identical SQL reuse one handle instead of
//! preparing it again. The cache is bounded; evicted entries have their
//! handles closed before the call that caused the eviction returns.
//!
//! ## Lifecycle
//!
//! 1. A miss asks the database client to prepare the statement and stores the
//!    handle under the SHA-256 fingerprint of the query text
//! 2. Later calls with the same text return the stored handle
//! 3. Positional and named handles for one text share a single entry
//! 4. When the cache is full, the least recently used entry is closed and
//!    removed to make room
//! 5. A different text under the same fingerprint (a collision) closes and
//!    replaces the stored entry
//! 6. [`StatementCache::purge`] closes everything, typically at shutdown
//!
//! ## Concurrency
//!
//! The index lives behind a mutex that is never held across an `.await`.
//! Preparation runs outside it, serialized per fingerprint, so concurrent
//! misses for the same query create exactly one statement. `purge` waits for
//! in-flight preparations to finish before clearing, and new misses wait for
//! the purge. Hits never wait on it.
//!
//! Handles returned before a purge are closed by that purge, including a hit
//! that races it. Callers must not keep using an entry across shutdown.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use hashbrown::HashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::config::MemoConfig;
use crate::database::{Preparer, Statement, StatementKind};
use crate::error::{CloseFailure, MemoError, PurgeError};
use crate::fingerprint::{Fingerprint, Fingerprinter, Sha256Fingerprinter, query_matches};
use crate::instrumentation::{MemoMetrics, MemoStats, NoopMetrics, RemovalReason, StatsCounters};

/// A cached statement entry.
///
/// Holds the handles prepared for one query text. Values returned by the cache
/// are snapshots: they share the handles with the cache but a handle added
/// later (the other variant) only shows up in subsequent results.
pub struct CacheEntry<S, N> {
    fingerprint: Fingerprint,
    query: Arc<str>,
    statement: Option<Arc<S>>,
    named: Option<Arc<N>>,
}

/// The entry type produced for a given database client.
pub type EntryFor<D> = CacheEntry<<D as Preparer>::Statement, <D as Preparer>::NamedStatement>;

impl<S, N> CacheEntry<S, N> {
    /// Fingerprint the entry is stored under.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Query text the handles were prepared from.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Positional-parameter handle, if one has been prepared.
    #[must_use]
    pub fn statement(&self) -> Option<&Arc<S>> {
        self.statement.as_ref()
    }

    /// Named-parameter handle, if one has been prepared.
    #[must_use]
    pub fn named_statement(&self) -> Option<&Arc<N>> {
        self.named.as_ref()
    }

    /// Check whether the handle for `kind` is present.
    #[must_use]
    pub fn has(&self, kind: StatementKind) -> bool {
        match kind {
            StatementKind::Positional => self.statement.is_some(),
            StatementKind::Named => self.named.is_some(),
        }
    }
}

impl<S, N> Clone for CacheEntry<S, N> {
    fn clone(&self) -> Self {
        Self {
            fingerprint: self.fingerprint,
            query: Arc::clone(&self.query),
            statement: self.statement.clone(),
            named: self.named.clone(),
        }
    }
}

impl<S, N> fmt::Debug for CacheEntry<S, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("fingerprint", &self.fingerprint)
            .field("query", &self.query)
            .field("statement", &self.statement.is_some())
            .field("named", &self.named.is_some())
            .finish()
    }
}

/// A freshly prepared handle that is not in the cache yet.
enum Created<S, N> {
    Positional(S),
    Named(N),
}

struct CacheState<D: Preparer> {
    entries: LruCache<Fingerprint, EntryFor<D>>,
    /// Per-fingerprint preparation locks.
    in_flight: HashMap<Fingerprint, FlightSlot>,
}

#[derive(Default)]
struct FlightSlot {
    lock: Arc<AsyncMutex<()>>,
    members: usize,
}

/// LRU cache of prepared statements shared by all callers of one database.
///
/// The cache is an explicitly constructed object; share it by wrapping it in
/// an [`Arc`] and handing it to whatever needs it.
pub struct StatementCache<D: Preparer> {
    config: MemoConfig,
    capacity: NonZeroUsize,
    state: Mutex<CacheState<D>>,
    /// Held shared by every miss while it prepares and exclusively by `purge`.
    gate: RwLock<()>,
    fingerprinter: Box<dyn Fingerprinter>,
    metrics: Arc<dyn MemoMetrics>,
    stats: StatsCounters,
}

impl<D: Preparer> StatementCache<D> {
    /// Create a cache with the given configuration.
    #[must_use]
    pub fn new(config: MemoConfig) -> Self {
        let capacity = NonZeroUsize::new(config.effective_capacity()).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            capacity,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
            gate: RwLock::new(()),
            fingerprinter: Box::new(Sha256Fingerprinter),
            metrics: Arc::new(NoopMetrics),
            stats: StatsCounters::default(),
        }
    }

    /// Create a cache with the default capacity.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(MemoConfig::default())
    }

    /// Report cache events to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MemoMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the key derivation strategy.
    #[must_use]
    pub fn with_fingerprinter(mut self, fingerprinter: impl Fingerprinter + 'static) -> Self {
        self.fingerprinter = Box::new(fingerprinter);
        self
    }

    /// Return the cached positional statement for `query`, preparing it on a
    /// miss.
    ///
    /// Driver errors are returned unchanged inside [`MemoError::Prepare`] and
    /// leave the cache untouched. If admitting the new entry overflows the
    /// cache, the least recently used entry is closed before this returns.
    pub async fn prepare(&self, db: &D, query: &str) -> Result<EntryFor<D>, MemoError<D::Error>> {
        self.resolve(db, query, StatementKind::Positional).await
    }

    /// Return the cached named statement for `query`, preparing it on a miss.
    ///
    /// A positional handle already cached for the same text is kept; both
    /// variants live in one entry.
    pub async fn prepare_named(
        &self,
        db: &D,
        query: &str,
    ) -> Result<EntryFor<D>, MemoError<D::Error>> {
        self.resolve(db, query, StatementKind::Named).await
    }

    /// Close every cached handle and empty the cache.
    ///
    /// Waits for in-flight preparations first. Every close failure is
    /// reported; entries are removed regardless. Purging an empty cache is a
    /// no-op.
    pub async fn purge(&self) -> Result<(), PurgeError> {
        let _exclusive = self.gate.write().await;
        let failures = self.clear(RemovalReason::Purged);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PurgeError::new(failures))
        }
    }

    /// Close and remove the entry for `query`.
    ///
    /// Returns `Ok(false)` if the query was not cached.
    pub fn remove(&self, query: &str) -> Result<bool, PurgeError> {
        let fingerprint = self.fingerprinter.fingerprint(query);
        let mut state = self.state.lock();
        let cached = state
            .entries
            .peek(&fingerprint)
            .is_some_and(|entry| query_matches(&entry.query, query, self.config.case_sensitive));
        if !cached {
            return Ok(false);
        }

        let failures = self.discard(&mut state, fingerprint, RemovalReason::Invalidated);
        if failures.is_empty() {
            Ok(true)
        } else {
            Err(PurgeError::new(failures))
        }
    }

    /// Check whether `query` is cached, without updating recency.
    #[must_use]
    pub fn contains(&self, query: &str) -> bool {
        let fingerprint = self.fingerprinter.fingerprint(query);
        self.state
            .lock()
            .entries
            .peek(&fingerprint)
            .is_some_and(|entry| query_matches(&entry.query, query, self.config.case_sensitive))
    }

    /// Get the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Get the maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Get the cache configuration.
    #[must_use]
    pub fn config(&self) -> &MemoConfig {
        &self.config
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> MemoStats {
        self.stats.snapshot()
    }

    async fn resolve(
        &self,
        db: &D,
        query: &str,
        kind: StatementKind,
    ) -> Result<EntryFor<D>, MemoError<D::Error>> {
        if query.is_empty() {
            return Err(MemoError::EmptyQuery);
        }

        let fingerprint = self.fingerprinter.fingerprint(query);

        if let Some(entry) = self.lookup(fingerprint, query, kind) {
            return Ok(entry);
        }

        // Only the miss path is held off by a pending purge.
        let _shared = self.gate.read().await;
        let flight = self.join_flight(fingerprint);
        let _turn = flight.lock.lock().await;

        // Another caller may have prepared it while we waited.
        if let Some(entry) = self.lookup(fingerprint, query, kind) {
            return Ok(entry);
        }

        self.stats.miss();
        tracing::trace!(%fingerprint, %kind, "statement cache miss");

        let created = self.create(db, query, kind).await?;
        Ok(self.admit(fingerprint, query, created))
    }

    /// Find a usable handle, promoting the entry on a hit.
    ///
    /// A stored entry whose text differs from `query` is a collision and is
    /// closed and removed here.
    fn lookup(&self, fingerprint: Fingerprint, query: &str, kind: StatementKind) -> Option<EntryFor<D>> {
        let mut state = self.state.lock();
        let entry = state.entries.get(&fingerprint)?;

        if query_matches(&entry.query, query, self.config.case_sensitive) {
            if !entry.has(kind) {
                return None;
            }
            self.stats.hit();
            self.metrics.cache_hit(kind);
            tracing::trace!(%fingerprint, %kind, "statement cache hit");
            return Some(entry.clone());
        }

        tracing::debug!(
            %fingerprint,
            cached = %entry.query,
            incoming = query,
            "fingerprint collision, replacing cached statement"
        );
        self.discard_logged(&mut state, fingerprint, RemovalReason::Collision);
        None
    }

    async fn create(
        &self,
        db: &D,
        query: &str,
        kind: StatementKind,
    ) -> Result<Created<D::Statement, D::NamedStatement>, MemoError<D::Error>> {
        let work = async {
            match kind {
                StatementKind::Positional => db.prepare(query).await.map(Created::Positional),
                StatementKind::Named => db.prepare_named(query).await.map(Created::Named),
            }
        };

        let result = match self.config.prepare_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(query, ?limit, "statement preparation timed out");
                    return Err(MemoError::Timeout(limit));
                }
            },
            None => work.await,
        };

        match result {
            Ok(created) => {
                self.stats.created();
                self.metrics.statement_created(kind);
                Ok(created)
            }
            Err(err) => {
                tracing::debug!(query, %kind, error = %err, "statement preparation failed");
                Err(MemoError::Prepare(err))
            }
        }
    }

    /// Store a freshly prepared handle and return the resulting entry.
    fn admit(
        &self,
        fingerprint: Fingerprint,
        query: &str,
        created: Created<D::Statement, D::NamedStatement>,
    ) -> EntryFor<D> {
        let mut state = self.state.lock();

        if let Some(entry) = state.entries.get_mut(&fingerprint) {
            if query_matches(&entry.query, query, self.config.case_sensitive) {
                // Admission holds the fingerprint's flight turn and the
                // re-check saw no handle, so the slot is still empty.
                match created {
                    Created::Positional(stmt) => {
                        debug_assert!(entry.statement.is_none());
                        entry.statement = Some(Arc::new(stmt));
                    }
                    Created::Named(stmt) => {
                        debug_assert!(entry.named.is_none());
                        entry.named = Some(Arc::new(stmt));
                    }
                }
                return entry.clone();
            }
        }

        if state.entries.contains(&fingerprint) {
            self.discard_logged(&mut state, fingerprint, RemovalReason::Collision);
        }

        while state.entries.len() >= self.capacity.get() {
            let Some(lru) = state.entries.peek_lru().map(|(fp, _)| *fp) else {
                break;
            };
            self.discard_logged(&mut state, lru, RemovalReason::Capacity);
        }

        let (statement, named) = match created {
            Created::Positional(stmt) => (Some(Arc::new(stmt)), None),
            Created::Named(stmt) => (None, Some(Arc::new(stmt))),
        };
        let entry = CacheEntry {
            fingerprint,
            query: Arc::from(query),
            statement,
            named,
        };

        tracing::debug!(%fingerprint, query, "caching prepared statement");
        state.entries.put(fingerprint, entry.clone());
        entry
    }

    /// Close the handles of the entry under `fingerprint`, then remove it.
    ///
    /// The entry is removed even if closing fails.
    fn discard(
        &self,
        state: &mut CacheState<D>,
        fingerprint: Fingerprint,
        reason: RemovalReason,
    ) -> Vec<CloseFailure> {
        let Some(entry) = state.entries.peek(&fingerprint) else {
            return Vec::new();
        };

        let mut failures = Vec::new();
        if let Some(stmt) = &entry.statement {
            failures.extend(self.close_handle(
                stmt.as_ref(),
                fingerprint,
                &entry.query,
                StatementKind::Positional,
            ));
        }
        if let Some(stmt) = &entry.named {
            failures.extend(self.close_handle(
                stmt.as_ref(),
                fingerprint,
                &entry.query,
                StatementKind::Named,
            ));
        }
        tracing::debug!(%fingerprint, query = %entry.query, %reason, "closed cached statement");

        state.entries.pop(&fingerprint);
        self.stats.removed(reason);
        self.metrics.statement_evicted(reason);
        failures
    }

    /// Discard an entry the caller did not ask to remove; failures are only
    /// logged.
    fn discard_logged(&self, state: &mut CacheState<D>, fingerprint: Fingerprint, reason: RemovalReason) {
        for failure in self.discard(state, fingerprint, reason) {
            tracing::warn!(error = %failure, %reason, "failed to close evicted statement");
        }
    }

    fn close_handle<S: Statement>(
        &self,
        handle: &S,
        fingerprint: Fingerprint,
        query: &str,
        kind: StatementKind,
    ) -> Option<CloseFailure> {
        let err = handle.close().err()?;
        self.stats.close_failed();
        Some(CloseFailure {
            fingerprint,
            query: query.to_string(),
            kind,
            source: Box::new(err),
        })
    }

    fn clear(&self, reason: RemovalReason) -> Vec<CloseFailure> {
        let mut state = self.state.lock();
        let count = state.entries.len();
        let mut failures = Vec::new();
        while let Some(fingerprint) = state.entries.peek_lru().map(|(fp, _)| *fp) {
            failures.extend(self.discard(&mut state, fingerprint, reason));
        }
        if count > 0 {
            tracing::debug!(count, failed = failures.len(), "cleared statement cache");
        }
        failures
    }

    fn join_flight(&self, fingerprint: Fingerprint) -> Flight<'_, D> {
        let mut state = self.state.lock();
        let slot = state.in_flight.entry(fingerprint).or_default();
        slot.members += 1;
        Flight {
            cache: self,
            fingerprint,
            lock: Arc::clone(&slot.lock),
        }
    }
}

impl<D: Preparer> Default for StatementCache<D> {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl<D: Preparer> Drop for StatementCache<D> {
    fn drop(&mut self) {
        for failure in self.clear(RemovalReason::Purged) {
            tracing::warn!(error = %failure, "failed to close statement on cache drop");
        }
    }
}

impl<D: Preparer> fmt::Debug for StatementCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Membership in the preparation queue of one fingerprint.
///
/// Membership is counted with the index locked, so the last member leaving
/// can safely drop the map slot.
struct Flight<'a, D: Preparer> {
    cache: &'a StatementCache<D>,
    fingerprint: Fingerprint,
    lock: Arc<AsyncMutex<()>>,
}

impl<D: Preparer> Drop for Flight<'_, D> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock();
        let empty = match state.in_flight.get_mut(&self.fingerprint) {
            Some(slot) => {
                slot.members = slot.members.saturating_sub(1);
                slot.members == 0
            }
            None => false,
        };
        if empty {
            state.in_flight.remove(&self.fingerprint);
        }
    }
}
