//! Mock database client for cache tests.
//!
//! Every handle the mock hands out is recorded, so tests can assert on how
//! many statements were prepared, which ones were closed, and whether any
//! handle was closed twice or used after close.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use stmt_memo::{Preparer, Statement, StatementKind};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};

/// Errors produced by the mock database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockError {
    /// The query was configured to be rejected.
    #[error("syntax error: {0}")]
    Rejected(String),

    /// The handle was configured to fail on close.
    #[error("close failed for statement {0}")]
    CloseFailed(u64),

    /// The handle was closed more than once.
    #[error("statement {0} closed twice")]
    DoubleClose(u64),

    /// The handle was used after being closed.
    #[error("statement {0} used after close")]
    UseAfterClose(u64),

    /// The preparation gate was shut down.
    #[error("mock database shut down")]
    Shutdown,
}

#[derive(Debug)]
struct HandleRecord {
    id: u64,
    query: String,
    kind: StatementKind,
    close_calls: AtomicUsize,
    fail_close: bool,
}

impl HandleRecord {
    fn is_closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }
}

/// A statement handle produced by [`MockDatabase`].
#[derive(Debug)]
pub struct MockStatement {
    record: Arc<HandleRecord>,
}

impl MockStatement {
    /// Unique id assigned at preparation.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id
    }

    /// Query text the handle was prepared from.
    #[must_use]
    pub fn query(&self) -> &str {
        &self.record.query
    }

    /// Variant of the handle.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.record.kind
    }

    /// Check whether close has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.record.is_closed()
    }

    /// Number of times close has been called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.record.close_calls.load(Ordering::SeqCst)
    }

    /// Simulate executing the statement.
    pub fn execute(&self) -> Result<(), MockError> {
        if self.is_closed() {
            return Err(MockError::UseAfterClose(self.record.id));
        }
        Ok(())
    }
}

impl Statement for MockStatement {
    type Error = MockError;

    fn close(&self) -> Result<(), MockError> {
        let previous = self.record.close_calls.fetch_add(1, Ordering::SeqCst);
        if previous > 0 {
            return Err(MockError::DoubleClose(self.record.id));
        }
        if self.record.fail_close {
            return Err(MockError::CloseFailed(self.record.id));
        }
        Ok(())
    }
}

/// Builder for [`MockDatabase`].
#[derive(Debug, Default)]
pub struct MockDatabaseBuilder {
    prepare_delay: Option<Duration>,
    rejected: HashMap<String, String>,
    close_failures: HashSet<String>,
    gated: bool,
}

impl MockDatabaseBuilder {
    /// Create a builder for a database that prepares everything instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` inside every preparation.
    #[must_use]
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = Some(delay);
        self
    }

    /// Reject preparation of `query` with `message`.
    #[must_use]
    pub fn with_rejected_query(mut self, query: impl Into<String>, message: impl Into<String>) -> Self {
        self.rejected.insert(query.into(), message.into());
        self
    }

    /// Make handles prepared from `query` fail when closed.
    #[must_use]
    pub fn with_close_failure(mut self, query: impl Into<String>) -> Self {
        self.close_failures.insert(query.into());
        self
    }

    /// Block every preparation until [`MockDatabase::release`] lets it
    /// through.
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gated = true;
        self
    }

    /// Build the database.
    #[must_use]
    pub fn build(self) -> MockDatabase {
        MockDatabase {
            prepare_delay: self.prepare_delay,
            rejected: self.rejected,
            close_failures: self.close_failures,
            gate: self.gated.then(|| Semaphore::new(0)),
            next_id: AtomicU64::new(1),
            started: AtomicUsize::new(0),
            started_notify: Notify::new(),
            handles: Mutex::new(Vec::new()),
        }
    }
}

/// In-memory stand-in for a connected database client.
#[derive(Debug)]
pub struct MockDatabase {
    prepare_delay: Option<Duration>,
    rejected: HashMap<String, String>,
    close_failures: HashSet<String>,
    gate: Option<Semaphore>,
    next_id: AtomicU64,
    started: AtomicUsize,
    started_notify: Notify,
    handles: Mutex<Vec<Arc<HandleRecord>>>,
}

impl Default for MockDatabase {
    fn default() -> Self {
        MockDatabaseBuilder::new().build()
    }
}

impl MockDatabase {
    /// Create a database that prepares everything instantly.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder.
    #[must_use]
    pub fn builder() -> MockDatabaseBuilder {
        MockDatabaseBuilder::new()
    }

    /// Let `n` gated preparations proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Wait until at least `n` preparations have started.
    pub async fn wait_for_started(&self, n: usize) {
        loop {
            let notified = self.started_notify.notified();
            if self.started.load(Ordering::SeqCst) >= n {
                return;
            }
            notified.await;
        }
    }

    /// Number of preparations that have started, including failed ones.
    #[must_use]
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of handles successfully prepared.
    #[must_use]
    pub fn created(&self) -> usize {
        self.handles.lock().len()
    }

    /// Number of handles prepared for `query` of the given kind.
    #[must_use]
    pub fn created_for(&self, query: &str, kind: StatementKind) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.query == query && h.kind == kind)
            .count()
    }

    /// Number of handles that have not been closed.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_closed()).count()
    }

    /// Number of handles that have been closed at least once.
    #[must_use]
    pub fn closed_handles(&self) -> usize {
        self.handles.lock().iter().filter(|h| h.is_closed()).count()
    }

    /// Number of handles closed more than once.
    #[must_use]
    pub fn double_closes(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.close_calls.load(Ordering::SeqCst) > 1)
            .count()
    }

    async fn make(&self, query: &str, kind: StatementKind) -> Result<MockStatement, MockError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.started_notify.notify_waiters();

        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| MockError::Shutdown)?.forget();
        }
        if let Some(delay) = self.prepare_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.rejected.get(query) {
            return Err(MockError::Rejected(message.clone()));
        }

        let record = Arc::new(HandleRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            query: query.to_string(),
            kind,
            close_calls: AtomicUsize::new(0),
            fail_close: self.close_failures.contains(query),
        });
        self.handles.lock().push(Arc::clone(&record));
        tracing::trace!(id = record.id, query, %kind, "mock statement prepared");
        Ok(MockStatement { record })
    }
}

#[async_trait::async_trait]
impl Preparer for MockDatabase {
    type Statement = MockStatement;
    type NamedStatement = MockStatement;
    type Error = MockError;

    async fn prepare(&self, query: &str) -> Result<MockStatement, MockError> {
        self.make(query, StatementKind::Positional).await
    }

    async fn prepare_named(&self, query: &str) -> Result<MockStatement, MockError> {
        self.make(query, StatementKind::Named).await
    }
}
