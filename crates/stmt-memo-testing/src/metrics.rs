//! Metrics sink that records every event.

use parking_lot::Mutex;
use stmt_memo::{MemoMetrics, RemovalReason, StatementKind};

/// A recorded cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// A statement was created.
    Created(StatementKind),
    /// A request was served from the cache.
    Hit(StatementKind),
    /// An entry was removed.
    Evicted(RemovalReason),
}

/// [`MemoMetrics`] implementation that keeps events in memory.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    /// Number of occurrences of `event`.
    #[must_use]
    pub fn count(&self, event: MetricEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

impl MemoMetrics for RecordingMetrics {
    fn statement_created(&self, kind: StatementKind) {
        self.events.lock().push(MetricEvent::Created(kind));
    }

    fn cache_hit(&self, kind: StatementKind) {
        self.events.lock().push(MetricEvent::Hit(kind));
    }

    fn statement_evicted(&self, reason: RemovalReason) {
        self.events.lock().push(MetricEvent::Evicted(reason));
    }
}
