//! Statement cache behavior tests against the mock database.
//!
//! Run with:
//! ```bash
//! cargo test -p stmt-memo-testing --test cache_behavior
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use stmt_memo::{MemoConfig, MemoError, RemovalReason, StatementCache, StatementKind};
use stmt_memo_testing::fixtures::{distinct_queries, init_tracing};
use stmt_memo_testing::{
    CollidingFingerprinter, MetricEvent, MockDatabase, MockError, RecordingMetrics,
};
use tokio_test::{assert_err, assert_ok};

fn cache(capacity: usize) -> StatementCache<MockDatabase> {
    init_tracing();
    StatementCache::new(MemoConfig::new().capacity(capacity))
}

// =============================================================================
// Memoization
// =============================================================================

#[tokio::test]
async fn test_repeated_prepare_creates_once() {
    let db = MockDatabase::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let cache = cache(8).with_metrics(metrics.clone());

    let first = assert_ok!(cache.prepare(&db, "SELECT * FROM users WHERE id = $1").await);
    for _ in 0..10 {
        let again = assert_ok!(cache.prepare(&db, "SELECT * FROM users WHERE id = $1").await);
        assert!(Arc::ptr_eq(
            first.statement().unwrap(),
            again.statement().unwrap()
        ));
    }

    assert_eq!(db.created(), 1);
    assert_eq!(metrics.count(MetricEvent::Created(StatementKind::Positional)), 1);
    assert_eq!(metrics.count(MetricEvent::Hit(StatementKind::Positional)), 10);

    let stats = cache.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 10);
}

#[tokio::test]
async fn test_positional_and_named_share_one_entry() {
    let db = MockDatabase::new();
    let cache = cache(8);

    let positional = cache.prepare(&db, "SELECT 1").await.unwrap();
    assert!(positional.named_statement().is_none());

    let both = cache.prepare_named(&db, "SELECT 1").await.unwrap();
    assert_eq!(cache.len(), 1);
    assert!(Arc::ptr_eq(
        positional.statement().unwrap(),
        both.statement().unwrap()
    ));
    assert_eq!(both.named_statement().unwrap().kind(), StatementKind::Named);

    // both halves are now hits
    cache.prepare(&db, "SELECT 1").await.unwrap();
    cache.prepare_named(&db, "SELECT 1").await.unwrap();
    assert_eq!(db.created_for("SELECT 1", StatementKind::Positional), 1);
    assert_eq!(db.created_for("SELECT 1", StatementKind::Named), 1);
    assert_eq!(db.open_handles(), 2);
}

#[tokio::test]
async fn test_named_first_then_positional() {
    let db = MockDatabase::new();
    let cache = cache(8);

    let named = cache.prepare_named(&db, "SELECT :id").await.unwrap();
    assert!(named.statement().is_none());

    let both = cache.prepare(&db, "SELECT :id").await.unwrap();
    assert!(Arc::ptr_eq(
        named.named_statement().unwrap(),
        both.named_statement().unwrap()
    ));
    assert!(both.statement().is_some());
    assert_eq!(db.created(), 2);
}

#[tokio::test]
async fn test_empty_query_never_reaches_database() {
    let db = MockDatabase::new();
    let cache = cache(8);

    assert!(matches!(
        cache.prepare_named(&db, "").await,
        Err(MemoError::EmptyQuery)
    ));
    assert_eq!(db.started(), 0);
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_capacity_overflow_evicts_exactly_one() {
    let db = MockDatabase::new();
    let cache = cache(4);
    let queries = distinct_queries(5);

    let mut entries = Vec::new();
    for q in &queries {
        entries.push(cache.prepare(&db, q).await.unwrap());
        assert!(cache.len() <= 4);
    }

    assert_eq!(cache.len(), 4);
    assert_eq!(db.closed_handles(), 1);
    assert!(entries[0].statement().unwrap().is_closed());
    assert!(entries[1..].iter().all(|e| !e.statement().unwrap().is_closed()));
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test]
async fn test_lru_scenario_capacity_two() {
    let db = MockDatabase::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let cache = cache(2).with_metrics(metrics.clone());

    let a = cache.prepare(&db, "A").await.unwrap();
    let b = cache.prepare(&db, "B").await.unwrap();
    let c = cache.prepare(&db, "C").await.unwrap();

    assert!(a.statement().unwrap().is_closed());
    assert!(!cache.contains("A"));
    assert!(cache.contains("B"));
    assert!(cache.contains("C"));

    let a2 = cache.prepare(&db, "A").await.unwrap();
    assert_ne!(a.statement().unwrap().id(), a2.statement().unwrap().id());
    assert!(b.statement().unwrap().is_closed());
    assert!(!c.statement().unwrap().is_closed());
    assert!(!cache.contains("B"));
    assert!(cache.contains("C"));
    assert!(cache.contains("A"));

    assert_eq!(db.created_for("A", StatementKind::Positional), 2);
    assert_eq!(metrics.count(MetricEvent::Evicted(RemovalReason::Capacity)), 2);
}

#[tokio::test]
async fn test_eviction_closes_both_variants() {
    let db = MockDatabase::new();
    let cache = cache(1);

    cache.prepare(&db, "SELECT 1").await.unwrap();
    let entry = cache.prepare_named(&db, "SELECT 1").await.unwrap();
    assert_eq!(cache.len(), 1);

    cache.prepare(&db, "SELECT 2").await.unwrap();

    assert!(entry.statement().unwrap().is_closed());
    assert!(entry.named_statement().unwrap().is_closed());
    assert_eq!(db.double_closes(), 0);
}

#[tokio::test]
async fn test_hit_refreshes_recency() {
    let db = MockDatabase::new();
    let cache = cache(2);

    cache.prepare(&db, "A").await.unwrap();
    cache.prepare(&db, "B").await.unwrap();
    cache.prepare(&db, "A").await.unwrap();
    cache.prepare(&db, "C").await.unwrap();

    assert!(cache.contains("A"));
    assert!(!cache.contains("B"));
}

#[tokio::test]
async fn test_evicted_handle_reports_use_after_close() {
    let db = MockDatabase::new();
    let cache = cache(1);

    let old = cache.prepare(&db, "SELECT 1").await.unwrap();
    assert_ok!(old.statement().unwrap().execute());

    cache.prepare(&db, "SELECT 2").await.unwrap();
    let err = assert_err!(old.statement().unwrap().execute());
    assert!(matches!(err, MockError::UseAfterClose(_)));
}

#[tokio::test]
async fn test_close_failure_during_eviction_is_not_raised() {
    let db = MockDatabase::builder().with_close_failure("SELECT 1").build();
    let cache = cache(1);

    cache.prepare(&db, "SELECT 1").await.unwrap();
    let entry = assert_ok!(cache.prepare(&db, "SELECT 2").await);

    assert_eq!(entry.query(), "SELECT 2");
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains("SELECT 1"));
    assert_eq!(cache.stats().close_failures, 1);
}

// =============================================================================
// Collisions
// =============================================================================

#[tokio::test]
async fn test_collision_replaces_entry() {
    let db = MockDatabase::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let cache = cache(8)
        .with_fingerprinter(CollidingFingerprinter::only(["SELECT 1", "SELECT 2"]))
        .with_metrics(metrics.clone());

    let q1 = cache.prepare(&db, "SELECT 1").await.unwrap();
    let q2 = cache.prepare(&db, "SELECT 2").await.unwrap();

    assert!(q1.statement().unwrap().is_closed());
    assert_eq!(q2.statement().unwrap().query(), "SELECT 2");
    assert!(!q2.statement().unwrap().is_closed());
    assert_eq!(q1.fingerprint(), q2.fingerprint());
    assert_eq!(cache.len(), 1);

    // Q1 comes back: re-created, never reused
    let q1_again = cache.prepare(&db, "SELECT 1").await.unwrap();
    assert_ne!(q1.statement().unwrap().id(), q1_again.statement().unwrap().id());
    assert_eq!(q1_again.statement().unwrap().query(), "SELECT 1");
    assert!(q2.statement().unwrap().is_closed());

    assert_eq!(db.created_for("SELECT 1", StatementKind::Positional), 2);
    assert_eq!(cache.stats().collisions, 2);
    assert_eq!(metrics.count(MetricEvent::Evicted(RemovalReason::Collision)), 2);
    assert_eq!(db.double_closes(), 0);
}

#[tokio::test]
async fn test_collision_closes_every_handle_of_superseded_entry() {
    let db = MockDatabase::new();
    let cache = cache(8).with_fingerprinter(CollidingFingerprinter::all());

    cache.prepare(&db, "SELECT 1").await.unwrap();
    let q1 = cache.prepare_named(&db, "SELECT 1").await.unwrap();

    cache.prepare_named(&db, "SELECT 2").await.unwrap();

    assert!(q1.statement().unwrap().is_closed());
    assert!(q1.named_statement().unwrap().is_closed());
    assert_eq!(db.open_handles(), 1);
}

#[tokio::test]
async fn test_unrelated_queries_unaffected_by_collision() {
    let db = MockDatabase::new();
    let cache = cache(8).with_fingerprinter(CollidingFingerprinter::only(["A", "B"]));

    let other = cache.prepare(&db, "C").await.unwrap();
    cache.prepare(&db, "A").await.unwrap();
    cache.prepare(&db, "B").await.unwrap();

    assert!(!other.statement().unwrap().is_closed());
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn test_case_insensitive_match_under_same_fingerprint() {
    let db = MockDatabase::new();
    let cache = cache(8).with_fingerprinter(CollidingFingerprinter::all());

    let upper = cache.prepare(&db, "SELECT 1").await.unwrap();
    let lower = cache.prepare(&db, "select 1").await.unwrap();

    assert!(Arc::ptr_eq(
        upper.statement().unwrap(),
        lower.statement().unwrap()
    ));
    assert_eq!(db.created(), 1);
}

#[tokio::test]
async fn test_case_sensitive_config_treats_case_as_collision() {
    let db = MockDatabase::new();
    let cache = StatementCache::new(MemoConfig::new().capacity(8).case_sensitive(true))
        .with_fingerprinter(CollidingFingerprinter::all());

    let upper = cache.prepare(&db, "SELECT 1").await.unwrap();
    cache.prepare(&db, "select 1").await.unwrap();

    assert!(upper.statement().unwrap().is_closed());
    assert_eq!(db.created(), 2);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_prepare_failure_propagates_unchanged() {
    let db = MockDatabase::builder()
        .with_rejected_query("SELEC 1", "near \"SELEC\"")
        .build();
    let cache = cache(8);

    let err = cache.prepare(&db, "SELEC 1").await.unwrap_err();
    assert_eq!(
        err.into_prepare_error(),
        Some(MockError::Rejected("near \"SELEC\"".into()))
    );
    assert!(cache.is_empty());
    assert_eq!(cache.stats().created, 0);

    // nothing was cached, so the next attempt asks the database again
    assert_err!(cache.prepare(&db, "SELEC 1").await);
    assert_eq!(db.started(), 2);
}

#[tokio::test]
async fn test_failed_named_prepare_keeps_positional() {
    let db = MockDatabase::new();
    let cache = cache(8);
    let entry = cache.prepare(&db, "SELECT 1").await.unwrap();

    let failing = MockDatabase::builder()
        .with_rejected_query("SELECT 1", "named params unsupported")
        .build();
    assert_err!(cache.prepare_named(&failing, "SELECT 1").await);

    assert!(cache.contains("SELECT 1"));
    assert!(!entry.statement().unwrap().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_prepare_timeout() {
    let db = MockDatabase::builder()
        .with_prepare_delay(Duration::from_secs(10))
        .build();
    let cache = StatementCache::new(
        MemoConfig::new()
            .capacity(8)
            .prepare_timeout(Duration::from_millis(100)),
    );

    let err = cache.prepare(&db, "SELECT pg_sleep(10)").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(cache.is_empty());
    assert_eq!(db.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_prepare_leaves_no_entry() {
    let db = MockDatabase::builder().gated().build();
    let cache = cache(8);

    let attempt = tokio::time::timeout(Duration::from_millis(50), cache.prepare(&db, "SELECT 1")).await;
    assert!(attempt.is_err());
    assert!(cache.is_empty());

    // the in-flight slot was released, so a later call can proceed
    db.release(1);
    let entry = cache.prepare(&db, "SELECT 1").await.unwrap();
    assert_eq!(entry.query(), "SELECT 1");
    assert_eq!(cache.len(), 1);
}

// =============================================================================
// Purge
// =============================================================================

#[tokio::test]
async fn test_purge_closes_everything_and_is_idempotent() {
    let db = MockDatabase::new();
    let metrics = Arc::new(RecordingMetrics::new());
    let cache = cache(8).with_metrics(metrics.clone());

    for q in distinct_queries(3) {
        cache.prepare(&db, &q).await.unwrap();
    }
    cache.prepare_named(&db, "SELECT 0").await.unwrap();

    assert_ok!(cache.purge().await);
    assert!(cache.is_empty());
    assert_eq!(db.open_handles(), 0);
    let closed = db.closed_handles();

    assert_ok!(cache.purge().await);
    assert_eq!(db.closed_handles(), closed);
    assert_eq!(db.double_closes(), 0);
    assert_eq!(metrics.count(MetricEvent::Evicted(RemovalReason::Purged)), 3);
}

#[tokio::test]
async fn test_purge_reports_all_close_failures() {
    let db = MockDatabase::builder()
        .with_close_failure("SELECT 1")
        .with_close_failure("SELECT 2")
        .build();
    let cache = cache(8);

    cache.prepare(&db, "SELECT 1").await.unwrap();
    cache.prepare(&db, "SELECT 2").await.unwrap();
    cache.prepare(&db, "SELECT 3").await.unwrap();

    let err = cache.purge().await.unwrap_err();
    let mut failed: Vec<_> = err.failures().iter().map(|f| f.query.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, ["SELECT 1", "SELECT 2"]);
    assert!(cache.is_empty());

    assert_ok!(cache.purge().await);
}

#[tokio::test]
async fn test_cache_usable_after_purge() {
    let db = MockDatabase::new();
    let cache = cache(8);

    let before = cache.prepare(&db, "SELECT 1").await.unwrap();
    cache.purge().await.unwrap();
    let after = cache.prepare(&db, "SELECT 1").await.unwrap();

    assert_ne!(before.statement().unwrap().id(), after.statement().unwrap().id());
    assert!(!after.statement().unwrap().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_purge_waits_for_in_flight_prepare() {
    let db = Arc::new(MockDatabase::builder().gated().build());
    let cache = Arc::new(cache(8));

    let prepare = tokio::spawn({
        let (db, cache) = (db.clone(), cache.clone());
        async move { cache.prepare(&db, "SELECT 1").await }
    });
    db.wait_for_started(1).await;

    let purge = tokio::spawn({
        let cache = cache.clone();
        async move { cache.purge().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!purge.is_finished());

    db.release(1);
    let entry = prepare.await.unwrap().unwrap();
    purge.await.unwrap().unwrap();

    // handed out before the purge ran, so the purge closed it
    assert!(entry.statement().unwrap().is_closed());
    assert!(cache.is_empty());
    assert_eq!(db.open_handles(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hit_not_blocked_by_pending_purge() {
    let fast = Arc::new(MockDatabase::new());
    let slow = Arc::new(MockDatabase::builder().gated().build());
    let cache = Arc::new(cache(8));

    let hot = cache.prepare(&fast, "SELECT hot").await.unwrap();

    let stuck = tokio::spawn({
        let (slow, cache) = (slow.clone(), cache.clone());
        async move { cache.prepare(&slow, "SELECT slow").await }
    });
    slow.wait_for_started(1).await;

    let purge = tokio::spawn({
        let cache = cache.clone();
        async move { cache.purge().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!purge.is_finished());

    let hit = tokio::time::timeout(Duration::from_secs(2), cache.prepare(&fast, "SELECT hot")).await;
    let hit = assert_ok!(assert_ok!(hit));
    assert_eq!(hit.statement().unwrap().id(), hot.statement().unwrap().id());
    assert_eq!(fast.created(), 1);

    slow.release(1);
    stuck.await.unwrap().unwrap();
    purge.await.unwrap().unwrap();

    assert!(cache.is_empty());
    assert_eq!(fast.open_handles(), 0);
    assert_eq!(slow.open_handles(), 0);
}

#[tokio::test]
async fn test_remove_reports_close_failure() {
    let db = MockDatabase::builder().with_close_failure("SELECT 1").build();
    let cache = cache(8);

    let entry = cache.prepare(&db, "SELECT 1").await.unwrap();
    let err = assert_err!(cache.remove("SELECT 1"));

    assert_eq!(err.failures().len(), 1);
    assert!(!cache.contains("SELECT 1"));
    assert!(entry.statement().unwrap().is_closed());
    assert_eq!(db.double_closes(), 0);
}

#[tokio::test]
async fn test_remove_single_entry() {
    let db = MockDatabase::new();
    let cache = cache(8);

    let entry = cache.prepare(&db, "SELECT 1").await.unwrap();
    cache.prepare(&db, "SELECT 2").await.unwrap();

    assert!(cache.remove("SELECT 1").unwrap());
    assert!(entry.statement().unwrap().is_closed());
    assert_eq!(cache.len(), 1);
    assert!(!cache.remove("SELECT 1").unwrap());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_create_once() {
    const CALLERS: usize = 16;

    let db = Arc::new(MockDatabase::builder().gated().build());
    let cache = Arc::new(cache(8));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let (db, cache) = (db.clone(), cache.clone());
            tokio::spawn(async move { cache.prepare(&db, "SELECT * FROM hot").await })
        })
        .collect();

    db.wait_for_started(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    db.release(1);

    let mut entries = Vec::with_capacity(CALLERS);
    for handle in handles {
        entries.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(db.started(), 1);
    assert_eq!(db.created(), 1);
    let first = entries[0].statement().unwrap();
    for entry in &entries {
        let stmt = entry.statement().unwrap();
        assert!(Arc::ptr_eq(first, stmt));
        assert_ok!(stmt.execute());
    }
    assert_eq!(cache.len(), 1);
    assert_eq!(db.double_closes(), 0);
}

#[tokio::test]
async fn test_concurrent_mixed_variants_single_task() {
    let db = MockDatabase::builder().gated().build();
    let cache = cache(8);

    let callers = (0..8).map(|i| {
        let cache = &cache;
        let db = &db;
        async move {
            if i % 2 == 0 {
                cache.prepare(db, "SELECT :id").await
            } else {
                cache.prepare_named(db, "SELECT :id").await
            }
        }
    });

    let (results, ()) = tokio::join!(futures_util::future::join_all(callers), async {
        db.wait_for_started(1).await;
        db.release(2);
    });

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(db.created_for("SELECT :id", StatementKind::Positional), 1);
    assert_eq!(db.created_for("SELECT :id", StatementKind::Named), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(db.open_handles(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_churn_never_exceeds_capacity() {
    let db = Arc::new(MockDatabase::new());
    let cache = Arc::new(cache(4));
    let queries = Arc::new(distinct_queries(12));

    let workers: Vec<_> = (0..8)
        .map(|w| {
            let (db, cache, queries) = (db.clone(), cache.clone(), queries.clone());
            tokio::spawn(async move {
                for i in 0..50 {
                    let q = &queries[(w * 7 + i * 3) % queries.len()];
                    cache.prepare(&db, q).await.unwrap();
                    assert!(cache.len() <= 4);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(cache.len() <= 4);
    assert_eq!(db.open_handles(), cache.len());
    assert_eq!(db.double_closes(), 0);

    cache.purge().await.unwrap();
    assert_eq!(db.open_handles(), 0);
}
