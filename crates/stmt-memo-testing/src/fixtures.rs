//! Test fixture utilities.

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stmt_memo=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// `count` distinct queries: `SELECT 0`, `SELECT 1`, ...
#[must_use]
pub fn distinct_queries(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("SELECT {i}")).collect()
}
