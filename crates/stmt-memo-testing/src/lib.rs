//! # stmt-memo-testing
//!
//! Test infrastructure for the statement cache.
//!
//! ## Features
//!
//! - Mock database client with recorded handles (double close and
//!   use-after-close detection)
//! - Failure injection for preparation and close
//! - Latency injection and a release gate for deterministic race tests
//! - Fingerprinter that forces collisions
//! - Metrics sink that records every event
//!
//! ## Example
//!
//! ```rust,ignore
//! use stmt_memo::{MemoConfig, StatementCache};
//! use stmt_memo_testing::{CollidingFingerprinter, MockDatabase};
//!
//! #[tokio::test]
//! async fn test_collision() {
//!     let db = MockDatabase::new();
//!     let cache = StatementCache::new(MemoConfig::default())
//!         .with_fingerprinter(CollidingFingerprinter::all());
//!
//!     cache.prepare(&db, "SELECT 1").await.unwrap();
//!     cache.prepare(&db, "SELECT 2").await.unwrap();
//!     assert_eq!(db.closed_handles(), 1);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fingerprint;
pub mod fixtures;
pub mod metrics;
pub mod mock_db;

pub use fingerprint::{COLLIDING_FINGERPRINT, CollidingFingerprinter};
pub use metrics::{MetricEvent, RecordingMetrics};
pub use mock_db::{MockDatabase, MockDatabaseBuilder, MockError, MockStatement};
