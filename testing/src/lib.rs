//! # Eventide Testing
//!
//! Testing utilities and helpers for Eventide projections.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory repositories and checkpoint stores with call counters
//! - A scripted subscription factory that lets tests push envelopes
//! - Property-based testing strategies
//! - A fluent harness for projector tests
//!
//! ## Example
//!
//! ```ignore
//! use eventide_testing::{InMemoryCheckpointStore, InMemoryProjectionRepository};
//!
//! #[tokio::test]
//! async fn test_catalog_projection() {
//!     let products = InMemoryProjectionRepository::<Product>::new();
//!     let checkpoints = Arc::new(InMemoryCheckpointStore::new());
//!     let projector = EntityProjector::new("catalog", catalog_map(), products.clone());
//!     let mut projector = CheckpointedProjector::new(projector, checkpoints.clone());
//!
//!     projector.handle(&batch).await.unwrap();
//!
//!     assert_eq!(checkpoints.position("catalog"), Some(2));
//!     assert!(products.get(&1).is_some());
//! }
//! ```

use chrono::{DateTime, Utc};
use eventide_core::environment::Clock;

pub mod projection_mocks;
pub mod subscription_mocks;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventide_testing::mocks::FixedClock;
    /// use eventide_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(epoch())
    }

    /// Clock that only moves when told to, for TTL tests
    ///
    /// # Example
    ///
    /// ```
    /// use eventide_testing::mocks::ManualClock;
    /// use eventide_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(30));
    /// assert_eq!((clock.now() - before).num_seconds(), 30);
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock stopped at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit a `chrono::TimeDelta`.
        #[allow(clippy::unwrap_used, clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let by = chrono::TimeDelta::from_std(by).expect("duration should fit a TimeDelta");
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Stop the clock at `time`
        ///
        /// # Panics
        ///
        /// Panics if the internal lock is poisoned.
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(epoch())
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    #[allow(clippy::expect_used)]
    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Test helpers and utilities
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a `tracing` subscriber writing to the test output.
    ///
    /// Respects `RUST_LOG`, defaulting to `debug` for Eventide crates. Safe to
    /// call from every test; only the first call installs anything.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "eventide_projections=debug,eventide_testing=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    /// Error raised by test handlers and failing collaborators.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("{0}")]
    pub struct TestFailure(pub String);

    impl TestFailure {
        /// Create a failure with `message`.
        #[must_use]
        pub fn new(message: impl Into<String>) -> Self {
            Self(message.into())
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// Strictly increasing log positions starting at zero or later, up to
    /// `max_len` of them.
    pub fn increasing_positions(max_len: usize) -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(1_i64..5, 0..=max_len).prop_map(|gaps| {
            gaps.into_iter()
                .scan(-1_i64, |position, gap| {
                    *position += gap;
                    Some(*position)
                })
                .collect()
        })
    }

    /// A prefix split point and an overlap for replaying `len` envelopes in
    /// two overlapping batches: `(split, overlap)` with `overlap <= split`.
    pub fn overlapping_split(len: usize) -> impl Strategy<Value = (usize, usize)> {
        (0..=len).prop_flat_map(|split| (Just(split), 0..=split))
    }
}

// Re-export commonly used items
pub use helpers::{TestFailure, init_tracing};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use projection_mocks::{
    InMemoryCheckpointStore, InMemoryProjectionRepository, InMemoryUnitOfWork,
    ProjectionTestHarness, Transactional,
};
pub use subscription_mocks::{ScriptedSubscriptionFactory, TestSubscription};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    proptest! {
        #[test]
        fn prop_positions_strictly_increase(positions in properties::increasing_positions(20)) {
            prop_assert!(positions.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(positions.first().is_none_or(|p| *p >= 0));
        }

        #[test]
        fn prop_overlap_within_split((split, overlap) in properties::overlapping_split(10)) {
            prop_assert!(overlap <= split);
            prop_assert!(split <= 10);
        }
    }
}
