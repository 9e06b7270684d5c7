//! # Eventide Core
//!
//! Core traits and types for building checkpointed projections over an
//! ordered event log.
//!
//! ## Core Concepts
//!
//! - **Event**: a typed payload with an explicit type tag
//! - **Envelope**: an event plus its log position and metadata
//! - **Projection**: a keyed read-model record stored through a repository
//! - **Checkpoint**: the furthest processed position of one projection
//! - **Subscription**: a live feed opened by an external transport
//! - **Environment**: injected dependencies such as the clock

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod event;
pub mod projection;
pub mod subscription;

pub use event::{Event, EventEnvelope, EventVariant, START_OF_LOG};
pub use projection::{
    BoxError, Checkpoint, CheckpointStore, EventProjector, MissOperation, Projection,
    ProjectionContext, ProjectionError, ProjectionRepository, UnitOfWork,
};
pub use subscription::{BoxFuture, EventSink, Subscription, SubscriptionError, SubscriptionFactory};

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eventide_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
