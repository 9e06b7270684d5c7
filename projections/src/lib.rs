//! Event routing and checkpointed projections for Eventide.
//!
//! # Overview
//!
//! This crate turns an ordered event log into queryable projections:
//! - **Routing**: [`EventRouter`] and the builder DSL ([`EventMapBuilder`],
//!   [`EntityEventMapBuilder`]) map event types to handlers or to
//!   create/update/delete actions with per-action miss/duplicate policies
//! - **Merge**: [`ProjectionMerge`] applies those actions against a
//!   [`ProjectionRepository`](eventide_core::ProjectionRepository) through a
//!   [`ProjectionCache`]
//! - **Projectors**: [`EntityProjector`] applies single events, and
//!   [`CheckpointedProjector`] applies batches exactly once past a durable
//!   checkpoint
//! - **Dispatch**: [`Dispatcher`] opens live subscriptions and supervises the
//!   per-event handler, restarting from the start of the log when the
//!   checkpoint is ahead
//! - **`PostgreSQL`**: repository and checkpoint adapters sharing a
//!   transactional [`PgSession`]
//!
//! # Example
//!
//! ```ignore
//! use eventide_projections::*;
//!
//! let mut builder = EntityEventMapBuilder::<Product, CatalogEvent, ProjectionContext>::new();
//! builder
//!     .map::<ProductAdded>()
//!     .as_create_of(|e, _| e.id)
//!     .using(|p, e, _| p.name = e.name.clone());
//!
//! let projector = EntityProjector::new("catalog", builder.build(), repository)
//!     .with_cache(LruCache::new(1000));
//! let mut projector = CheckpointedProjector::new(projector, checkpoints);
//!
//! projector.handle(&batch).await?;
//! ```

pub mod builder;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod manager;
pub mod merge;
pub mod postgres;
pub mod projector;
pub mod retry;
pub mod router;

// Re-export main types for convenience
pub use builder::{EntityEventMap, EntityEventMapBuilder, EventMap, EventMapBuilder};
pub use cache::{LruCache, PassThroughCache, ProjectionCache};
pub use config::{CacheConfig, ConfigError, ProjectorConfig, RetryConfig, SubscriptionConfig};
pub use dispatcher::{
    DispatchError, Dispatcher, ExceptionResolution, HandlerFailure, SubscriptionHandle,
    SubscriptionOptions, SubscriptionState,
};
pub use manager::{ManagerError, ProjectionManager};
pub use merge::{MergeOps, ProjectionMerge};
pub use postgres::{PgSession, PostgresCheckpointStore, PostgresProjectionRepository};
pub use projector::{ApplicationFailure, CheckpointedProjector, EntityProjector, ProjectorError};
pub use retry::RetryPolicy;
pub use router::{EventRouter, Route};
