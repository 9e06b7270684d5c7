//! Projection records, their storage contracts and checkpoints.
//!
//! # Overview
//!
//! A projection is a derived, queryable record built by replaying events.
//! The engine never looks inside a projection; it only needs to:
//!
//! - build a bare record from a key ([`Projection::from_key`]),
//! - read its key back ([`Projection::key`]),
//! - persist it through a [`ProjectionRepository`].
//!
//! Progress through the log is tracked per projection with a [`Checkpoint`]
//! stored in a [`CheckpointStore`].
//!
//! ```text
//!  EventEnvelope ──► router ──► merge ──► ProjectionRepository
//!                                  │
//!                                  └──► CheckpointStore (after the batch)
//! ```

use crate::event::{Event, EventEnvelope, Metadata, START_OF_LOG};
use crate::subscription::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed error for failures raised by application code (handlers, hooks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which merge operation missed its target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissOperation {
    /// An update found no projection for the key.
    Update,
    /// A delete found no projection for the key.
    Delete,
}

impl fmt::Display for MissOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// A create targeted a key that already has a projection.
    #[error("Projection with key {key} already exists")]
    DuplicateKey {
        /// Debug rendering of the key.
        key: String,
    },

    /// An update or delete targeted a key with no projection.
    #[error("Failed to {operation} projection with key {key}: it does not exist")]
    MissingKey {
        /// Debug rendering of the key.
        key: String,
        /// The operation that missed.
        operation: MissOperation,
    },

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Failure raised by a handler or policy callback.
    #[error("Handler error: {0}")]
    Handler(#[from] BoxError),

    /// Failure raised while a child projector applied an event.
    #[error("Child projector '{child}' failed: {source}")]
    ChildProjector {
        /// Name of the child projector.
        child: String,
        /// The child's error.
        source: Box<ProjectionError>,
    },
}

impl ProjectionError {
    /// Build a [`ProjectionError::DuplicateKey`] from any debuggable key.
    #[must_use]
    pub fn duplicate_key(key: &impl fmt::Debug) -> Self {
        Self::DuplicateKey {
            key: format!("{key:?}"),
        }
    }

    /// Build a [`ProjectionError::MissingKey`] from any debuggable key.
    #[must_use]
    pub fn missing_key(key: &impl fmt::Debug, operation: MissOperation) -> Self {
        Self::MissingKey {
            key: format!("{key:?}"),
            operation,
        }
    }

    /// Wrap an application error.
    #[must_use]
    pub fn handler(error: impl Into<BoxError>) -> Self {
        Self::Handler(error.into())
    }

    /// Name of the innermost child projector in the error chain, if any.
    #[must_use]
    pub fn innermost_child(&self) -> Option<&str> {
        let mut current = self;
        let mut found = None;
        while let Self::ChildProjector { child, source } = current {
            found = Some(child.as_str());
            current = source;
        }
        found
    }

    /// The error underneath any child projector wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Self::ChildProjector { source, .. } = current {
            current = source;
        }
        current
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A keyed domain record maintained by a projector.
///
/// # Example
///
/// ```
/// use eventide_core::projection::Projection;
///
/// #[derive(Clone, Debug, Default)]
/// struct Product { id: u64, name: String, price: u32 }
///
/// impl Projection for Product {
///     type Key = u64;
///
///     fn from_key(key: u64) -> Self {
///         Self { id: key, ..Self::default() }
///     }
///
///     fn key(&self) -> &u64 {
///         &self.id
///     }
/// }
/// ```
pub trait Projection: Clone + Send + Sync + 'static {
    /// Stable key type.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Construct a bare record carrying only its key.
    fn from_key(key: Self::Key) -> Self;

    /// The record's key.
    fn key(&self) -> &Self::Key;
}

/// Storage for one projection type.
///
/// All calls of one batch are expected to run inside a single ambient
/// transaction owned by the caller; implementations never open one.
pub trait ProjectionRepository<P: Projection>: Send + Sync {
    /// Load the projection stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the backend fails.
    fn find_by_key(&self, key: &P::Key) -> impl Future<Output = Result<Option<P>>> + Send;

    /// Insert or replace a projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the backend fails.
    fn save(&self, projection: &P) -> impl Future<Output = Result<()>> + Send;

    /// Delete the projection stored under `key`, returning the number of
    /// affected records.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the backend fails.
    fn delete(&self, key: &P::Key) -> impl Future<Output = Result<u64>> + Send;
}

impl<P, R> ProjectionRepository<P> for Arc<R>
where
    P: Projection,
    R: ProjectionRepository<P>,
{
    async fn find_by_key(&self, key: &P::Key) -> Result<Option<P>> {
        (**self).find_by_key(key).await
    }

    async fn save(&self, projection: &P) -> Result<()> {
        (**self).save(projection).await
    }

    async fn delete(&self, key: &P::Key) -> Result<u64> {
        (**self).delete(key).await
    }
}

/// Applies events to one or more projections.
///
/// Implemented by entity projectors; also the seam for child projectors,
/// which run before their parent on every event and own no checkpoint.
pub trait EventProjector<E: Event>: Send {
    /// Name used for checkpoints and error reporting.
    fn name(&self) -> &str;

    /// Apply a single event.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`] raised while applying the event.
    fn project<'a>(
        &'a mut self,
        event: &'a E,
        ctx: &'a ProjectionContext,
    ) -> BoxFuture<'a, Result<()>>;

    /// Drop any cached projections, e.g. after the surrounding transaction
    /// rolled back.
    fn clear_cache(&mut self);
}

/// Furthest processed log position of one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique projection identifier.
    pub projection_id: String,
    /// Position of the last applied envelope.
    pub position: i64,
    /// When the checkpoint was written.
    pub last_updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint.
    #[must_use]
    pub fn new(projection_id: impl Into<String>, position: i64, last_updated_at: DateTime<Utc>) -> Self {
        Self {
            projection_id: projection_id.into(),
            position,
            last_updated_at,
        }
    }

    /// A checkpoint that requests the feed from the start of the log.
    #[must_use]
    pub fn start_of_log(projection_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(projection_id, START_OF_LOG, at)
    }
}

/// Durable storage for checkpoints, keyed by projection identifier.
///
/// Dyn-compatible so projectors can hold an `Arc<dyn CheckpointStore>`.
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of `projection_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if loading fails.
    fn load_checkpoint(
        &self,
        projection_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>>;

    /// Insert or overwrite a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if saving fails.
    fn save_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Transaction boundary shared by a projection's repositories and its
/// checkpoint store.
///
/// A checkpointed projector opens one unit of work per batch attempt. Writes
/// made between [`begin`](Self::begin) and [`commit`](Self::commit) become
/// visible together with the advanced checkpoint, and
/// [`rollback`](Self::rollback) discards all of them.
pub trait UnitOfWork: Send + Sync {
    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if one is already open or the
    /// backend refuses.
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Make every write since [`begin`](Self::begin) durable.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the commit fails.
    fn commit(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Discard every write since [`begin`](Self::begin). A no-op when nothing
    /// is open.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the rollback fails.
    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Per-event context handed to every handler and policy callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionContext {
    /// Stream of the event being applied.
    pub stream_id: String,
    /// Log position of the event being applied.
    pub position: i64,
    /// Stream version of the event being applied.
    pub stream_version: i64,
    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,
    /// Envelope metadata.
    pub metadata: Metadata,
}

impl ProjectionContext {
    /// Derive the context of an envelope.
    #[must_use]
    pub fn from_envelope<E>(envelope: &EventEnvelope<E>) -> Self {
        Self {
            stream_id: envelope.stream_id.clone(),
            position: envelope.position,
            stream_version: envelope.stream_version,
            occurred_at: envelope.occurred_at,
            metadata: envelope.metadata.clone(),
        }
    }

    /// Metadata value stored under `key`.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }
}
