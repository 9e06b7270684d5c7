//! `ProjectionManager` for running a checkpointed projector on a live feed.
//!
//! # Overview
//!
//! The `ProjectionManager` coordinates the lifecycle of a projection:
//! - Loads the last checkpoint to know where to resume
//! - Subscribes through the [`Dispatcher`] just after that position
//! - Feeds every delivered envelope to the projector as a one-element batch
//! - Resets the projector when the feed restarts from the start of the log
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │ SubscriptionFactory  │
//! └──────────┬───────────┘
//!            │ envelopes
//!            ▼
//! ┌──────────────────────┐
//! │      Dispatcher      │ (exception policy)
//! └──────────┬───────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐      ┌────────────┐
//! │ CheckpointedProjector│ ───► │ Checkpoint │
//! └──────────────────────┘      └────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use eventide_projections::*;
//!
//! let projector = CheckpointedProjector::new(entity_projector, checkpoints);
//! let manager = ProjectionManager::new(
//!     projector,
//!     Dispatcher::new(factory),
//!     SubscriptionOptions::new("product-catalog"),
//! );
//!
//! // Resume from the last checkpoint
//! let handle = manager.start().await?;
//!
//! // Later, stop the feed
//! handle.unsubscribe();
//! ```

use crate::config::{ConfigError, ProjectorConfig};
use crate::dispatcher::{DispatchError, Dispatcher, SubscriptionHandle, SubscriptionOptions};
use crate::projector::CheckpointedProjector;
use eventide_core::event::{Event, EventEnvelope};
use eventide_core::projection::{BoxError, EventProjector, ProjectionError};
use eventide_core::subscription::BoxFuture;
use std::slice;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors returned by [`ProjectionManager`].
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The checkpoint could not be read or reset.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] ProjectionError),

    /// The subscription could not be opened.
    #[error("Subscription error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Runs one [`CheckpointedProjector`] on a dispatched feed.
///
/// The projector sits behind a `tokio::sync::Mutex`, so envelopes are
/// applied one at a time even if the transport delivers concurrently.
pub struct ProjectionManager<E: Event, Pr> {
    projector: Arc<Mutex<CheckpointedProjector<E, Pr>>>,
    dispatcher: Dispatcher<E>,
    options: SubscriptionOptions,
}

impl<E, Pr> ProjectionManager<E, Pr>
where
    E: Event,
    Pr: EventProjector<E> + 'static,
{
    /// Create a manager.
    ///
    /// The `before_restarting` hook of `options`, if any, runs before the
    /// projector is reset on a restart.
    #[must_use]
    pub fn new(
        projector: CheckpointedProjector<E, Pr>,
        dispatcher: Dispatcher<E>,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            projector: Arc::new(Mutex::new(projector)),
            dispatcher,
            options,
        }
    }

    /// Create a manager subscribing with the options of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `config` is invalid or
    /// `projector` is not the projection `config` describes.
    pub fn configured(
        config: &ProjectorConfig,
        projector: CheckpointedProjector<E, Pr>,
        dispatcher: Dispatcher<E>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if projector.projection_id() != config.projection_id {
            return Err(ConfigError::Validation(format!(
                "projector '{}' does not match projection_id '{}'",
                projector.projection_id(),
                config.projection_id
            )));
        }
        Ok(Self::new(projector, dispatcher, config.subscription.to_options()))
    }

    /// Shared handle to the projector.
    #[must_use]
    pub fn projector(&self) -> Arc<Mutex<CheckpointedProjector<E, Pr>>> {
        Arc::clone(&self.projector)
    }

    /// Subscribe just after the last checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Checkpoint`] if the checkpoint cannot be read,
    /// and [`ManagerError::Dispatch`] if the subscription cannot be opened.
    pub async fn start(&self) -> Result<SubscriptionHandle, ManagerError> {
        let (projection, position) = {
            let mut projector = self.projector.lock().await;
            projector.forget_position();
            let position = projector.last_position().await.map_err(ManagerError::Checkpoint)?;
            (projector.projection_id().to_owned(), position)
        };
        tracing::info!(
            projection = %projection,
            subscription = %self.options.id,
            position,
            "Starting projection manager"
        );

        let projector = Arc::clone(&self.projector);
        let handler = move |envelope: EventEnvelope<E>| {
            let projector = Arc::clone(&projector);
            async move {
                projector
                    .lock()
                    .await
                    .handle(slice::from_ref(&envelope))
                    .await
                    .map_err(BoxError::from)
            }
        };

        let handle = self
            .dispatcher
            .subscribe(position, handler, self.restarting_options())
            .await?;
        tracing::info!(projection = %projection, "Projection manager subscribed");
        Ok(handle)
    }

    /// Rewind the projection to the start of the log.
    ///
    /// Clears the projector's caches and resets its checkpoint. Projection
    /// records are left alone; restart the manager to replay.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Checkpoint`] if the checkpoint cannot be reset.
    pub async fn rebuild(&self) -> Result<(), ManagerError> {
        let mut projector = self.projector.lock().await;
        tracing::info!(projection = %projector.projection_id(), "Rebuilding projection");
        projector.reset().await.map_err(ManagerError::Checkpoint)?;
        tracing::info!(
            projection = %projector.projection_id(),
            "Projection reset - restart manager to replay events"
        );
        Ok(())
    }

    /// Options whose restart hook runs the caller's hook, then resets the
    /// projector.
    fn restarting_options(&self) -> SubscriptionOptions {
        let user_hook = self.options.before_restarting.clone();
        let projector = Arc::clone(&self.projector);
        let mut options = self.options.clone();
        options.before_restarting = Some(Arc::new(move || -> BoxFuture<'static, Result<(), BoxError>> {
            let user_hook = user_hook.clone();
            let projector = Arc::clone(&projector);
            Box::pin(async move {
                if let Some(hook) = user_hook {
                    hook().await?;
                }
                projector.lock().await.reset().await?;
                Ok::<(), BoxError>(())
            })
        }));
        options
    }
}

impl<E: Event, Pr> std::fmt::Debug for ProjectionManager<E, Pr> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
