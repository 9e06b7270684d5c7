//! Entity projectors and the checkpointed batch projector.
//!
//! # Overview
//!
//! An [`EntityProjector`] applies single events to one projection type: it
//! runs its child projectors first, then its own [`EntityEventMap`] through a
//! [`ProjectionMerge`] over its repository and cache.
//!
//! A [`CheckpointedProjector`] wraps any [`EventProjector`] and applies
//! ordered batches exactly once past the projection's durable checkpoint:
//!
//! 1. Envelopes at or below the checkpoint are dropped.
//! 2. The rest are applied in order. A failure is offered to the retry
//!    predicate, which may re-run the whole filtered batch.
//! 3. Only after every envelope applied is the checkpoint advanced to the
//!    position of the batch's last envelope.
//!
//! ```text
//! batch ──► filter(position > checkpoint) ──► children ──► event map ──► checkpoint
//!                                                 ▲              │
//!                                                 └── retry? ◄───┘ (failure)
//! ```
//!
//! With a [`UnitOfWork`] configured, every attempt runs inside its own unit
//! of work: a failed attempt is rolled back before the retry predicate is
//! consulted, and the checkpoint is written inside the same unit as the
//! batch, so both become durable together on commit. The cache is cleared on
//! every failure to stay consistent with that rollback.

use crate::builder::EntityEventMap;
use crate::cache::{PassThroughCache, ProjectionCache};
use crate::merge::ProjectionMerge;
use crate::retry::RetryPolicy;
use eventide_core::environment::{Clock, SystemClock};
use eventide_core::event::{Event, EventEnvelope, START_OF_LOG};
use eventide_core::projection::{
    Checkpoint, CheckpointStore, EventProjector, Projection, ProjectionContext, ProjectionError,
    ProjectionRepository, Result, UnitOfWork,
};
use eventide_core::subscription::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Projector for one projection type, with optional child projectors.
pub struct EntityProjector<P: Projection, R, E: Event, Ch = PassThroughCache> {
    name: String,
    map: Arc<EntityEventMap<P, E, ProjectionContext>>,
    repository: R,
    cache: Ch,
    children: Vec<Box<dyn EventProjector<E>>>,
}

impl<P, R, E> EntityProjector<P, R, E, PassThroughCache>
where
    P: Projection,
    R: ProjectionRepository<P>,
    E: Event,
{
    /// Create a projector named `name` without a cache.
    pub fn new(
        name: impl Into<String>,
        map: EntityEventMap<P, E, ProjectionContext>,
        repository: R,
    ) -> Self {
        Self {
            name: name.into(),
            map: Arc::new(map),
            repository,
            cache: PassThroughCache,
            children: Vec::new(),
        }
    }
}

impl<P, R, E, Ch> EntityProjector<P, R, E, Ch>
where
    P: Projection,
    R: ProjectionRepository<P>,
    E: Event,
    Ch: ProjectionCache<P::Key, P>,
{
    /// Put `cache` in front of the repository's `find`.
    #[must_use]
    pub fn with_cache<Ch2>(self, cache: Ch2) -> EntityProjector<P, R, E, Ch2>
    where
        Ch2: ProjectionCache<P::Key, P>,
    {
        EntityProjector {
            name: self.name,
            map: self.map,
            repository: self.repository,
            cache,
            children: self.children,
        }
    }

    /// Run `child` before this projector's own event map on every event.
    #[must_use]
    pub fn with_child(mut self, child: impl EventProjector<E> + 'static) -> Self {
        self.children.push(Box::new(child));
        self
    }

    /// The projector name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing repository.
    pub const fn repository(&self) -> &R {
        &self.repository
    }

    /// Apply one event: children first, then the event map.
    ///
    /// A child's failure is wrapped in [`ProjectionError::ChildProjector`]
    /// carrying the child's name.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a child or by the event map.
    pub async fn apply(&mut self, event: &E, ctx: &ProjectionContext) -> Result<()> {
        for child in &mut self.children {
            if let Err(source) = child.project(event, ctx).await {
                return Err(ProjectionError::ChildProjector {
                    child: child.name().to_owned(),
                    source: Box::new(source),
                });
            }
        }

        let mut merge = ProjectionMerge::new(&self.repository, &mut self.cache);
        let handled = self.map.handle(event, ctx, &mut merge).await?;
        tracing::trace!(
            projector = %self.name,
            position = ctx.position,
            event_type = event.event_type(),
            handled,
            "Applied event"
        );
        Ok(())
    }

    /// Clear this projector's cache and every child's.
    pub fn clear_caches(&mut self) {
        self.cache.clear();
        for child in &mut self.children {
            child.clear_cache();
        }
    }
}

impl<P, R, E, Ch> EventProjector<E> for EntityProjector<P, R, E, Ch>
where
    P: Projection,
    R: ProjectionRepository<P>,
    E: Event,
    Ch: ProjectionCache<P::Key, P>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn project<'a>(
        &'a mut self,
        event: &'a E,
        ctx: &'a ProjectionContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.apply(event, ctx))
    }

    fn clear_cache(&mut self) {
        self.clear_caches();
    }
}

impl<P: Projection, R, E: Event, Ch> fmt::Debug for EntityProjector<P, R, E, Ch> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children: Vec<&str> = self.children.iter().map(|child| child.name()).collect();
        f.debug_struct("EntityProjector")
            .field("name", &self.name)
            .field("children", &children)
            .finish_non_exhaustive()
    }
}

/// A batch that failed to apply.
#[derive(Debug, thiserror::Error)]
#[error("Projector '{projector}' failed to apply event at position {}: {source}", .event.position)]
pub struct ApplicationFailure<E: Event> {
    /// Name of the checkpointed projector.
    pub projector: String,
    /// Innermost child projector that raised the error, if any.
    pub child: Option<String>,
    /// The envelope being applied when the error was raised.
    pub event: EventEnvelope<E>,
    /// The filtered batch that was being applied.
    pub batch: Vec<EventEnvelope<E>>,
    /// The underlying error.
    pub source: ProjectionError,
}

/// Errors returned by [`CheckpointedProjector::handle`].
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError<E: Event> {
    /// Applying the batch failed and was not retried further.
    #[error(transparent)]
    Application(Box<ApplicationFailure<E>>),

    /// Reading or writing the checkpoint failed.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[source] ProjectionError),

    /// Opening or committing the batch's unit of work failed.
    #[error("Unit of work error: {0}")]
    UnitOfWork(#[source] ProjectionError),
}

impl<E: Event> ProjectorError<E> {
    /// The application failure, if that is what this is.
    #[must_use]
    pub fn as_application(&self) -> Option<&ApplicationFailure<E>> {
        match self {
            Self::Application(failure) => Some(failure),
            Self::Checkpoint(_) | Self::UnitOfWork(_) => None,
        }
    }
}

/// Decides whether a failed batch is re-run. Receives the failure and the
/// 1-based number of the attempt that failed.
pub type RetryPredicate<E> = Arc<dyn Fn(&ApplicationFailure<E>, u32) -> bool + Send + Sync>;

/// Applies batches past a durable checkpoint.
pub struct CheckpointedProjector<E: Event, Pr> {
    projector: Pr,
    checkpoints: Arc<dyn CheckpointStore>,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
    clock: Arc<dyn Clock>,
    should_retry: RetryPredicate<E>,
    backoff: Option<RetryPolicy>,
    last_position: Option<i64>,
}

impl<E, Pr> CheckpointedProjector<E, Pr>
where
    E: Event,
    Pr: EventProjector<E>,
{
    /// Wrap `projector`, storing its progress in `checkpoints`.
    ///
    /// Failed batches are not retried until a retry predicate or policy is
    /// configured.
    pub fn new(projector: Pr, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            projector,
            checkpoints,
            unit_of_work: None,
            clock: Arc::new(SystemClock),
            should_retry: Arc::new(|_: &ApplicationFailure<E>, _: u32| false),
            backoff: None,
            last_position: None,
        }
    }

    /// Use `clock` to timestamp checkpoints.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run every batch attempt, checkpoint included, inside `unit_of_work`.
    ///
    /// The projector's repositories and checkpoint store must write through
    /// the same unit for a rollback to discard them.
    #[must_use]
    pub fn with_unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    /// Re-run a failed batch while `should_retry` returns `true`.
    #[must_use]
    pub fn with_retry_predicate(
        mut self,
        should_retry: impl Fn(&ApplicationFailure<E>, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(should_retry);
        self.backoff = None;
        self
    }

    /// Retry failed batches under `policy`, sleeping between attempts.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        let limit = policy.clone();
        self.should_retry =
            Arc::new(move |_: &ApplicationFailure<E>, attempt: u32| limit.allows_retry(attempt));
        self.backoff = Some(policy);
        self
    }

    /// Name of the projection, used as the checkpoint key.
    #[must_use]
    pub fn projection_id(&self) -> &str {
        self.projector.name()
    }

    /// The wrapped projector.
    pub const fn projector(&self) -> &Pr {
        &self.projector
    }

    /// Position of the last applied envelope, or [`START_OF_LOG`].
    ///
    /// Read from the checkpoint store on first use and kept in memory
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the store cannot be read.
    pub async fn last_position(&mut self) -> Result<i64> {
        if let Some(position) = self.last_position {
            return Ok(position);
        }
        let position = self
            .checkpoints
            .load_checkpoint(self.projector.name())
            .await?
            .map_or(START_OF_LOG, |checkpoint| checkpoint.position);
        self.last_position = Some(position);
        Ok(position)
    }

    /// Forget the in-memory position so the next call re-reads the store.
    pub const fn forget_position(&mut self) {
        self.last_position = None;
    }

    /// Clear the caches of the wrapped projector.
    pub fn clear_cache(&mut self) {
        self.projector.clear_cache();
    }

    /// Rewind to the start of the log: clear caches and overwrite the
    /// checkpoint with [`START_OF_LOG`].
    ///
    /// Projection records are left alone; rebuilding them is up to the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the store cannot be written.
    pub async fn reset(&mut self) -> Result<()> {
        self.clear_cache();
        let checkpoint = Checkpoint::start_of_log(self.projector.name(), self.clock.now());
        self.checkpoints.save_checkpoint(checkpoint).await?;
        self.last_position = Some(START_OF_LOG);
        tracing::info!(projection = %self.projector.name(), "Projection checkpoint reset");
        Ok(())
    }

    /// Apply `batch` past the checkpoint and advance it.
    ///
    /// A batch with no envelope past the checkpoint is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectorError::Application`] when an envelope fails to
    /// apply and the retry predicate gives up, and
    /// [`ProjectorError::Checkpoint`] when the checkpoint cannot be read or
    /// written, and [`ProjectorError::UnitOfWork`] when the unit of work
    /// cannot be opened or committed. The checkpoint is not advanced in any
    /// of these cases.
    pub async fn handle(
        &mut self,
        batch: &[EventEnvelope<E>],
    ) -> std::result::Result<(), ProjectorError<E>> {
        let Some(last) = batch.last() else {
            return Ok(());
        };
        let checkpoint = self.last_position().await.map_err(ProjectorError::Checkpoint)?;

        let pending: Vec<EventEnvelope<E>> = batch
            .iter()
            .filter(|envelope| envelope.position > checkpoint)
            .cloned()
            .collect();
        if pending.is_empty() {
            tracing::debug!(
                projection = %self.projector.name(),
                checkpoint,
                batch_size = batch.len(),
                "Batch already applied"
            );
            return Ok(());
        }

        let unit = self.unit_of_work.clone();
        let projection = self.projector.name().to_owned();
        let mut attempt = 1;
        loop {
            Self::begin_unit(unit.as_deref()).await?;
            let Err((index, source)) = self.apply_all(&pending).await else {
                break;
            };
            Self::rollback_unit(unit.as_deref(), &projection).await;
            self.projector.clear_cache();
            let failure = ApplicationFailure {
                projector: self.projector.name().to_owned(),
                child: source.innermost_child().map(str::to_owned),
                event: pending[index].clone(),
                batch: pending.clone(),
                source,
            };

            if !(self.should_retry)(&failure, attempt) {
                tracing::error!(
                    projection = %failure.projector,
                    position = failure.event.position,
                    attempt,
                    error = %failure.source,
                    "Failed to apply batch"
                );
                return Err(ProjectorError::Application(Box::new(failure)));
            }

            tracing::warn!(
                projection = %failure.projector,
                position = failure.event.position,
                attempt,
                error = %failure.source,
                "Retrying batch"
            );
            if let Some(policy) = &self.backoff {
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
            attempt += 1;
        }

        let position = last.position.max(checkpoint);
        let checkpoint = Checkpoint::new(self.projector.name(), position, self.clock.now());
        if let Err(error) = self.checkpoints.save_checkpoint(checkpoint).await {
            Self::rollback_unit(unit.as_deref(), &projection).await;
            self.projector.clear_cache();
            return Err(ProjectorError::Checkpoint(error));
        }
        if let Some(unit) = &unit {
            if let Err(error) = unit.commit().await {
                self.projector.clear_cache();
                return Err(ProjectorError::UnitOfWork(error));
            }
        }
        self.last_position = Some(position);

        tracing::debug!(
            projection = %self.projector.name(),
            position,
            applied = pending.len(),
            "Checkpoint advanced"
        );
        Ok(())
    }

    async fn begin_unit(
        unit: Option<&dyn UnitOfWork>,
    ) -> std::result::Result<(), ProjectorError<E>> {
        if let Some(unit) = unit {
            unit.begin().await.map_err(ProjectorError::UnitOfWork)?;
        }
        Ok(())
    }

    // A failed rollback still drops the unit; the original error wins.
    async fn rollback_unit(unit: Option<&dyn UnitOfWork>, projection: &str) {
        if let Some(unit) = unit {
            if let Err(error) = unit.rollback().await {
                tracing::warn!(projection, error = %error, "Failed to roll back batch");
            }
        }
    }

    async fn apply_all(
        &mut self,
        pending: &[EventEnvelope<E>],
    ) -> std::result::Result<(), (usize, ProjectionError)> {
        for (index, envelope) in pending.iter().enumerate() {
            let ctx = ProjectionContext::from_envelope(envelope);
            self.projector
                .project(&envelope.body, &ctx)
                .await
                .map_err(|error| (index, error))?;
        }
        Ok(())
    }
}

impl<E: Event, Pr: EventProjector<E>> fmt::Debug for CheckpointedProjector<E, Pr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointedProjector")
            .field("projection_id", &self.projector.name())
            .field("last_position", &self.last_position)
            .field("backoff", &self.backoff)
            .field("transactional", &self.unit_of_work.is_some())
            .finish_non_exhaustive()
    }
}
