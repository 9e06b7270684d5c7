//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for projections:
//! - [`InMemoryProjectionRepository`]: HashMap-based repository with call counters
//! - [`InMemoryCheckpointStore`]: In-memory checkpoint tracking
//! - [`InMemoryUnitOfWork`]: Snapshot-based transactions over the two above
//! - [`ProjectionTestHarness`]: Fluent API for projector tests

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use eventide_core::event::{Event, EventEnvelope};
use eventide_core::projection::{
    Checkpoint, CheckpointStore, EventProjector, Projection, ProjectionContext, ProjectionError,
    ProjectionRepository, Result, UnitOfWork,
};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Take one unit from a failure budget, returning whether it was available.
fn take_failure(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory projection repository for fast, deterministic testing.
///
/// Clones share the same records and counters, so a test can hand one clone
/// to a projector and inspect another.
///
/// # Example
///
/// ```ignore
/// let products = InMemoryProjectionRepository::<Product>::new();
/// let projector = EntityProjector::new("catalog", map, products.clone());
///
/// // ... apply events ...
///
/// assert_eq!(products.find_count(), 1);
/// assert!(products.get(&1).is_some());
/// ```
pub struct InMemoryProjectionRepository<P: Projection> {
    records: Arc<RwLock<HashMap<P::Key, P>>>,
    finds: Arc<AtomicUsize>,
    saves: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    failing_saves: Arc<AtomicUsize>,
}

impl<P: Projection> InMemoryProjectionRepository<P> {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            finds: Arc::new(AtomicUsize::new(0)),
            saves: Arc::new(AtomicUsize::new(0)),
            deletes: Arc::new(AtomicUsize::new(0)),
            failing_saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a repository seeded with `projections`
    ///
    /// Seeding does not count as a save.
    #[must_use]
    pub fn with(projections: Vec<P>) -> Self {
        let repository = Self::new();
        for projection in projections {
            repository.insert(projection);
        }
        repository
    }

    /// Store a projection without touching the counters
    pub fn insert(&self, projection: P) {
        self.records
            .write()
            .unwrap()
            .insert(projection.key().clone(), projection);
    }

    /// Get a stored projection without touching the counters
    #[must_use]
    pub fn get(&self, key: &P::Key) -> Option<P> {
        self.records.read().unwrap().get(key).cloned()
    }

    /// Check if a key is stored
    #[must_use]
    pub fn contains_key(&self, key: &P::Key) -> bool {
        self.records.read().unwrap().contains_key(key)
    }

    /// Get all stored keys
    #[must_use]
    pub fn keys(&self) -> Vec<P::Key> {
        self.records.read().unwrap().keys().cloned().collect()
    }

    /// Get the number of stored projections
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Check if the repository is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Clear all records (counters are kept)
    pub fn clear(&self) {
        self.records.write().unwrap().clear();
    }

    /// Number of `find_by_key` calls
    #[must_use]
    pub fn find_count(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Number of `save` calls, failed ones included
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls
    #[must_use]
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Reset all call counters to zero
    pub fn reset_counts(&self) {
        self.finds.store(0, Ordering::SeqCst);
        self.saves.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    /// Make the next `count` saves fail with [`ProjectionError::Storage`]
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }
}

impl<P: Projection> Clone for InMemoryProjectionRepository<P> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            finds: Arc::clone(&self.finds),
            saves: Arc::clone(&self.saves),
            deletes: Arc::clone(&self.deletes),
            failing_saves: Arc::clone(&self.failing_saves),
        }
    }
}

impl<P: Projection> Default for InMemoryProjectionRepository<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Projection> fmt::Debug for InMemoryProjectionRepository<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryProjectionRepository")
            .field("len", &self.len())
            .field("finds", &self.find_count())
            .field("saves", &self.save_count())
            .field("deletes", &self.delete_count())
            .finish()
    }
}

impl<P: Projection> ProjectionRepository<P> for InMemoryProjectionRepository<P> {
    async fn find_by_key(&self, key: &P::Key) -> Result<Option<P>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(key))
    }

    async fn save(&self, projection: &P) -> Result<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_saves) {
            return Err(ProjectionError::Storage(format!(
                "injected failure saving {:?}",
                projection.key()
            )));
        }
        self.insert(projection.clone());
        Ok(())
    }

    async fn delete(&self, key: &P::Key) -> Result<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let removed = self.records.write().unwrap().remove(key);
        Ok(u64::from(removed.is_some()))
    }
}

/// In-memory checkpoint tracking for testing projection resumption.
///
/// # Example
///
/// ```
/// use eventide_testing::InMemoryCheckpointStore;
/// use eventide_core::projection::{Checkpoint, CheckpointStore};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryCheckpointStore::new();
///
/// store.save_checkpoint(Checkpoint::new("my_projection", 42, Utc::now())).await?;
///
/// assert_eq!(store.position("my_projection"), Some(42));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<String, Checkpoint>>>,
    saves: Arc<AtomicUsize>,
    failing_saves: Arc<AtomicUsize>,
}

impl InMemoryCheckpointStore {
    /// Create a new empty checkpoint store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store already holding `checkpoint`
    #[must_use]
    pub fn with(checkpoint: Checkpoint) -> Self {
        let store = Self::new();
        store.set(checkpoint);
        store
    }

    /// Store a checkpoint without touching the counters
    pub fn set(&self, checkpoint: Checkpoint) {
        self.checkpoints
            .write()
            .unwrap()
            .insert(checkpoint.projection_id.clone(), checkpoint);
    }

    /// Get the checkpoint of `projection_id`
    #[must_use]
    pub fn checkpoint(&self, projection_id: &str) -> Option<Checkpoint> {
        self.checkpoints.read().unwrap().get(projection_id).cloned()
    }

    /// Get the position of `projection_id`
    #[must_use]
    pub fn position(&self, projection_id: &str) -> Option<i64> {
        self.checkpoint(projection_id).map(|c| c.position)
    }

    /// Number of `save_checkpoint` calls, failed ones included
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `count` saves fail with [`ProjectionError::Checkpoint`]
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Get the number of tracked projections
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.read().unwrap().len()
    }

    /// Check if no projections are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().unwrap().is_empty()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load_checkpoint(
        &self,
        projection_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>>> + Send + '_>> {
        let projection_id = projection_id.to_string();
        Box::pin(async move { Ok(self.checkpoint(&projection_id)) })
    }

    fn save_checkpoint(
        &self,
        checkpoint: Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failing_saves) {
                return Err(ProjectionError::Checkpoint(format!(
                    "injected failure saving checkpoint of {}",
                    checkpoint.projection_id
                )));
            }
            self.set(checkpoint);
            Ok(())
        })
    }
}

/// Restores a participant of an [`InMemoryUnitOfWork`] to an earlier state.
pub type Restore = Box<dyn FnOnce() + Send>;

/// In-memory storage that can take part in an [`InMemoryUnitOfWork`].
pub trait Transactional: Send + Sync {
    /// Capture the current state, returning how to put it back.
    fn snapshot(&self) -> Restore;
}

impl<P: Projection> Transactional for InMemoryProjectionRepository<P> {
    fn snapshot(&self) -> Restore {
        let saved = self.records.read().unwrap().clone();
        let records = Arc::clone(&self.records);
        Box::new(move || *records.write().unwrap() = saved)
    }
}

impl Transactional for InMemoryCheckpointStore {
    fn snapshot(&self) -> Restore {
        let saved = self.checkpoints.read().unwrap().clone();
        let checkpoints = Arc::clone(&self.checkpoints);
        Box::new(move || *checkpoints.write().unwrap() = saved)
    }
}

/// Unit of work over in-memory storage.
///
/// `begin` snapshots every tracked participant and `rollback` restores the
/// snapshots, so writes made in between disappear the way they would in a
/// database transaction. Call counters are never rolled back.
///
/// # Example
///
/// ```ignore
/// let unit = Arc::new(
///     InMemoryUnitOfWork::new()
///         .tracking(products.clone())
///         .tracking(checkpoints.as_ref().clone()),
/// );
/// let projector = CheckpointedProjector::new(projector, checkpoints)
///     .with_unit_of_work(unit.clone());
///
/// // ... handle a batch that fails once ...
///
/// assert_eq!(unit.rollback_count(), 1);
/// ```
#[derive(Default)]
pub struct InMemoryUnitOfWork {
    participants: Vec<Box<dyn Transactional>>,
    open: Mutex<Option<Vec<Restore>>>,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    failing_commits: AtomicUsize,
}

impl InMemoryUnitOfWork {
    /// Create a unit of work tracking nothing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Roll `participant` back together with the others
    #[must_use]
    pub fn tracking(mut self, participant: impl Transactional + 'static) -> Self {
        self.participants.push(Box::new(participant));
        self
    }

    /// Whether a unit of work is currently open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.lock().unwrap().is_some()
    }

    /// Number of `begin` calls
    #[must_use]
    pub fn begin_count(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    /// Number of successful `commit` calls
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of `rollback` calls that discarded an open unit
    #[must_use]
    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Make the next `count` commits fail with [`ProjectionError::Storage`].
    ///
    /// A failed commit discards the unit's writes.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn restore(snapshots: Vec<Restore>) {
        for restore in snapshots.into_iter().rev() {
            restore();
        }
    }
}

impl fmt::Debug for InMemoryUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryUnitOfWork")
            .field("participants", &self.participants.len())
            .field("open", &self.is_open())
            .field("begins", &self.begin_count())
            .field("commits", &self.commit_count())
            .field("rollbacks", &self.rollback_count())
            .finish()
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn begin(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.begins.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            if open.is_some() {
                return Err(ProjectionError::Storage(
                    "unit of work already open".to_string(),
                ));
            }
            *open = Some(self.participants.iter().map(|p| p.snapshot()).collect());
            Ok(())
        })
    }

    fn commit(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(snapshots) = self.open.lock().unwrap().take() else {
                return Err(ProjectionError::Storage("no unit of work open".to_string()));
            };
            if take_failure(&self.failing_commits) {
                Self::restore(snapshots);
                return Err(ProjectionError::Storage(
                    "injected failure committing unit of work".to_string(),
                ));
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn rollback(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let snapshots = self.open.lock().unwrap().take();
            if let Some(snapshots) = snapshots {
                Self::restore(snapshots);
                self.rollbacks.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

/// Test harness for projectors providing a fluent testing API.
///
/// Events are wrapped in envelopes with consecutive positions starting at
/// zero on stream `"test-stream"`.
///
/// # Example
///
/// ```ignore
/// let products = InMemoryProjectionRepository::<Product>::new();
/// let projector = EntityProjector::new("catalog", map, products.clone());
/// let mut harness = ProjectionTestHarness::new(projector, products);
///
/// harness
///     .given_events(vec![added, priced])
///     .await?
///     .then_contains(&1);
/// ```
pub struct ProjectionTestHarness<E, Pr, P: Projection> {
    projector: Pr,
    repository: InMemoryProjectionRepository<P>,
    next_position: i64,
    _event: PhantomData<fn(E)>,
}

impl<E, Pr, P> ProjectionTestHarness<E, Pr, P>
where
    E: Event,
    Pr: EventProjector<E>,
    P: Projection,
{
    /// Create a new test harness for the given projector.
    ///
    /// # Arguments
    ///
    /// - `projector`: The projector to test
    /// - `repository`: The repository used by the projector (a clone of the same instance)
    #[must_use]
    pub const fn new(projector: Pr, repository: InMemoryProjectionRepository<P>) -> Self {
        Self {
            projector,
            repository,
            next_position: 0,
            _event: PhantomData,
        }
    }

    /// Apply a series of events to the projector.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`] raised while applying.
    pub async fn given_events(&mut self, events: Vec<E>) -> Result<&mut Self> {
        for event in events {
            self.given_event(event).await?;
        }
        Ok(self)
    }

    /// Apply a single event to the projector.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event fails to apply.
    pub async fn given_event(&mut self, event: E) -> Result<&mut Self> {
        let envelope = EventEnvelope::new(self.next_position, "test-stream", event);
        self.next_position += 1;
        self.given_envelope(&envelope).await
    }

    /// Apply an explicit envelope to the projector.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event fails to apply.
    pub async fn given_envelope(&mut self, envelope: &EventEnvelope<E>) -> Result<&mut Self> {
        let ctx = ProjectionContext::from_envelope(envelope);
        self.projector.project(&envelope.body, &ctx).await?;
        self.next_position = self.next_position.max(envelope.position + 1);
        Ok(self)
    }

    /// Assert that the repository contains the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not found (this is a test assertion).
    pub fn then_contains(&self, key: &P::Key) -> &Self {
        assert!(
            self.repository.contains_key(key),
            "Expected repository to contain key {key:?}, but it was not found"
        );
        self
    }

    /// Assert that the repository does not contain the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is found (this is a test assertion).
    pub fn then_not_contains(&self, key: &P::Key) -> &Self {
        assert!(
            !self.repository.contains_key(key),
            "Expected repository to NOT contain key {key:?}, but it was found"
        );
        self
    }

    /// Get a stored projection.
    #[must_use]
    pub fn get(&self, key: &P::Key) -> Option<P> {
        self.repository.get(key)
    }

    /// Get a reference to the underlying repository.
    #[must_use]
    pub const fn repository(&self) -> &InMemoryProjectionRepository<P> {
        &self.repository
    }

    /// Get a reference to the projector.
    #[must_use]
    pub const fn projector(&self) -> &Pr {
        &self.projector
    }

    /// Get a mutable reference to the projector.
    pub const fn projector_mut(&mut self) -> &mut Pr {
        &mut self.projector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[derive(Clone, Debug, PartialEq)]
    struct Tally {
        id: String,
        count: u32,
    }

    impl Projection for Tally {
        type Key = String;

        fn from_key(key: String) -> Self {
            Self { id: key, count: 0 }
        }

        fn key(&self) -> &String {
            &self.id
        }
    }

    #[tokio::test]
    async fn test_repository_counts_calls() {
        let repository = InMemoryProjectionRepository::with(vec![Tally::from_key("a".into())]);

        assert!(repository.find_by_key(&"a".into()).await.unwrap().is_some());
        assert!(repository.find_by_key(&"b".into()).await.unwrap().is_none());
        repository.save(&Tally::from_key("b".into())).await.unwrap();
        assert_eq!(repository.delete(&"a".into()).await.unwrap(), 1);
        assert_eq!(repository.delete(&"a".into()).await.unwrap(), 0);

        assert_eq!(repository.find_count(), 2);
        assert_eq!(repository.save_count(), 1);
        assert_eq!(repository.delete_count(), 2);
        assert_eq!(repository.keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_injected_save_failures() {
        let repository = InMemoryProjectionRepository::<Tally>::new();
        repository.fail_next_saves(1);

        let err = repository.save(&Tally::from_key("a".into())).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Storage(_)));
        assert!(repository.is_empty());

        repository.save(&Tally::from_key("a".into())).await.unwrap();
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn test_unit_of_work_discards_writes_on_rollback() {
        let repository = InMemoryProjectionRepository::with(vec![Tally::from_key("a".into())]);
        let store = InMemoryCheckpointStore::new();
        let unit = InMemoryUnitOfWork::new()
            .tracking(repository.clone())
            .tracking(store.clone());

        unit.begin().await.unwrap();
        assert!(unit.begin().await.is_err());
        repository.save(&Tally::from_key("b".into())).await.unwrap();
        repository.delete(&"a".into()).await.unwrap();
        store.save_checkpoint(Checkpoint::new("p", 1, Utc::now())).await.unwrap();
        unit.rollback().await.unwrap();

        assert_eq!(repository.keys(), vec!["a".to_string()]);
        assert!(store.is_empty());
        assert_eq!(repository.save_count(), 1);
        assert_eq!(unit.rollback_count(), 1);
        assert!(!unit.is_open());

        unit.begin().await.unwrap();
        repository.save(&Tally::from_key("c".into())).await.unwrap();
        unit.commit().await.unwrap();
        unit.rollback().await.unwrap();

        assert!(repository.contains_key(&"c".into()));
        assert_eq!(unit.commit_count(), 1);
        assert_eq!(unit.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_unit_of_work_failed_commit_discards_writes() {
        let repository = InMemoryProjectionRepository::<Tally>::new();
        let unit = InMemoryUnitOfWork::new().tracking(repository.clone());
        unit.fail_next_commits(1);

        unit.begin().await.unwrap();
        repository.save(&Tally::from_key("a".into())).await.unwrap();
        let err = unit.commit().await.unwrap_err();

        assert!(matches!(err, ProjectionError::Storage(_)));
        assert!(repository.is_empty());
        assert_eq!(unit.commit_count(), 0);
        assert!(unit.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoint_store_roundtrip() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.load_checkpoint("p").await.unwrap().is_none());

        store.save_checkpoint(Checkpoint::new("p", 3, Utc::now())).await.unwrap();
        assert_eq!(store.load_checkpoint("p").await.unwrap().map(|c| c.position), Some(3));

        store.fail_next_saves(1);
        assert!(store.save_checkpoint(Checkpoint::new("p", 4, Utc::now())).await.is_err());
        assert_eq!(store.position("p"), Some(3));
        assert_eq!(store.save_count(), 2);
    }
}
