//! Create, update and delete semantics against a projection repository.
//!
//! A [`ProjectionMerge`] binds a repository and a cache for the duration of
//! one event. Every lookup goes through the cache, and every successful write
//! refreshes it, so a create followed by an update of the same key within a
//! batch reaches the repository's `find` only once when a real cache is used.
//!
//! The decisions taken when a create meets an existing projection, or an
//! update/delete meets a missing one, are passed in as callbacks. The
//! builders in [`crate::builder`] turn registration-time policies into those
//! callbacks.

use crate::cache::ProjectionCache;
use eventide_core::projection::{Projection, ProjectionRepository, Result};
use eventide_core::subscription::BoxFuture;
use std::marker::PhantomData;

/// Object-safe view of a merge scope, handed to custom actions.
pub trait MergeOps<P: Projection>: Send {
    /// Load a projection through the cache.
    fn load<'a>(&'a mut self, key: &'a P::Key) -> BoxFuture<'a, Result<Option<P>>>;

    /// Save a projection and refresh the cache.
    fn store<'a>(&'a mut self, projection: P) -> BoxFuture<'a, Result<()>>;

    /// Delete a projection and evict it from the cache. Returns whether a
    /// record was removed.
    fn remove<'a>(&'a mut self, key: &'a P::Key) -> BoxFuture<'a, Result<bool>>;
}

/// Merge scope over one repository and cache.
pub struct ProjectionMerge<'a, P, R, Ch> {
    repository: &'a R,
    cache: &'a mut Ch,
    _projection: PhantomData<fn() -> P>,
}

impl<'a, P, R, Ch> ProjectionMerge<'a, P, R, Ch>
where
    P: Projection,
    R: ProjectionRepository<P>,
    Ch: ProjectionCache<P::Key, P>,
{
    /// Bind a repository and a cache.
    pub fn new(repository: &'a R, cache: &'a mut Ch) -> Self {
        Self {
            repository,
            cache,
            _projection: PhantomData,
        }
    }

    /// Load the projection stored under `key`, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Propagates repository errors.
    pub async fn find(&mut self, key: &P::Key) -> Result<Option<P>> {
        let repository = self.repository;
        self.cache.get(key, || repository.find_by_key(key)).await
    }

    /// Save `projection` and refresh its cache entry.
    ///
    /// # Errors
    ///
    /// Propagates repository errors. The cache is left untouched on failure.
    pub async fn save(&mut self, projection: P) -> Result<()> {
        self.repository.save(&projection).await?;
        self.cache.add(projection.key().clone(), projection);
        Ok(())
    }

    /// Create the projection for `key`.
    ///
    /// When none exists a bare projection is built from the key, mutated and
    /// saved. When one exists, `should_overwrite` decides whether the
    /// existing instance is mutated and saved or left alone.
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Propagates repository errors and errors from `should_overwrite`.
    pub async fn create<M, O>(&mut self, key: P::Key, mutate: M, should_overwrite: O) -> Result<bool>
    where
        M: FnOnce(&mut P) + Send,
        O: FnOnce(&P) -> Result<bool> + Send,
    {
        let mut projection = match self.find(&key).await? {
            None => P::from_key(key),
            Some(existing) => {
                if !should_overwrite(&existing)? {
                    tracing::debug!(key = ?existing.key(), "Keeping existing projection");
                    return Ok(false);
                }
                existing
            }
        };

        mutate(&mut projection);
        self.save(projection).await?;
        Ok(true)
    }

    /// Update the projection for `key`.
    ///
    /// When none exists, `create_if_missing` decides whether a bare
    /// projection is built from the key and updated, or the update is
    /// skipped.
    ///
    /// Returns whether anything was written.
    ///
    /// # Errors
    ///
    /// Propagates repository errors and errors from `create_if_missing`.
    pub async fn update<M, C>(&mut self, key: P::Key, mutate: M, create_if_missing: C) -> Result<bool>
    where
        M: FnOnce(&mut P) + Send,
        C: FnOnce() -> Result<bool> + Send,
    {
        let mut projection = match self.find(&key).await? {
            Some(existing) => existing,
            None => {
                if !create_if_missing()? {
                    tracing::debug!(key = ?key, "Skipping update of missing projection");
                    return Ok(false);
                }
                P::from_key(key)
            }
        };

        mutate(&mut projection);
        self.save(projection).await?;
        Ok(true)
    }

    /// Delete the projection for `key` and evict it from the cache.
    ///
    /// The cache entry is evicted even when the repository fails.
    ///
    /// # Errors
    ///
    /// Propagates repository errors.
    pub async fn delete(&mut self, key: &P::Key) -> Result<bool> {
        let deleted = self.repository.delete(key).await;
        self.cache.remove(key);
        Ok(deleted? > 0)
    }
}

impl<P, R, Ch> MergeOps<P> for ProjectionMerge<'_, P, R, Ch>
where
    P: Projection,
    R: ProjectionRepository<P>,
    Ch: ProjectionCache<P::Key, P>,
{
    fn load<'a>(&'a mut self, key: &'a P::Key) -> BoxFuture<'a, Result<Option<P>>> {
        Box::pin(self.find(key))
    }

    fn store<'a>(&'a mut self, projection: P) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.save(projection))
    }

    fn remove<'a>(&'a mut self, key: &'a P::Key) -> BoxFuture<'a, Result<bool>> {
        Box::pin(self.delete(key))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::cache::{LruCache, PassThroughCache};
    use eventide_core::ProjectionError;
    use eventide_testing::InMemoryProjectionRepository;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Counter {
        id: u32,
        hits: u32,
    }

    impl Projection for Counter {
        type Key = u32;

        fn from_key(key: u32) -> Self {
            Self { id: key, hits: 0 }
        }

        fn key(&self) -> &u32 {
            &self.id
        }
    }

    #[tokio::test]
    async fn create_builds_from_key() {
        let repository = InMemoryProjectionRepository::<Counter>::new();
        let mut cache = PassThroughCache;
        let mut merge = ProjectionMerge::new(&repository, &mut cache);

        let written = merge.create(1, |c| c.hits = 1, |_| Ok(false)).await.unwrap();

        assert!(written);
        assert_eq!(repository.get(&1), Some(Counter { id: 1, hits: 1 }));
    }

    #[tokio::test]
    async fn create_consults_overwrite_decision() {
        let repository = InMemoryProjectionRepository::with(vec![Counter { id: 1, hits: 5 }]);
        let mut cache = PassThroughCache;
        let mut merge = ProjectionMerge::new(&repository, &mut cache);

        assert!(!merge.create(1, |c| c.hits = 0, |_| Ok(false)).await.unwrap());
        assert_eq!(repository.get(&1).unwrap().hits, 5);

        assert!(merge.create(1, |c| c.hits += 1, |_| Ok(true)).await.unwrap());
        assert_eq!(repository.get(&1).unwrap().hits, 6);

        let err = merge
            .create(1, |_| {}, |existing| Err(ProjectionError::duplicate_key(existing.key())))
            .await
            .unwrap_err();
        assert!(matches!(err, ProjectionError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn update_skips_or_creates_missing() {
        let repository = InMemoryProjectionRepository::<Counter>::new();
        let mut cache = PassThroughCache;
        let mut merge = ProjectionMerge::new(&repository, &mut cache);

        assert!(!merge.update(2, |c| c.hits += 1, || Ok(false)).await.unwrap());
        assert!(repository.is_empty());

        assert!(merge.update(2, |c| c.hits += 1, || Ok(true)).await.unwrap());
        assert_eq!(repository.get(&2), Some(Counter { id: 2, hits: 1 }));
    }

    #[tokio::test]
    async fn delete_reports_removal_and_evicts_cache() {
        let repository = InMemoryProjectionRepository::with(vec![Counter { id: 3, hits: 1 }]);
        let mut cache = LruCache::new(4);

        {
            let mut merge = ProjectionMerge::new(&repository, &mut cache);
            assert!(merge.find(&3).await.unwrap().is_some());
            assert!(merge.delete(&3).await.unwrap());
            assert!(!merge.delete(&3).await.unwrap());
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cached_lookups_skip_the_repository() {
        let repository = InMemoryProjectionRepository::<Counter>::new();
        let mut cache = LruCache::new(3);
        let mut merge = ProjectionMerge::new(&repository, &mut cache);

        merge.create(7, |c| c.hits = 1, |_| Ok(false)).await.unwrap();
        merge.update(7, |c| c.hits += 1, || Ok(false)).await.unwrap();

        assert_eq!(repository.find_count(), 1);
        assert_eq!(repository.get(&7).unwrap().hits, 2);
    }

    #[tokio::test]
    async fn merge_ops_are_object_safe() {
        let repository = InMemoryProjectionRepository::<Counter>::new();
        let mut cache = PassThroughCache;
        let mut merge = ProjectionMerge::new(&repository, &mut cache);
        let ops: &mut dyn MergeOps<Counter> = &mut merge;

        ops.store(Counter { id: 9, hits: 9 }).await.unwrap();
        assert_eq!(ops.load(&9).await.unwrap().map(|c| c.hits), Some(9));
        assert!(ops.remove(&9).await.unwrap());
    }
}
