//! Write-through caches in front of a projection repository's `find`.
//!
//! Two implementations are provided:
//!
//! - [`PassThroughCache`]: caches nothing; every lookup reaches the store.
//! - [`LruCache`]: a bounded, time-aware cache built from two generations
//!   of entries (`current` and `previous`).
//!
//! # Generations
//!
//! New entries go into `current`. Once `current` holds `capacity` entries
//! it becomes `previous`, and whatever `previous` held before is evicted.
//! A hit in `previous` moves the entry back into `current`. This keeps
//! recently used entries alive without tracking a full recency order.
//!
//! ```text
//!  add ──► current ──(full)──► previous ──(next rotation)──► evicted
//!            ▲                     │
//!            └──── hit promotes ───┘
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use eventide_core::environment::{Clock, SystemClock};
use eventide_core::projection::Result;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// A cache consulted before the repository's `find`.
pub trait ProjectionCache<K, V>: Send {
    /// Insert or refresh an entry.
    fn add(&mut self, key: K, value: V);

    /// Remove an entry.
    fn remove(&mut self, key: &K);

    /// Remove all entries.
    fn clear(&mut self);

    /// Return the cached value or await `compute_if_absent`.
    ///
    /// A present computed value is cached; an absent one is not.
    ///
    /// # Errors
    ///
    /// Propagates any error returned by `compute_if_absent`.
    fn get<F, Fut>(
        &mut self,
        key: &K,
        compute_if_absent: F,
    ) -> impl Future<Output = Result<Option<V>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send;
}

/// Cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCache;

impl<K, V> ProjectionCache<K, V> for PassThroughCache
where
    K: Sync,
    V: Send,
{
    fn add(&mut self, _key: K, _value: V) {}

    fn remove(&mut self, _key: &K) {}

    fn clear(&mut self) {}

    async fn get<F, Fut>(&mut self, _key: &K, compute_if_absent: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send,
    {
        compute_if_absent().await
    }
}

/// An absent cache stores nothing, like [`PassThroughCache`].
impl<K, V, C> ProjectionCache<K, V> for Option<C>
where
    K: Sync,
    V: Send,
    C: ProjectionCache<K, V>,
{
    fn add(&mut self, key: K, value: V) {
        if let Some(cache) = self {
            cache.add(key, value);
        }
    }

    fn remove(&mut self, key: &K) {
        if let Some(cache) = self {
            cache.remove(key);
        }
    }

    fn clear(&mut self) {
        if let Some(cache) = self {
            cache.clear();
        }
    }

    async fn get<F, Fut>(&mut self, key: &K, compute_if_absent: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send,
    {
        match self {
            Some(cache) => cache.get(key, compute_if_absent).await,
            None => compute_if_absent().await,
        }
    }
}

/// Callback invoked for every entry dropped by a generation rotation.
pub type EvictionListener<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded two-generation cache with optional per-entry retention.
///
/// At most `2 * capacity` entries are held at any time.
///
/// # Example
///
/// ```
/// use eventide_projections::cache::{LruCache, ProjectionCache};
/// use std::time::Duration;
///
/// let mut cache: LruCache<u64, String> = LruCache::new(100)
///     .with_retention(Duration::from_secs(60));
/// cache.add(1, "one".to_string());
/// assert_eq!(cache.len(), 1);
/// ```
pub struct LruCache<K, V> {
    capacity: usize,
    retention: Option<TimeDelta>,
    current: HashMap<K, Entry<V>>,
    previous: HashMap<K, Entry<V>>,
    clock: Arc<dyn Clock>,
    on_eviction: Option<EvictionListener<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding `capacity` entries per generation.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            retention: None,
            current: HashMap::new(),
            previous: HashMap::new(),
            clock: Arc::new(SystemClock),
            on_eviction: None,
        }
    }

    /// Expire entries `retention` after they were written.
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX));
        self
    }

    /// Use `clock` to compute expiry times.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Be notified of entries dropped by rotation.
    #[must_use]
    pub fn with_eviction_listener(mut self, listener: impl Fn(&K, &V) + Send + Sync + 'static) -> Self {
        self.on_eviction = Some(Arc::new(listener));
        self
    }

    /// Entries per generation.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries held, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.previous.is_empty()
    }

    /// Look up `key` without computing a missing value.
    pub fn peek(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now();

        if let Some(entry) = self.current.get(key) {
            if entry.is_expired(now) {
                self.current.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }

        let entry = self.previous.remove(key)?;
        if entry.is_expired(now) {
            return None;
        }
        let value = entry.value.clone();
        self.insert_current(key.clone(), entry);
        Some(value)
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        let retention = self.retention?;
        Some(
            self.clock
                .now()
                .checked_add_signed(retention)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    fn insert_current(&mut self, key: K, entry: Entry<V>) {
        self.current.insert(key, entry);
        if self.current.len() >= self.capacity {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        let evicted = std::mem::replace(&mut self.previous, std::mem::take(&mut self.current));
        tracing::trace!(evicted = evicted.len(), "Rotating cache generations");
        if let Some(listener) = &self.on_eviction {
            for (key, entry) in &evicted {
                listener(key, &entry.value);
            }
        }
    }
}

impl<K, V> ProjectionCache<K, V> for LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn add(&mut self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: self.expiry(),
        };
        if let Some(existing) = self.current.get_mut(&key) {
            *existing = entry;
            return;
        }
        self.previous.remove(&key);
        self.insert_current(key, entry);
    }

    fn remove(&mut self, key: &K) {
        self.current.remove(key);
        self.previous.remove(key);
    }

    fn clear(&mut self) {
        self.current.clear();
        self.previous.clear();
    }

    async fn get<F, Fut>(&mut self, key: &K, compute_if_absent: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>>> + Send,
    {
        if let Some(value) = self.peek(key) {
            return Ok(Some(value));
        }

        let computed = compute_if_absent().await?;
        if let Some(value) = &computed {
            self.add(key.clone(), value.clone());
        }
        Ok(computed)
    }
}

impl<K, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("retention", &self.retention)
            .field("current", &self.current.len())
            .field("previous", &self.previous.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use eventide_testing::mocks::ManualClock;
    use std::sync::Mutex;

    async fn fetch(cache: &mut LruCache<u32, String>, key: u32, calls: &mut u32) -> Option<String> {
        cache
            .get(&key, || {
                *calls += 1;
                async move { Ok(Some(format!("computed-{key}"))) }
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn optional_cache_caches_only_when_present() {
        let mut absent: Option<LruCache<u32, String>> = None;
        absent.add(1, "one".to_string());
        let mut calls = 0;
        for _ in 0..2 {
            let value = absent
                .get(&1, || {
                    calls += 1;
                    async { Ok(Some("computed".to_string())) }
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref(), Some("computed"));
        }
        assert_eq!(calls, 2);

        let mut present = Some(LruCache::new(3));
        present.add(1, "one".to_string());
        let value = present
            .get(&1, || async { Ok(Some("computed".to_string())) })
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("one"));
        present.clear();
        assert!(present.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn hit_skips_compute() {
        let mut cache = LruCache::new(3);
        cache.add(1, "one".to_string());
        let mut calls = 0;

        assert_eq!(fetch(&mut cache, 1, &mut calls).await.as_deref(), Some("one"));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn absent_result_is_not_cached() {
        let mut cache: LruCache<u32, String> = LruCache::new(3);
        for _ in 0..2 {
            let value = cache.get(&7, || async { Ok(None) }).await.unwrap();
            assert!(value.is_none());
        }
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn compute_errors_propagate() {
        let mut cache: LruCache<u32, String> = LruCache::new(3);
        let result = cache
            .get(&7, || async {
                Err(eventide_core::ProjectionError::Storage("down".into()))
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn oldest_generation_is_evicted() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let mut cache = LruCache::new(3)
            .with_eviction_listener(move |key: &u32, _: &String| sink.lock().unwrap().push(*key));

        for key in 0..6 {
            cache.add(key, format!("v{key}"));
        }

        let mut evicted = evicted.lock().unwrap().clone();
        evicted.sort_unstable();
        assert_eq!(evicted, vec![0, 1, 2]);

        let mut calls = 0;
        assert_eq!(fetch(&mut cache, 0, &mut calls).await.as_deref(), Some("computed-0"));
        assert_eq!(calls, 1);
        assert_eq!(fetch(&mut cache, 4, &mut calls).await.as_deref(), Some("v4"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn previous_generation_hit_is_promoted() {
        let mut cache = LruCache::new(3);
        for key in 0..3 {
            cache.add(key, format!("v{key}"));
        }
        // 0, 1, 2 now sit in the previous generation
        assert_eq!(cache.peek(&0).as_deref(), Some("v0"));

        // Two more inserts fill current (0 + 3 + 4) and rotate again.
        cache.add(3, "v3".to_string());
        cache.add(4, "v4".to_string());

        let mut calls = 0;
        assert_eq!(fetch(&mut cache, 0, &mut calls).await.as_deref(), Some("v0"));
        assert_eq!(fetch(&mut cache, 1, &mut calls).await.as_deref(), Some("computed-1"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let clock = Arc::new(ManualClock::default());
        let mut cache = LruCache::new(10)
            .with_retention(Duration::from_secs(30))
            .with_clock(clock.clone());
        cache.add(1, "fresh".to_string());

        clock.advance(Duration::from_secs(29));
        let mut calls = 0;
        assert_eq!(fetch(&mut cache, 1, &mut calls).await.as_deref(), Some("fresh"));

        clock.advance(Duration::from_secs(1));
        assert_eq!(fetch(&mut cache, 1, &mut calls).await.as_deref(), Some("computed-1"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn remove_and_clear_drop_entries() {
        let mut cache = LruCache::new(2);
        cache.add("a", 1);
        cache.add("b", 2);
        cache.add("c", 3);
        cache.remove(&"a");
        assert_eq!(cache.peek(&"a"), None);
        assert_eq!(cache.peek(&"c"), Some(3));

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache: LruCache<u8, u8> = LruCache::new(0);
        assert_eq!(cache.capacity(), 1);
    }
}
