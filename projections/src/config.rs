//! Configuration for checkpointed projectors.
//!
//! A [`ProjectorConfig`] describes one projection: its identifier, an
//! optional LRU cache, subscription options and an optional retry policy.
//! It can be deserialized with serde or read from `EVENTIDE_*` environment
//! variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `EVENTIDE_PROJECTION_ID` | `projection_id` (required) |
//! | `EVENTIDE_CACHE_CAPACITY` | `cache.capacity` (enables the cache) |
//! | `EVENTIDE_CACHE_RETENTION_MS` | `cache.retention_ms` |
//! | `EVENTIDE_SUBSCRIPTION_ID` | `subscription.id` (defaults to the projection id) |
//! | `EVENTIDE_RESTART_WHEN_AHEAD` | `subscription.restart_when_ahead` |
//! | `EVENTIDE_RETRY_MAX` | `retry.max_retries` (enables retries) |
//! | `EVENTIDE_RETRY_INITIAL_DELAY_MS` | `retry.initial_delay_ms` |
//! | `EVENTIDE_RETRY_MAX_DELAY_MS` | `retry.max_delay_ms` |
//! | `EVENTIDE_RETRY_MULTIPLIER` | `retry.multiplier` |
//!
//! # Example
//!
//! ```no_run
//! use eventide_projections::config::ProjectorConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProjectorConfig::from_env()?;
//! println!("Projection: {}", config.projection_id);
//! # Ok(())
//! # }
//! ```
//!
//! The configuration then builds the projector stack:
//!
//! ```ignore
//! let projector = config.entity_projector(catalog_map(), products);
//! let projector = config.checkpointed(projector, checkpoints)?;
//! let manager = ProjectionManager::configured(&config, projector, Dispatcher::new(factory))?;
//! ```

use crate::builder::EntityEventMap;
use crate::cache::LruCache;
use crate::dispatcher::SubscriptionOptions;
use crate::projector::{CheckpointedProjector, EntityProjector};
use crate::retry::RetryPolicy;
use eventide_core::event::Event;
use eventide_core::projection::{
    CheckpointStore, EventProjector, Projection, ProjectionContext, ProjectionRepository,
};
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Environment variable not set: {0}")]
    MissingVar(String),

    /// A variable could not be parsed.
    #[error("Invalid value for {var}: {reason}")]
    Parse {
        /// Variable name.
        var: String,
        /// Parser message.
        reason: String,
    },

    /// The configuration is inconsistent.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// LRU cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries per generation.
    pub capacity: usize,
    /// Time-to-live of an entry in milliseconds; unlimited when absent.
    pub retention_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            retention_ms: None,
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Validation("cache capacity must be > 0".to_string()));
        }
        if self.retention_ms == Some(0) {
            return Err(ConfigError::Validation("cache retention_ms must be > 0".to_string()));
        }
        Ok(())
    }

    /// Get retention as Duration
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    /// Build an empty cache.
    #[must_use]
    pub fn build<K, V>(&self) -> LruCache<K, V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        let cache = LruCache::new(self.capacity);
        match self.retention() {
            Some(retention) => cache.with_retention(retention),
            None => cache,
        }
    }
}

/// Subscription configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Identifier handed to the subscription factory.
    pub id: String,
    /// Resubscribe from the start of the log when the checkpoint is ahead.
    pub restart_when_ahead: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        let options = SubscriptionOptions::default();
        Self {
            id: options.id,
            restart_when_ahead: options.restart_when_ahead,
        }
    }
}

impl SubscriptionConfig {
    /// Subscription options without a restart hook.
    #[must_use]
    pub fn to_options(&self) -> SubscriptionOptions {
        SubscriptionOptions::new(self.id.clone()).with_restart_when_ahead(self.restart_when_ahead)
    }
}

/// Retry configuration for failed batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the delay in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: u64::try_from(policy.initial_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
            multiplier: policy.multiplier,
        }
    }
}

impl RetryConfig {
    /// Validate retry configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ConfigError::Validation(
                "retry multiplier must be a finite value >= 1.0".to_string(),
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Validation(
                "retry initial_delay_ms must not exceed max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the retry policy.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .multiplier(self.multiplier)
            .build()
    }
}

/// Configuration of one checkpointed projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// Projection identifier, used as the checkpoint key.
    pub projection_id: String,
    /// LRU cache; the pass-through cache is used when absent.
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    /// Subscription options.
    #[serde(default)]
    pub subscription: SubscriptionConfig,
    /// Retry policy; failed batches are not retried when absent.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ProjectorConfig {
    /// Configuration with defaults for `projection_id`.
    #[must_use]
    pub fn new(projection_id: impl Into<String>) -> Self {
        let projection_id = projection_id.into();
        Self {
            subscription: SubscriptionConfig {
                id: projection_id.clone(),
                ..SubscriptionConfig::default()
            },
            projection_id,
            cache: None,
            retry: None,
        }
    }

    /// Load configuration from `EVENTIDE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or invalid, or the result does
    /// not validate
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from any variable source.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is missing or invalid, or the result does
    /// not validate
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let projection_id = lookup("EVENTIDE_PROJECTION_ID")
            .ok_or_else(|| ConfigError::MissingVar("EVENTIDE_PROJECTION_ID".to_string()))?;
        let mut config = Self::new(projection_id);

        if let Some(capacity) = parse_var(&lookup, "EVENTIDE_CACHE_CAPACITY")? {
            config.cache = Some(CacheConfig {
                capacity,
                retention_ms: parse_var(&lookup, "EVENTIDE_CACHE_RETENTION_MS")?,
            });
        }

        if let Some(id) = lookup("EVENTIDE_SUBSCRIPTION_ID") {
            config.subscription.id = id;
        }
        if let Some(restart) = parse_var(&lookup, "EVENTIDE_RESTART_WHEN_AHEAD")? {
            config.subscription.restart_when_ahead = restart;
        }

        if let Some(max_retries) = parse_var(&lookup, "EVENTIDE_RETRY_MAX")? {
            let defaults = RetryConfig::default();
            config.retry = Some(RetryConfig {
                max_retries,
                initial_delay_ms: parse_var(&lookup, "EVENTIDE_RETRY_INITIAL_DELAY_MS")?
                    .unwrap_or(defaults.initial_delay_ms),
                max_delay_ms: parse_var(&lookup, "EVENTIDE_RETRY_MAX_DELAY_MS")?
                    .unwrap_or(defaults.max_delay_ms),
                multiplier: parse_var(&lookup, "EVENTIDE_RETRY_MULTIPLIER")?
                    .unwrap_or(defaults.multiplier),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns error if any section is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.projection_id.trim().is_empty() {
            return Err(ConfigError::Validation("projection_id cannot be empty".to_string()));
        }
        if self.subscription.id.trim().is_empty() {
            return Err(ConfigError::Validation("subscription id cannot be empty".to_string()));
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }

    /// Retry policy, if retries are configured.
    #[must_use]
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry.as_ref().map(RetryConfig::to_policy)
    }

    /// The configured cache, empty, or `None` when caching is off.
    #[must_use]
    pub fn build_cache<K, V>(&self) -> Option<LruCache<K, V>>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        self.cache.as_ref().map(CacheConfig::build)
    }

    /// Entity projector named after the projection, with the configured
    /// cache in front of `repository`.
    #[must_use]
    pub fn entity_projector<P, R, E>(
        &self,
        map: EntityEventMap<P, E, ProjectionContext>,
        repository: R,
    ) -> EntityProjector<P, R, E, Option<LruCache<P::Key, P>>>
    where
        P: Projection,
        R: ProjectionRepository<P>,
        E: Event,
    {
        EntityProjector::new(self.projection_id.clone(), map, repository)
            .with_cache(self.build_cache())
    }

    /// Wrap `projector` with checkpointing and the configured retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if the configuration is invalid or
    /// `projector` is not named after the projection, since its name is the
    /// checkpoint key.
    pub fn checkpointed<E, Pr>(
        &self,
        projector: Pr,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<CheckpointedProjector<E, Pr>, ConfigError>
    where
        E: Event,
        Pr: EventProjector<E>,
    {
        self.validate()?;
        if projector.name() != self.projection_id {
            return Err(ConfigError::Validation(format!(
                "projector '{}' does not match projection_id '{}'",
                projector.name(),
                self.projection_id
            )));
        }

        let projector = CheckpointedProjector::new(projector, checkpoints);
        Ok(match self.retry_policy() {
            Some(policy) => projector.with_retry_policy(policy),
            None => projector,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
                var: var.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_minimal_environment() {
        let config = ProjectorConfig::from_lookup(lookup(&[("EVENTIDE_PROJECTION_ID", "catalog")])).unwrap();

        assert_eq!(config.projection_id, "catalog");
        assert_eq!(config.subscription.id, "catalog");
        assert!(config.subscription.restart_when_ahead);
        assert!(config.cache.is_none());
        assert!(config.retry_policy().is_none());
    }

    #[test]
    fn test_full_environment() {
        let config = ProjectorConfig::from_lookup(lookup(&[
            ("EVENTIDE_PROJECTION_ID", "catalog"),
            ("EVENTIDE_CACHE_CAPACITY", "64"),
            ("EVENTIDE_CACHE_RETENTION_MS", "30000"),
            ("EVENTIDE_SUBSCRIPTION_ID", "catalog-feed"),
            ("EVENTIDE_RESTART_WHEN_AHEAD", "false"),
            ("EVENTIDE_RETRY_MAX", "5"),
            ("EVENTIDE_RETRY_INITIAL_DELAY_MS", "10"),
        ]))
        .unwrap();

        let cache = config.cache.as_ref().unwrap();
        assert_eq!(cache.capacity, 64);
        assert_eq!(cache.retention(), Some(Duration::from_secs(30)));
        assert_eq!(config.subscription.to_options().id, "catalog-feed");
        assert!(!config.subscription.restart_when_ahead);

        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(10));
        assert_eq!(policy.max_delay, RetryPolicy::default().max_delay);
    }

    #[test]
    fn test_missing_projection_id() {
        let err = ProjectorConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::MissingVar("EVENTIDE_PROJECTION_ID".to_string()));
    }

    #[test]
    fn test_unparseable_variable() {
        let err = ProjectorConfig::from_lookup(lookup(&[
            ("EVENTIDE_PROJECTION_ID", "catalog"),
            ("EVENTIDE_CACHE_CAPACITY", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref var, .. } if var == "EVENTIDE_CACHE_CAPACITY"));
    }

    #[test]
    fn test_validation() {
        let mut config = ProjectorConfig::new("catalog");
        assert!(config.validate().is_ok());

        config.cache = Some(CacheConfig {
            capacity: 0,
            retention_ms: None,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        config.cache = None;
        config.retry = Some(RetryConfig {
            multiplier: 0.5,
            ..RetryConfig::default()
        });
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ProjectorConfig = serde_json::from_str(
            r#"{ "projection_id": "catalog", "cache": { "capacity": 3 } }"#,
        )
        .unwrap();

        assert_eq!(config.cache.as_ref().map(|c| c.capacity), Some(3));
        assert_eq!(config.subscription, SubscriptionConfig::default());
        assert!(config.validate().is_ok());

        let cache = config.cache.unwrap().build::<u32, String>();
        assert_eq!(cache.capacity(), 3);
    }
}
