//! Engine Configuration
//!
//! One struct per concern, every field defaulted so a partial JSON document
//! or a handful of environment variables is enough.
//!
//! Environment overrides (all optional):
//!
//! | Variable                               | Field                          |
//! |----------------------------------------|--------------------------------|
//! | `TICKET_ENGINE_VIEWS_TTL_SECS`         | `cache.views.ttl_secs`         |
//! | `TICKET_ENGINE_VIEWS_CAPACITY`         | `cache.views.capacity`         |
//! | `TICKET_ENGINE_TICKETS_TTL_SECS`       | `cache.tickets.ttl_secs`       |
//! | `TICKET_ENGINE_TICKETS_CAPACITY`       | `cache.tickets.capacity`       |
//! | `TICKET_ENGINE_USERS_TTL_SECS`         | `cache.users.ttl_secs`         |
//! | `TICKET_ENGINE_USERS_CAPACITY`         | `cache.users.capacity`         |
//! | `TICKET_ENGINE_COALESCE_POPULATION`    | `cache.coalesce_population`    |
//! | `TICKET_ENGINE_SWEEP_INTERVAL_SECS`    | `cache.sweep_interval_secs`    |
//! | `TICKET_ENGINE_MAX_WORKERS`            | `batch.max_workers`            |
//! | `TICKET_ENGINE_BATCH_SIZE`             | `batch.batch_size`             |
//! | `TICKET_ENGINE_ITEM_TIMEOUT_SECS`      | `batch.item_timeout_secs`      |
//! | `TICKET_ENGINE_CONTINUE_ON_ERROR`      | `batch.continue_on_error`      |
//! | `TICKET_ENGINE_RETRY_MAX_RETRIES`      | `retry.max_retries`            |
//! | `TICKET_ENGINE_RETRY_BASE_DELAY_MS`    | `retry.base_delay_ms`          |
//! | `TICKET_ENGINE_RETRY_MAX_DELAY_MS`     | `retry.max_delay_ms`           |

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};

const ENV_PREFIX: &str = "TICKET_ENGINE_";

/// Which entry goes first when a store is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Least recently read or written
    #[default]
    Lru,
    /// Least recently inserted; reads do not refresh position
    Fifo,
}

/// Settings for a single TTL store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl StoreConfig {
    #[must_use]
    pub fn new(ttl_secs: u64, capacity: usize) -> Self {
        Self {
            ttl_secs,
            capacity,
            eviction: EvictionPolicy::Lru,
        }
    }

    #[must_use]
    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Cache layer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub views: StoreConfig,
    pub tickets: StoreConfig,
    pub users: StoreConfig,
    /// Serialise concurrent misses on the same key (single-flight)
    pub coalesce_population: bool,
    /// Run a background purge of expired entries at this interval
    pub sweep_interval_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            views: StoreConfig::new(900, 100),
            tickets: StoreConfig::new(300, 1000),
            users: StoreConfig::new(1800, 500),
            coalesce_population: false,
            sweep_interval_secs: None,
        }
    }
}

/// Batch processor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_workers: usize,
    /// Items per `process_batch` call when chunking a larger set
    pub batch_size: usize,
    pub item_timeout_secs: Option<u64>,
    pub continue_on_error: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            batch_size: 50,
            item_timeout_secs: None,
            continue_on_error: true,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_secs.map(Duration::from_secs)
    }
}

/// Retry strategy settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `TICKET_ENGINE_*` environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse, or if the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        let cache = &mut config.cache;
        env_override("VIEWS_TTL_SECS", &mut cache.views.ttl_secs)?;
        env_override("VIEWS_CAPACITY", &mut cache.views.capacity)?;
        env_override("TICKETS_TTL_SECS", &mut cache.tickets.ttl_secs)?;
        env_override("TICKETS_CAPACITY", &mut cache.tickets.capacity)?;
        env_override("USERS_TTL_SECS", &mut cache.users.ttl_secs)?;
        env_override("USERS_CAPACITY", &mut cache.users.capacity)?;
        env_override("COALESCE_POPULATION", &mut cache.coalesce_population)?;
        env_override_opt("SWEEP_INTERVAL_SECS", &mut cache.sweep_interval_secs)?;

        let batch = &mut config.batch;
        env_override("MAX_WORKERS", &mut batch.max_workers)?;
        env_override("BATCH_SIZE", &mut batch.batch_size)?;
        env_override_opt("ITEM_TIMEOUT_SECS", &mut batch.item_timeout_secs)?;
        env_override("CONTINUE_ON_ERROR", &mut batch.continue_on_error)?;

        let retry = &mut config.retry;
        env_override("RETRY_MAX_RETRIES", &mut retry.max_retries)?;
        env_override("RETRY_BASE_DELAY_MS", &mut retry.base_delay_ms)?;
        env_override("RETRY_MAX_DELAY_MS", &mut retry.max_delay_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON or an invalid configuration.
    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: Self =
            serde_json::from_str(json).context("Failed to parse engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Reject settings the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (name, store) in [
            ("views", &self.cache.views),
            ("tickets", &self.cache.tickets),
            ("users", &self.cache.users),
        ] {
            if store.capacity == 0 {
                return Err(EngineError::Config(format!("cache.{name}.capacity must be > 0")));
            }
            if store.ttl_secs == 0 {
                return Err(EngineError::Config(format!("cache.{name}.ttl_secs must be > 0")));
            }
        }
        if self.cache.sweep_interval_secs == Some(0) {
            return Err(EngineError::Config("cache.sweep_interval_secs must be > 0".into()));
        }
        if self.batch.max_workers == 0 {
            return Err(EngineError::Config("batch.max_workers must be > 0".into()));
        }
        if self.batch.batch_size == 0 {
            return Err(EngineError::Config("batch.batch_size must be > 0".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(EngineError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn env_override<T>(name: &str, slot: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = format!("{ENV_PREFIX}{name}");
    if let Ok(raw) = std::env::var(&var) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {var}: {raw:?}"))?;
        debug!(var = %var, "Applied configuration override");
    }
    Ok(())
}

fn env_override_opt<T>(name: &str, slot: &mut Option<T>) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let var = format!("{ENV_PREFIX}{name}");
    if let Ok(raw) = std::env::var(&var) {
        let raw = raw.trim();
        *slot = if raw.is_empty() {
            None
        } else {
            Some(raw.parse().with_context(|| format!("Invalid value for {var}: {raw:?}"))?)
        };
        debug!(var = %var, "Applied configuration override");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_store_categories() {
        let config = EngineConfig::default();
        assert_eq!(config.cache.views, StoreConfig::new(900, 100));
        assert_eq!(config.cache.tickets, StoreConfig::new(300, 1000));
        assert_eq!(config.cache.users, StoreConfig::new(1800, 500));
        assert_eq!(config.batch.max_workers, 5);
        assert!(config.batch.continue_on_error);
        assert!(!config.cache.coalesce_population);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "cache": { "tickets": { "ttl_secs": 60, "capacity": 10, "eviction": "fifo" } },
                "batch": { "max_workers": 8 }
            }"#,
        )
        .unwrap_or_else(|e| panic!("config should parse: {e:#}"));

        assert_eq!(config.cache.tickets.ttl_secs, 60);
        assert_eq!(config.cache.tickets.eviction, EvictionPolicy::Fifo);
        assert_eq!(config.cache.views, StoreConfig::new(900, 100));
        assert_eq!(config.batch.max_workers, 8);
        assert_eq!(config.batch.batch_size, 50);
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = EngineConfig::default();
        config.batch.max_workers = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 100;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let json = r#"{ "cache": { "users": { "ttl_secs": 10, "capacity": 0 } } }"#;
        assert!(EngineConfig::from_json_str(json).is_err());
    }
}
