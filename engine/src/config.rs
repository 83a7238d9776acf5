//! Engine configuration.

use crate::ConflictStrategy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Quiet period after a local mutation before a sync cycle runs
    pub debounce: Duration,
    /// Interval of the background sync tick
    pub sync_interval: Duration,
    /// Automatic retries before an operation fails terminally
    pub max_retries: u32,
    /// Dirty changes sent per batch
    pub dirty_batch_size: usize,
    /// Queued operations sent per batch
    pub queue_batch_size: usize,
    /// Nominal bound of the item cache
    pub max_cache_size: usize,
    /// Render local mutations before the server confirms them
    pub enable_optimistic_updates: bool,
    /// What to do when a stale write is rejected
    pub conflict_strategy: ConflictStrategy,
    /// Storage key for the persisted snapshot
    pub storage_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(2_000),
            sync_interval: Duration::from_secs(30),
            max_retries: 3,
            dirty_batch_size: 50,
            queue_batch_size: 20,
            max_cache_size: 500,
            enable_optimistic_updates: true,
            conflict_strategy: ConflictStrategy::Manual,
            storage_key: "syncwell.state".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            debounce: env_parse::<u64>("SYNC_DEBOUNCE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.debounce),
            sync_interval: env_parse::<u64>("SYNC_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_interval),
            max_retries: env_parse("SYNC_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            dirty_batch_size: env_parse("SYNC_DIRTY_BATCH_SIZE")?
                .unwrap_or(defaults.dirty_batch_size),
            queue_batch_size: env_parse("SYNC_QUEUE_BATCH_SIZE")?
                .unwrap_or(defaults.queue_batch_size),
            max_cache_size: env_parse("SYNC_MAX_CACHE_SIZE")?.unwrap_or(defaults.max_cache_size),
            enable_optimistic_updates: env_parse("SYNC_OPTIMISTIC_UPDATES")?
                .unwrap_or(defaults.enable_optimistic_updates),
            conflict_strategy: env_parse("SYNC_CONFLICT_STRATEGY")?
                .unwrap_or(defaults.conflict_strategy),
            storage_key: env::var("SYNC_STORAGE_KEY").unwrap_or(defaults.storage_key),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that batch sizes are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dirty_batch_size == 0 {
            return Err(ConfigError::ZeroValue("dirty_batch_size"));
        }
        if self.queue_batch_size == 0 {
            return Err(ConfigError::ZeroValue("queue_batch_size"));
        }
        if self.storage_key.is_empty() {
            return Err(ConfigError::EmptyStorageKey);
        }
        Ok(())
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_batch_sizes(mut self, dirty: usize, queued: usize) -> Self {
        self.dirty_batch_size = dirty;
        self.queue_batch_size = queued;
        self
    }

    pub fn with_max_cache_size(mut self, max_cache_size: usize) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    pub fn with_optimistic_updates(mut self, enabled: bool) -> Self {
        self.enable_optimistic_updates = enabled;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("Storage key must not be empty")]
    EmptyStorageKey,
}
