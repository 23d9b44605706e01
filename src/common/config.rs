use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::DEFAULT_PAGE_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size in bytes, fixed for every tablespace served by the cache
    pub page_size: usize,

    /// Number of frames in the buffer pool
    pub buffer_pool_frames: usize,

    /// Number of background flush threads
    pub flush_threads: usize,

    /// Maximum number of adjacent pages coalesced into one write
    pub flush_run_limit: usize,

    /// Buffered record bytes a transaction may hold before chilling
    pub record_chill_threshold: u64,

    /// Upper bound on any latch or transaction wait, in milliseconds
    pub lock_wait_timeout_ms: u64,

    /// Capacity of the transaction slot table
    pub max_transactions: usize,

    /// How often idle flush threads look for stale dirty pages (0 disables)
    pub purifier_interval_ms: u64,

    /// Age after which a dirty page is considered stale
    pub stale_page_threshold_ms: u64,

    /// In-memory log window size before it is written out
    pub log_buffer_size: usize,

    /// Whether the log is fsync'ed on commit, prepare and checkpoint
    pub force_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_pool_frames: 1024,
            flush_threads: 2,
            flush_run_limit: 32,
            record_chill_threshold: 5 * 1024 * 1024, // 5 MB
            lock_wait_timeout_ms: 50_000,
            max_transactions: 1024,
            purifier_interval_ms: 0,
            stale_page_threshold_ms: 30_000,
            log_buffer_size: 1024 * 1024, // 1 MB
            force_sync: true,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || self.page_size < 1024 {
            return Err(ConfigError::Invalid(format!(
                "page_size must be a power of two >= 1024, got {}",
                self.page_size
            )));
        }
        if self.buffer_pool_frames < 2 {
            return Err(ConfigError::Invalid("buffer_pool_frames must be at least 2".to_string()));
        }
        if self.flush_run_limit == 0 {
            return Err(ConfigError::Invalid("flush_run_limit must be positive".to_string()));
        }
        if self.max_transactions == 0 {
            return Err(ConfigError::Invalid("max_transactions must be positive".to_string()));
        }
        Ok(())
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn purifier_interval(&self) -> Option<Duration> {
        (self.purifier_interval_ms > 0).then(|| Duration::from_millis(self.purifier_interval_ms))
    }

    pub fn stale_page_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_page_threshold_ms)
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.buffer_pool_frames = frames;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads;
        self
    }

    pub fn with_chill_threshold(mut self, bytes: u64) -> Self {
        self.record_chill_threshold = bytes;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions = max;
        self
    }
}
