//! Ingestion configuration.
//!
//! Every setting has a default, so an empty file is a valid configuration.
//!
//! # Example Configuration (TOML)
//!
//! ```toml
//! checkpoint_frequency = 64
//!
//! [checkpoint_reader]
//! max_retries = 3
//! retry_base_delay_ms = 1000
//! preload_batch_size = 20000
//! queue_capacity = 50000
//! verify_bucket_hashes = true
//!
//! [compactor]
//! suppress_remove_after_restore_change = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{CheckpointManager, CHECKPOINT_FREQUENCY};
use crate::{IngestError, Result};

/// Tuning for [`CheckpointChangeReader`](crate::CheckpointChangeReader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointReaderConfig {
    /// Retries after the first attempt of an archive operation.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_base_delay_ms: u64,
    /// Bucket entries read (and preloaded into the dedup set) per batch.
    pub preload_batch_size: usize,
    /// Capacity of the queue between the bucket producer and readers.
    pub queue_capacity: usize,
    /// Check each bucket's content hash once it has been fully read.
    pub verify_bucket_hashes: bool,
}

impl Default for CheckpointReaderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
            preload_batch_size: 20_000,
            queue_capacity: 50_000,
            verify_bucket_hashes: true,
        }
    }
}

impl CheckpointReaderConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Behaviour switches for [`ChangeCompactor`](crate::ChangeCompactor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeCompactorConfig {
    /// Drop a restore followed by a removal of the same entry instead of
    /// reporting the removal.
    pub suppress_remove_after_restore_change: bool,
}

/// Top-level ingestion configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Ledgers per history archive checkpoint.
    pub checkpoint_frequency: u32,
    pub checkpoint_reader: CheckpointReaderConfig,
    pub compactor: ChangeCompactorConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            checkpoint_frequency: CHECKPOINT_FREQUENCY,
            checkpoint_reader: CheckpointReaderConfig::default(),
            compactor: ChangeCompactorConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| IngestError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Checkpoint arithmetic for `checkpoint_frequency`.
    pub fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(self.checkpoint_frequency)
    }

    /// Reject settings the readers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_frequency == 0 {
            return Err(IngestError::Config(
                "checkpoint_frequency must be positive".to_string(),
            ));
        }
        if self.checkpoint_reader.preload_batch_size == 0 {
            return Err(IngestError::Config(
                "checkpoint_reader.preload_batch_size must be positive".to_string(),
            ));
        }
        if self.checkpoint_reader.queue_capacity == 0 {
            return Err(IngestError::Config(
                "checkpoint_reader.queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
