//! Configuration for the batch processor and the transmission layer.
//!
//! Plain structs with defaults, builder methods and a `validate()` step.
//! Nothing here reads environment variables; embedders deserialize these with
//! serde or build them in code.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum number of buffered items.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2048;
/// Default idle interval between opportunistic exports.
pub const DEFAULT_SCHEDULED_DELAY: Duration = Duration::from_millis(5000);
/// Default budget for one export or shutdown.
pub const DEFAULT_EXPORTER_TIMEOUT: Duration = Duration::from_millis(30000);
/// Default maximum items handed to the exporter per call.
pub const DEFAULT_MAX_EXPORT_BATCH_SIZE: usize = 512;

// =============================================================================
// BATCH PROCESSOR
// =============================================================================

/// How the export loop is scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Dedicated OS thread.
    #[default]
    Thread,
    /// Task on a tokio runtime, for hosts where dedicated threads are unwanted.
    Task,
}

/// Batch processor configuration.
///
/// Use [`BatchConfig::builder`] to get a validated instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum items buffered for delayed export. Items arriving while the
    /// buffer is full are dropped. Default 2048.
    pub max_queue_size: usize,
    /// Delay between two consecutive exports when the buffer stays below
    /// `max_export_batch_size`. Default 5 seconds.
    pub scheduled_delay: Duration,
    /// Budget for the exporter during shutdown. Default 30 seconds.
    pub exporter_timeout: Duration,
    /// Maximum items per export call. When more are buffered the worker
    /// exports batch after batch without waiting. Default 512.
    pub max_export_batch_size: usize,
    /// Export loop scheduling. Default [`WorkerKind::Thread`].
    pub worker: WorkerKind,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            scheduled_delay: DEFAULT_SCHEDULED_DELAY,
            exporter_timeout: DEFAULT_EXPORTER_TIMEOUT,
            max_export_batch_size: DEFAULT_MAX_EXPORT_BATCH_SIZE,
            worker: WorkerKind::Thread,
        }
    }
}

impl BatchConfig {
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    /// Checks `1 <= max_export_batch_size <= max_queue_size` and
    /// `scheduled_delay >= 1ms`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        if self.max_export_batch_size == 0 || self.max_export_batch_size > self.max_queue_size {
            return Err(ConfigError::InvalidBatchSize {
                batch_size: self.max_export_batch_size,
                queue_size: self.max_queue_size,
            });
        }
        if self.scheduled_delay < Duration::from_millis(1) {
            return Err(ConfigError::InvalidScheduledDelay(self.scheduled_delay));
        }
        Ok(())
    }
}

/// A builder for [`BatchConfig`] instances.
#[derive(Debug, Default)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
}

impl BatchConfigBuilder {
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.config.max_queue_size = max_queue_size;
        self
    }

    pub fn with_scheduled_delay(mut self, scheduled_delay: Duration) -> Self {
        self.config.scheduled_delay = scheduled_delay;
        self
    }

    pub fn with_exporter_timeout(mut self, exporter_timeout: Duration) -> Self {
        self.config.exporter_timeout = exporter_timeout;
        self
    }

    pub fn with_max_export_batch_size(mut self, max_export_batch_size: usize) -> Self {
        self.config.max_export_batch_size = max_export_batch_size;
        self
    }

    pub fn with_worker(mut self, worker: WorkerKind) -> Self {
        self.config.worker = worker;
        self
    }

    /// Builds the config, rejecting values that break the size and delay
    /// invariants.
    pub fn build(self) -> Result<BatchConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// TRANSMISSION
// =============================================================================

/// What the transmission layer does with a failed send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    /// Single attempt; failures are reported immediately.
    #[default]
    None,
    /// Retry with jittered exponential backoff until the export timeout.
    InMemory,
    /// Spool retryable failures to disk and resend them from a background sweep.
    Disk,
}

/// Backoff parameters for in-memory retry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound of the first jittered delay.
    pub initial_backoff: Duration,
    /// Cap on the backoff upper bound.
    pub max_backoff: Duration,
    /// Growth factor applied after every retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(5000),
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "multiplier {} must be a finite number >= 1.0",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// On-disk spool settings for [`RetryMode::Disk`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one blob file per failed request.
    pub path: PathBuf,
    /// Writes that would grow the directory past this size are refused.
    pub max_size_bytes: u64,
    /// Minimum interval between automatic maintenance passes.
    pub maintenance_period: Duration,
    /// Blobs older than this are deleted without being resent.
    pub retention_period: Duration,
    /// Temp files older than this are treated as abandoned writes.
    pub write_timeout: Duration,
    /// How long a sweep holds a blob before another sweep may take it.
    pub lease_period: Duration,
    /// Interval between background resend sweeps.
    pub retry_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("batch_export"),
            max_size_bytes: 50 * 1024 * 1024,
            maintenance_period: Duration::from_secs(60),
            retention_period: Duration::from_secs(48 * 60 * 60),
            write_timeout: Duration::from_secs(60),
            lease_period: Duration::from_secs(60),
            retry_interval: Duration::from_secs(60),
        }
    }
}

impl StorageConfig {
    /// Settings for `path` with every other field at its default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("storage path is empty".into()));
        }
        if self.max_size_bytes == 0 {
            return Err(ConfigError::InvalidStorage(
                "max_size_bytes must be greater than zero".into(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::InvalidStorage(
                "retry_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Transmission layer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionConfig {
    /// Wall-clock budget for one submission, measured from the first attempt.
    pub export_timeout: Duration,
    pub retry: RetryMode,
    pub retry_policy: RetryPolicy,
    pub storage: StorageConfig,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            export_timeout: Duration::from_secs(10),
            retry: RetryMode::None,
            retry_policy: RetryPolicy::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl TransmissionConfig {
    pub fn with_retry(mut self, retry: RetryMode) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_export_timeout(mut self, export_timeout: Duration) -> Self {
        self.export_timeout = export_timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.retry {
            RetryMode::None => Ok(()),
            RetryMode::InMemory => self.retry_policy.validate(),
            RetryMode::Disk => self.storage.validate(),
        }
    }
}
