use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while constructing a processor or transmission handler.
///
/// These surface at construction time only; nothing on the producer path
/// returns a `ConfigError`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `max_queue_size` must hold at least one item
    #[error("max_queue_size must be greater than zero")]
    InvalidQueueSize,
    /// `max_export_batch_size` must be in `1..=max_queue_size`
    #[error("max_export_batch_size {batch_size} must be between 1 and max_queue_size {queue_size}")]
    InvalidBatchSize { batch_size: usize, queue_size: usize },
    /// `scheduled_delay` must be at least one millisecond
    #[error("scheduled_delay {0:?} must be at least 1ms")]
    InvalidScheduledDelay(Duration),
    /// Backoff parameters cannot produce a sane schedule
    #[error("invalid retry policy: {0}")]
    InvalidRetryPolicy(String),
    /// A storage setting is unusable
    #[error("invalid storage configuration: {0}")]
    InvalidStorage(String),
    /// The task worker was selected without a tokio runtime to run on
    #[error("task worker requires a tokio runtime handle")]
    MissingRuntime,
    /// The export thread could not be spawned
    #[error("failed to spawn export worker: {0}")]
    WorkerSpawn(#[source] io::Error),
    /// The storage directory could not be opened
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Error types for batch export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// A batch could not be serialized at all
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The transmission layer rejected or failed the payload
    #[error("transmission failed: {0}")]
    Transmission(String),
    /// The exporter has already been shut down
    #[error("exporter is shut down")]
    Shutdown,
    /// The exporter panicked while handling a batch
    #[error("exporter panicked: {0}")]
    Panicked(String),
}

/// Errors from the on-disk blob store used by the disk retry handler.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
    /// Writing would push the directory past its size limit
    #[error("storage directory {path} is full ({size} of {limit} bytes used)")]
    Full { path: PathBuf, size: u64, limit: u64 },
}
