//! Batch Export Pipeline
//!
//! Takes finished telemetry items from any number of application threads,
//! batches them through a bounded [`ringbatch::CircularBuffer`], and exports
//! them from one background worker through a retrying transmission layer.
//!
//! ```text
//! on_end ─► BatchExportProcessor ─► CircularBuffer ─► worker ─► Exporter
//!                                                                 │
//!                      TransmittingExporter: Serializer ─► TransmissionHandler ─► Transport
//!                                                          (plain | in-memory retry | disk retry)
//! ```
//!
//! # Guarantees
//!
//! - `on_end` never blocks beyond a bounded spin and never panics; items that
//!   do not fit are dropped and counted
//! - Items from one producer thread are exported in the order they were added
//! - Every accepted item is handed to the exporter exactly once
//! - `force_flush` and `shutdown` never wait longer than their timeout
//!
//! # Example
//!
//! ```
//! use batch_export::{BatchConfig, BatchExportProcessor, InMemoryExporter};
//! use std::time::Duration;
//!
//! let exporter = InMemoryExporter::new();
//! let processor = BatchExportProcessor::new(exporter.clone(), BatchConfig::default()).unwrap();
//!
//! for i in 0..10u32 {
//!     processor.on_end(i);
//! }
//! assert!(processor.force_flush(Some(Duration::from_secs(5))));
//! assert_eq!(exporter.exported_count(), 10);
//! assert!(processor.shutdown(Some(Duration::from_secs(5))));
//! ```

pub mod config;
pub mod error;
pub mod exporter;
pub mod processor;
pub mod record;
pub mod serializer;
pub mod storage;
pub mod timeout;
pub mod transmission;
pub mod transmitting;
pub mod transport;
pub mod worker;

pub use config::{
    BatchConfig, BatchConfigBuilder, RetryMode, RetryPolicy, StorageConfig, TransmissionConfig,
    WorkerKind,
};
pub use error::{ConfigError, ExportError, StorageError};
pub use exporter::{ExportResult, Exporter, InMemoryExporter, NullExporter};
pub use processor::{BatchExportProcessor, BatchExportProcessorBuilder};
pub use record::{AttributeValue, Scope, SignalKind, TelemetryRecord};
pub use serializer::{JsonSerializer, ScopedRecord, SerializeStats, Serializer};
pub use storage::{LeasedBlob, MaintenanceReport, PersistentStorage};
pub use timeout::Deadline;
pub use transmission::{
    build_handler, InMemoryRetryTransmission, PersistentTransmission, PlainTransmission,
    RetrySchedule, SweepReport, TransmissionHandler, TransmissionMetrics,
};
pub use transmitting::TransmittingExporter;
pub use transport::{parse_retry_after, FnTransport, GrpcCode, SendOutcome, Transport};
pub use worker::{ExportWorker, ItemFilter, TaskWorker, ThreadWorker, WorkerMetrics};
