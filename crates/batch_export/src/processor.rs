//! Batch Export Processor
//!
//! Accepts finished telemetry items from any number of application threads
//! and exports them in batches from a single background worker.
//!
//! ```text
//! on_end(item) ──try_add──► CircularBuffer ──Batch::drain──► worker ──► Exporter::export
//!      │                         (bounded)                     ▲
//!      └── count >= max_export_batch_size ── trigger_export ───┘
//! ```
//!
//! The producer path never blocks beyond a bounded spin and never fails
//! loudly: a full buffer drops the new item and counts it. The first drop
//! emits one warning; the total is reported again at shutdown.

use crate::config::{BatchConfig, WorkerKind};
use crate::error::ConfigError;
use crate::exporter::Exporter;
use crate::timeout::Deadline;
use crate::worker::{ExportWorker, ItemFilter, TaskWorker, ThreadWorker, WorkerCore, WorkerMetrics};
use crossbeam_utils::Backoff;
use ringbatch::CircularBuffer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Spin budget for one `try_add` on the producer path.
pub const MAX_SPIN_COUNT: usize = 50_000;

/// Batches telemetry items and exports them from a background worker.
pub struct BatchExportProcessor<T: Send + 'static> {
    buffer: Arc<CircularBuffer<T>>,
    core: Arc<WorkerCore<T>>,
    worker: Box<dyn ExportWorker>,
    exporter: Arc<dyn Exporter<T>>,
    config: BatchConfig,
    /// Items `try_add` rejected, or that arrived after shutdown.
    rejected_count: AtomicU64,
    /// Items buffered but left behind by a worker that stopped at its drain
    /// target; discarded at shutdown.
    discarded_count: AtomicU64,
    /// Producers between their shutdown check and the end of `try_add`.
    active_producers: AtomicUsize,
    is_shutdown: AtomicBool,
    shutdown_result: OnceLock<bool>,
}

impl<T: Send + 'static> BatchExportProcessor<T> {
    /// Creates a processor with a started worker.
    ///
    /// [`WorkerKind::Task`] runs on the ambient tokio runtime; use the
    /// [`builder`](Self::builder) to pass a runtime handle explicitly.
    pub fn new<E>(exporter: E, config: BatchConfig) -> Result<Self, ConfigError>
    where
        E: Exporter<T> + 'static,
    {
        Self::builder(exporter).with_batch_config(config).build()
    }

    pub fn builder<E>(exporter: E) -> BatchExportProcessorBuilder<T>
    where
        E: Exporter<T> + 'static,
    {
        BatchExportProcessorBuilder {
            exporter: Arc::new(exporter),
            config: BatchConfig::default(),
            filter: None,
            runtime: None,
        }
    }

    /// Hands a finished item to the processor.
    ///
    /// Never blocks beyond the bounded spin in `try_add` and never panics.
    /// Items that cannot be buffered, or that arrive after shutdown, are
    /// counted in [`dropped_count`](Self::dropped_count).
    pub fn on_end(&self, item: T) {
        // Pairs with the SeqCst store in `shutdown_once`: either this load
        // sees the flag, or shutdown sees this producer as active and waits
        // for its `try_add` before fixing the drain target.
        self.active_producers.fetch_add(1, Ordering::SeqCst);
        if self.is_shutdown.load(Ordering::SeqCst) {
            self.active_producers.fetch_sub(1, Ordering::Release);
            self.record_drop();
            return;
        }

        let added = self.buffer.try_add(item, MAX_SPIN_COUNT);
        self.active_producers.fetch_sub(1, Ordering::Release);

        match added {
            Ok(()) => {
                if self.buffer.count() >= self.config.max_export_batch_size {
                    self.worker.trigger_export();
                }
            }
            Err(_rejected) => self.record_drop(),
        }
    }

    fn record_drop(&self) {
        // Only the first drop is logged; the total is reported at shutdown.
        if self.rejected_count.fetch_add(1, Ordering::Relaxed) == 0 {
            warn!(
                max_queue_size = self.config.max_queue_size,
                "batch export processor dropped an item because the buffer is full or shut down; \
                 further drops are only counted"
            );
        }
    }

    /// Blocks until every item buffered at the time of the call has been
    /// exported, or `timeout` elapses. `None` waits forever.
    pub fn force_flush(&self, timeout: Option<Duration>) -> bool {
        self.worker.wait_for_export(timeout)
    }

    /// Stops the worker after a best-effort drain, then shuts the exporter
    /// down with whatever budget is left.
    ///
    /// The first caller performs the shutdown; concurrent and later callers
    /// block until it finishes and get the same result.
    pub fn shutdown(&self, timeout: Option<Duration>) -> bool {
        *self.shutdown_result.get_or_init(|| self.shutdown_once(timeout))
    }

    fn shutdown_once(&self, timeout: Option<Duration>) -> bool {
        self.is_shutdown.store(true, Ordering::SeqCst);
        let deadline = Deadline::after(timeout);

        if !self.wait_for_producers(deadline) {
            debug!("shutdown deadline passed while producers were still adding items");
        }
        let worker_stopped = self.worker.shutdown(deadline.remaining());
        if worker_stopped {
            self.discard_stranded();
        }
        let exporter_stopped = self.exporter.shutdown(deadline.remaining());

        let dropped = self.dropped_count();
        if dropped > 0 {
            warn!(dropped, "batch export processor shut down after dropping items");
        }
        debug!(
            received = self.received_count(),
            processed = self.processed_count(),
            worker_stopped,
            exporter_stopped,
            "batch export processor shut down"
        );

        worker_stopped && exporter_stopped
    }

    /// Waits for producers that passed the shutdown check before the flag was
    /// set. They only spin inside `try_add`, so this is short.
    fn wait_for_producers(&self, deadline: Deadline) -> bool {
        let backoff = Backoff::new();
        while self.active_producers.load(Ordering::SeqCst) != 0 {
            if deadline.is_expired() {
                return false;
            }
            backoff.snooze();
        }
        true
    }

    /// Counts and drops items the stopped worker left above its drain target.
    /// Only called once the worker loop has exited, so this is the sole
    /// consumer.
    fn discard_stranded(&self) {
        let mut discarded = 0u64;
        while let Some(item) = self.buffer.read() {
            drop(item);
            discarded += 1;
        }
        if discarded > 0 {
            self.discarded_count.fetch_add(discarded, Ordering::Relaxed);
            warn!(discarded, "discarded items buffered after the shutdown drain target");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Items that were never handed to the exporter: rejected by a full
    /// buffer, offered after shutdown, or discarded at shutdown.
    pub fn dropped_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed) + self.discarded_count.load(Ordering::Relaxed)
    }

    /// Items offered through `on_end`, buffered or dropped.
    pub fn received_count(&self) -> u64 {
        self.buffer.added_count() + self.rejected_count.load(Ordering::Relaxed)
    }

    /// Items taken out of the buffer by the worker.
    pub fn processed_count(&self) -> u64 {
        self.buffer.removed_count() - self.discarded_count.load(Ordering::Relaxed)
    }

    /// Items currently waiting for export.
    pub fn queued_count(&self) -> usize {
        self.buffer.count()
    }

    pub fn worker_metrics(&self) -> &WorkerMetrics {
        self.core.metrics()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl<T: Send + 'static> Drop for BatchExportProcessor<T> {
    fn drop(&mut self) {
        if self.shutdown_result.get().is_none() {
            self.shutdown(Some(self.config.exporter_timeout));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for BatchExportProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExportProcessor")
            .field("config", &self.config)
            .field("worker", &self.worker)
            .field("dropped_count", &self.dropped_count())
            .field("is_shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Builder for [`BatchExportProcessor`].
pub struct BatchExportProcessorBuilder<T> {
    exporter: Arc<dyn Exporter<T>>,
    config: BatchConfig,
    filter: Option<ItemFilter<T>>,
    runtime: Option<Handle>,
}

impl<T: Send + 'static> BatchExportProcessorBuilder<T> {
    pub fn with_batch_config(self, config: BatchConfig) -> Self {
        Self { config, ..self }
    }

    /// Skips items for which `keep` returns false. Skipped items still count
    /// as processed.
    pub fn with_filter<F>(mut self, keep: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(keep));
        self
    }

    /// Runtime for [`WorkerKind::Task`]. It needs the time driver enabled.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<BatchExportProcessor<T>, ConfigError> {
        self.config.validate()?;

        let buffer = Arc::new(
            CircularBuffer::new(self.config.max_queue_size)
                .map_err(|_| ConfigError::InvalidQueueSize)?,
        );
        let core = Arc::new(WorkerCore::new(
            Arc::clone(&buffer),
            Arc::clone(&self.exporter),
            self.filter,
            self.config.max_export_batch_size,
            self.config.scheduled_delay,
        ));

        let worker: Box<dyn ExportWorker> = match self.config.worker {
            WorkerKind::Thread => Box::new(ThreadWorker::spawn(Arc::clone(&core))?),
            WorkerKind::Task => {
                let runtime = match self.runtime {
                    Some(runtime) => runtime,
                    None => Handle::try_current().map_err(|_| ConfigError::MissingRuntime)?,
                };
                Box::new(TaskWorker::spawn(Arc::clone(&core), &runtime))
            }
        };

        debug!(
            max_queue_size = self.config.max_queue_size,
            max_export_batch_size = self.config.max_export_batch_size,
            worker = ?self.config.worker,
            "batch export processor started"
        );

        Ok(BatchExportProcessor {
            buffer,
            core,
            worker,
            exporter: self.exporter,
            config: self.config,
            rejected_count: AtomicU64::new(0),
            discarded_count: AtomicU64::new(0),
            active_producers: AtomicUsize::new(0),
            is_shutdown: AtomicBool::new(false),
            shutdown_result: OnceLock::new(),
        })
    }
}

impl<T> fmt::Debug for BatchExportProcessorBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchExportProcessorBuilder")
            .field("config", &self.config)
            .field("filtered", &self.filter.is_some())
            .field("runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}
