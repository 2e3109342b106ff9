//! Export workers: the single consumer of a processor's circular buffer.
//!
//! Two schedulers share one export loop:
//!
//! ```text
//! loop {
//!     if count < max_export_batch_size { wait(scheduled_delay | trigger | shutdown) }
//!     export one batch of up to max_export_batch_size
//!     notify "exported"
//!     if removed_count >= shutdown_drain_target { break }
//! }
//! ```
//!
//! [`ThreadWorker`] runs it on a dedicated OS thread; [`TaskWorker`] runs it as
//! a task on a tokio runtime. The processor picks one at construction time from
//! [`WorkerKind`](crate::WorkerKind).

mod task;
mod thread;

pub use self::task::TaskWorker;
pub use self::thread::ThreadWorker;

use crate::error::ExportError;
use crate::exporter::Exporter;
use crate::timeout::Deadline;
use ringbatch::{Batch, CircularBuffer};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Upper bound on a single flush wait; the loop re-checks progress after it.
const FLUSH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// No shutdown requested yet.
const NO_DRAIN_TARGET: u64 = u64::MAX;

/// Predicate applied to every item before it reaches the exporter.
pub type ItemFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Scheduler-independent worker interface used by the processor.
pub trait ExportWorker: Send + Sync + fmt::Debug {
    /// Wakes the worker without blocking. Returns false once shutdown began.
    fn trigger_export(&self) -> bool;

    /// Blocks until everything buffered at entry has been exported or the
    /// timeout elapses (`None` waits forever).
    fn wait_for_export(&self, timeout: Option<Duration>) -> bool;

    /// Drains what is buffered now, stops the loop, and waits for it to exit
    /// within `timeout`. Returns whether the worker stopped in time.
    fn shutdown(&self, timeout: Option<Duration>) -> bool;
}

/// Counters kept by the export loop.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    batches_exported: AtomicU64,
    export_failures: AtomicU64,
    export_panics: AtomicU64,
    last_error: Mutex<Option<ExportError>>,
}

impl WorkerMetrics {
    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    /// Export calls that returned an error (panics included).
    pub fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    pub fn export_panics(&self) -> u64 {
        self.export_panics.load(Ordering::Relaxed)
    }

    /// Error from the most recent failed export; a panic shows up as
    /// [`ExportError::Panicked`].
    pub fn last_error(&self) -> Option<ExportError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_failure(&self, error: ExportError) {
        self.export_failures.fetch_add(1, Ordering::Relaxed);
        if matches!(error, ExportError::Panicked(_)) {
            self.export_panics.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

#[derive(Debug, Default)]
struct Progress {
    /// Bumped after every export pass.
    generation: u64,
    stopped: bool,
}

/// State shared between a worker's loop and the threads calling into it.
pub(crate) struct WorkerCore<T> {
    buffer: Arc<CircularBuffer<T>>,
    exporter: Arc<dyn Exporter<T>>,
    filter: Option<ItemFilter<T>>,
    max_export_batch_size: usize,
    scheduled_delay: Duration,
    shutdown_drain_target: AtomicU64,
    progress: Mutex<Progress>,
    exported: Condvar,
    metrics: WorkerMetrics,
}

impl<T: Send + 'static> WorkerCore<T> {
    pub(crate) fn new(
        buffer: Arc<CircularBuffer<T>>,
        exporter: Arc<dyn Exporter<T>>,
        filter: Option<ItemFilter<T>>,
        max_export_batch_size: usize,
        scheduled_delay: Duration,
    ) -> Self {
        Self {
            buffer,
            exporter,
            filter,
            max_export_batch_size,
            scheduled_delay,
            shutdown_drain_target: AtomicU64::new(NO_DRAIN_TARGET),
            progress: Mutex::new(Progress::default()),
            exported: Condvar::new(),
            metrics: WorkerMetrics::default(),
        }
    }

    pub(crate) fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    pub(crate) fn scheduled_delay(&self) -> Duration {
        self.scheduled_delay
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shutdown_drain_target.load(Ordering::Acquire) != NO_DRAIN_TARGET
    }

    /// Fixes the drain target at the current `added_count`. Only the first
    /// call has an effect.
    pub(crate) fn request_shutdown(&self) {
        let target = self.buffer.added_count();
        let _ = self.shutdown_drain_target.compare_exchange(
            NO_DRAIN_TARGET,
            target,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The loop only sleeps while less than one full batch is buffered.
    pub(crate) fn should_wait(&self) -> bool {
        !self.shutdown_requested() && self.buffer.count() < self.max_export_batch_size
    }

    pub(crate) fn drained(&self) -> bool {
        self.buffer.removed_count() >= self.shutdown_drain_target.load(Ordering::Acquire)
    }

    /// One pass of the export loop: export at most one batch, then publish
    /// progress to flush waiters.
    pub(crate) fn export_once(&self) {
        if !self.buffer.is_empty() {
            self.export_batch();
        }
        self.notify_exported();
    }

    fn export_batch(&self) {
        let batch = Batch::drain(&self.buffer, self.max_export_batch_size);
        let len = batch.len();
        let batch = match &self.filter {
            Some(filter) => {
                let filter = Arc::clone(filter);
                batch.with_filter(move |item| filter(item))
            }
            None => batch,
        };

        let exporter = &self.exporter;
        let result = panic::catch_unwind(AssertUnwindSafe(|| exporter.export(batch)))
            .unwrap_or_else(|payload| Err(ExportError::Panicked(panic_message(payload.as_ref()))));
        match result {
            Ok(()) => {
                self.metrics.batches_exported.fetch_add(1, Ordering::Relaxed);
                debug!(items = len, "exported batch");
            }
            Err(e @ ExportError::Panicked(_)) => {
                error!(items = len, error = %e, "continuing with next batch");
                self.metrics.record_failure(e);
            }
            Err(e) => {
                warn!(items = len, error = %e, "batch export failed");
                self.metrics.record_failure(e);
            }
        }
    }

    fn lock_progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_exported(&self) {
        self.lock_progress().generation += 1;
        self.exported.notify_all();
    }

    /// Called by the loop on exit, however it exits.
    pub(crate) fn mark_stopped(&self) {
        self.lock_progress().stopped = true;
        self.exported.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.lock_progress().stopped
    }

    /// Waits until the loop has exited or `deadline` passes.
    pub(crate) fn wait_stopped(&self, deadline: Deadline) -> bool {
        let mut progress = self.lock_progress();
        while !progress.stopped {
            if deadline.is_expired() {
                return false;
            }
            let slice = deadline.slice(FLUSH_POLL_INTERVAL);
            progress = self
                .exported
                .wait_timeout(progress, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Flush protocol shared by both workers. `trigger` wakes the loop.
    pub(crate) fn wait_for_export(
        &self,
        timeout: Option<Duration>,
        trigger: impl Fn() -> bool,
    ) -> bool {
        let head = self.buffer.added_count();
        if self.buffer.removed_count() >= head {
            return true;
        }

        if !trigger() {
            return false;
        }

        if timeout == Some(Duration::ZERO) {
            return false;
        }

        let deadline = Deadline::after(timeout);
        loop {
            {
                let progress = self.lock_progress();
                if self.buffer.removed_count() >= head {
                    return true;
                }
                if progress.stopped || deadline.is_expired() {
                    return false;
                }
                let slice = deadline.slice(FLUSH_POLL_INTERVAL);
                let generation = progress.generation;
                let _wait = self
                    .exported
                    .wait_timeout_while(progress, slice, |p| {
                        p.generation == generation && !p.stopped
                    })
                    .unwrap_or_else(PoisonError::into_inner);
            }

            if self.buffer.removed_count() >= head {
                return true;
            }
            if self.shutdown_requested() {
                return false;
            }
            // The loop exports one batch per wake; keep it moving.
            trigger();
        }
    }
}

impl<T> fmt::Debug for WorkerCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerCore")
            .field("max_export_batch_size", &self.max_export_batch_size)
            .field("scheduled_delay", &self.scheduled_delay)
            .field(
                "shutdown_drain_target",
                &self.shutdown_drain_target.load(Ordering::Relaxed),
            )
            .field("buffered", &self.buffer.count())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
