use crate::error::ExportError;
use ringbatch::Batch;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Outcome of one export call.
pub type ExportResult = Result<(), ExportError>;

/// Sink that turns a batch of telemetry into bytes and transmits them.
///
/// The worker calls `export` synchronously from its own thread (or task) and
/// never concurrently with itself. A panic inside `export` is caught by the
/// worker and treated as a failed export.
pub trait Exporter<T>: Send + Sync {
    /// Exports one batch. The batch is consumed; dropping it releases any
    /// items the exporter chose not to read.
    fn export(&self, batch: Batch<'_, T>) -> ExportResult;

    /// Releases exporter resources within `timeout` (`None` waits forever).
    fn shutdown(&self, _timeout: Option<Duration>) -> bool {
        true
    }

    /// Flushes anything the exporter buffers internally.
    fn force_flush(&self, _timeout: Option<Duration>) -> bool {
        true
    }
}

impl<T, E: Exporter<T> + ?Sized> Exporter<T> for Arc<E> {
    fn export(&self, batch: Batch<'_, T>) -> ExportResult {
        (**self).export(batch)
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        (**self).shutdown(timeout)
    }

    fn force_flush(&self, timeout: Option<Duration>) -> bool {
        (**self).force_flush(timeout)
    }
}

/// Null exporter that discards all items (for benchmarking)
#[derive(Debug, Default)]
pub struct NullExporter {
    exported: AtomicU64,
}

impl NullExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items consumed and discarded so far.
    pub fn exported_count(&self) -> u64 {
        self.exported.load(Ordering::Relaxed)
    }
}

impl<T> Exporter<T> for NullExporter {
    fn export(&self, batch: Batch<'_, T>) -> ExportResult {
        let n = batch.into_iter().count();
        self.exported.fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Exporter that keeps every exported item in memory for inspection.
///
/// Cloning shares the underlying storage, so a test can hand one clone to a
/// processor and assert on the other.
#[derive(Debug)]
pub struct InMemoryExporter<T> {
    items: Arc<Mutex<Vec<T>>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
    shutdown_called: Arc<AtomicBool>,
}

impl<T> Clone for InMemoryExporter<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            batch_sizes: Arc::clone(&self.batch_sizes),
            shutdown_called: Arc::clone(&self.shutdown_called),
        }
    }
}

impl<T> Default for InMemoryExporter<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            batch_sizes: Arc::new(Mutex::new(Vec::new())),
            shutdown_called: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T: Clone> InMemoryExporter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// All items exported so far, in export order.
    pub fn exported_items(&self) -> Vec<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> InMemoryExporter<T> {
    pub fn exported_count(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of items each export call received, including filtered ones.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_called.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<T: Send> Exporter<T> for InMemoryExporter<T> {
    fn export(&self, batch: Batch<'_, T>) -> ExportResult {
        if self.is_shutdown() {
            return Err(ExportError::Shutdown);
        }
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch.len());
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(batch);
        Ok(())
    }

    fn shutdown(&self, _timeout: Option<Duration>) -> bool {
        self.shutdown_called.store(true, Ordering::Release);
        true
    }
}
