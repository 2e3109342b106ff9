use super::{ExportWorker, WorkerCore};
use crate::error::ConfigError;
use crate::timeout::Deadline;
use crossbeam_utils::sync::{Parker, Unparker};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const THREAD_NAME: &str = "batch-export-worker";

/// Export loop on a dedicated OS thread.
///
/// The trigger is a `Parker` token: any number of `trigger_export` calls
/// between two waits collapse into a single wake-up.
pub struct ThreadWorker<T> {
    core: Arc<WorkerCore<T>>,
    unparker: Unparker,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ThreadWorker<T> {
    pub(crate) fn spawn(core: Arc<WorkerCore<T>>) -> Result<Self, ConfigError> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        let loop_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(&loop_core, &parker))
            .map_err(ConfigError::WorkerSpawn)?;

        Ok(Self {
            core,
            unparker,
            handle: Mutex::new(Some(handle)),
        })
    }
}

fn run<T: Send + 'static>(core: &WorkerCore<T>, parker: &Parker) {
    debug!(thread = THREAD_NAME, "export worker started");
    loop {
        if core.should_wait() {
            parker.park_timeout(core.scheduled_delay());
        }

        core.export_once();

        if core.drained() {
            break;
        }
    }
    core.mark_stopped();
    debug!(thread = THREAD_NAME, "export worker stopped");
}

impl<T: Send + 'static> ExportWorker for ThreadWorker<T> {
    fn trigger_export(&self) -> bool {
        if self.core.shutdown_requested() {
            return false;
        }
        self.unparker.unpark();
        true
    }

    fn wait_for_export(&self, timeout: Option<Duration>) -> bool {
        self.core.wait_for_export(timeout, || self.trigger_export())
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        self.core.request_shutdown();
        self.unparker.unpark();

        if !self.core.wait_stopped(deadline) {
            warn!(?timeout, "export worker did not stop within the shutdown timeout");
            return false;
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // The loop has already marked itself stopped, so this only reaps
            // the thread.
            if handle.join().is_err() {
                warn!("export worker thread panicked");
            }
        }
        true
    }
}

impl<T> fmt::Debug for ThreadWorker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorker")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}
