use super::{log_failure, Gate, TransmissionHandler, TransmissionMetrics};
use crate::config::StorageConfig;
use crate::error::ConfigError;
use crate::storage::PersistentStorage;
use crate::timeout::Deadline;
use crate::transport::Transport;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const SWEEP_THREAD_NAME: &str = "batch-export-retry-sweep";

/// Outcome of one resend sweep over stored blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Accepted by the transport and deleted.
    pub sent: usize,
    /// Rejected as non-retryable and deleted.
    pub discarded: usize,
    /// Still failing with a retryable outcome; left for the next sweep.
    pub kept: usize,
}

#[derive(Debug, Default)]
struct SweepState {
    stopping: bool,
    finished: bool,
}

struct Shared {
    transport: Arc<dyn Transport>,
    storage: PersistentStorage,
    export_timeout: Duration,
    lease_period: Duration,
    retry_interval: Duration,
    gate: Gate,
    metrics: TransmissionMetrics,
    sweep: Mutex<SweepState>,
    sweep_changed: Condvar,
}

/// One attempt per payload; retryable failures are spooled to disk and
/// resent by a background sweep every `retry_interval`.
pub struct PersistentTransmission {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PersistentTransmission {
    /// Opens the storage directory and starts the sweep thread.
    pub fn new(
        transport: Arc<dyn Transport>,
        export_timeout: Duration,
        storage: &StorageConfig,
    ) -> Result<Self, ConfigError> {
        storage.validate()?;
        let shared = Arc::new(Shared {
            transport,
            storage: PersistentStorage::open(storage)?,
            export_timeout,
            lease_period: storage.lease_period,
            retry_interval: storage.retry_interval,
            gate: Gate::default(),
            metrics: TransmissionMetrics::default(),
            sweep: Mutex::new(SweepState::default()),
            sweep_changed: Condvar::new(),
        });

        let sweep_shared = Arc::clone(&shared);
        let sweeper = thread::Builder::new()
            .name(SWEEP_THREAD_NAME.to_string())
            .spawn(move || sweep_shared.run_sweeper())
            .map_err(ConfigError::WorkerSpawn)?;

        Ok(Self {
            shared,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Runs one resend sweep on the calling thread.
    pub fn retry_stored_requests(&self) -> SweepReport {
        self.shared.sweep_once()
    }

    pub fn storage(&self) -> &PersistentStorage {
        &self.shared.storage
    }

    fn stop_sweeper(&self, deadline: Deadline) -> bool {
        let mut state = self.shared.lock_sweep();
        state.stopping = true;
        self.shared.sweep_changed.notify_all();

        while !state.finished {
            let remaining = deadline.remaining();
            if remaining.is_some_and(|r| r.is_zero()) {
                warn!(
                    thread = SWEEP_THREAD_NAME,
                    "retry sweep did not stop within the shutdown timeout"
                );
                return false;
            }
            state = match remaining {
                None => self
                    .shared
                    .sweep_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(r) => {
                    self.shared
                        .sweep_changed
                        .wait_timeout(state, r)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        drop(state);

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(thread = SWEEP_THREAD_NAME, "retry sweep thread panicked");
            }
        }
        true
    }
}

impl Shared {
    fn lock_sweep(&self) -> MutexGuard<'_, SweepState> {
        self.sweep.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_sweeper(&self) {
        debug!(thread = SWEEP_THREAD_NAME, dir = %self.storage.path().display(), "retry sweep started");
        loop {
            {
                let state = self.lock_sweep();
                let (state, _) = self
                    .sweep_changed
                    .wait_timeout_while(state, self.retry_interval, |s| !s.stopping)
                    .unwrap_or_else(PoisonError::into_inner);
                if state.stopping {
                    break;
                }
            }
            self.sweep_once();
        }
        self.lock_sweep().finished = true;
        self.sweep_changed.notify_all();
        debug!(thread = SWEEP_THREAD_NAME, "retry sweep stopped");
    }

    fn is_stopping(&self) -> bool {
        self.lock_sweep().stopping
    }

    fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let blobs = match self.storage.blobs() {
            Ok(blobs) => blobs,
            Err(e) => {
                warn!(error = %e, "failed to list stored payloads");
                return report;
            }
        };

        for blob in blobs {
            if self.is_stopping() {
                break;
            }
            let Some(leased) = self.storage.lease(&blob, self.lease_period) else {
                continue;
            };
            let payload = match leased.read() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(blob = %leased.path().display(), error = %e, "failed to read stored payload");
                    continue;
                }
            };

            self.metrics.record_retried();
            let outcome = self
                .transport
                .send(&payload, Deadline::after(Some(self.export_timeout)));

            let settled = if outcome.is_success() {
                self.metrics.record_succeeded();
                report.sent += 1;
                leased.delete()
            } else if outcome.is_retryable() {
                report.kept += 1;
                leased.release()
            } else {
                self.metrics.record_failed();
                log_failure(&outcome, payload.len());
                report.discarded += 1;
                leased.delete()
            };
            if let Err(e) = settled {
                warn!(blob = %blob.display(), error = %e, "failed to settle stored payload");
            }
        }

        if report != SweepReport::default() {
            debug!(
                sent = report.sent,
                discarded = report.discarded,
                kept = report.kept,
                "retry sweep finished"
            );
        }
        report
    }
}

impl TransmissionHandler for PersistentTransmission {
    fn try_submit_request(&self, payload: &[u8]) -> bool {
        let shared = &self.shared;
        shared.metrics.record_submitted();
        let Some(_inflight) = shared.gate.enter() else {
            shared.metrics.record_failed();
            debug!("transmission handler is shut down; payload rejected");
            return false;
        };

        let outcome = shared
            .transport
            .send(payload, Deadline::after(Some(shared.export_timeout)));
        if outcome.is_success() {
            shared.metrics.record_succeeded();
            return true;
        }
        if !outcome.is_retryable() {
            shared.metrics.record_failed();
            log_failure(&outcome, payload.len());
            return false;
        }

        match shared.storage.write(payload) {
            Ok(blob) => {
                shared.metrics.record_persisted();
                debug!(blob = %blob.display(), bytes = payload.len(), "payload stored for retry");
                true
            }
            Err(e) => {
                shared.metrics.record_failed();
                warn!(error = %e, bytes = payload.len(), "failed to store payload for retry");
                false
            }
        }
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let deadline = Deadline::after(timeout);
        self.shared.gate.close();
        let idle = self.shared.gate.wait_idle(deadline);
        let stopped = self.stop_sweeper(deadline);
        idle && stopped
    }

    fn metrics(&self) -> &TransmissionMetrics {
        &self.shared.metrics
    }
}

impl Drop for PersistentTransmission {
    fn drop(&mut self) {
        self.shared.lock_sweep().stopping = true;
        self.shared.sweep_changed.notify_all();
    }
}

impl fmt::Debug for PersistentTransmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentTransmission")
            .field("storage", &self.shared.storage)
            .field("export_timeout", &self.shared.export_timeout)
            .field("metrics", &self.shared.metrics)
            .finish_non_exhaustive()
    }
}
