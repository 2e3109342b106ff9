//! Transmission handlers: what happens to a serialized payload after export.
//!
//! | Handler | On retryable failure |
//! |---------|----------------------|
//! | [`PlainTransmission`] | reported as failed |
//! | [`InMemoryRetryTransmission`] | resent with jittered backoff until the export timeout |
//! | [`PersistentTransmission`] | written to disk and resent by a background sweep |
//!
//! Every submitted payload ends in exactly one of three places: accepted by
//! the transport, persisted for a later sweep, or counted as failed.

mod persistent;
mod retry;

pub use self::persistent::{PersistentTransmission, SweepReport};
pub use self::retry::{InMemoryRetryTransmission, RetrySchedule};

use crate::config::{RetryMode, TransmissionConfig};
use crate::error::ConfigError;
use crate::timeout::Deadline;
use crate::transport::{SendOutcome, Transport};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry and durability layer around [`Transport::send`].
pub trait TransmissionHandler: Send + Sync {
    /// Submits one payload. Returns true if it was accepted by the transport
    /// or persisted for a later attempt.
    fn try_submit_request(&self, payload: &[u8]) -> bool;

    /// Stops accepting submissions and waits for in-flight ones (and any
    /// background work) within `timeout`. `None` waits forever.
    fn shutdown(&self, timeout: Option<Duration>) -> bool;

    fn metrics(&self) -> &TransmissionMetrics;
}

impl<H: TransmissionHandler + ?Sized> TransmissionHandler for Arc<H> {
    fn try_submit_request(&self, payload: &[u8]) -> bool {
        (**self).try_submit_request(payload)
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        (**self).shutdown(timeout)
    }

    fn metrics(&self) -> &TransmissionMetrics {
        (**self).metrics()
    }
}

/// Builds the handler selected by `config.retry`.
pub fn build_handler(
    transport: Arc<dyn Transport>,
    config: &TransmissionConfig,
) -> Result<Arc<dyn TransmissionHandler>, ConfigError> {
    config.validate()?;
    let handler: Arc<dyn TransmissionHandler> = match config.retry {
        RetryMode::None => Arc::new(PlainTransmission::new(transport, config.export_timeout)),
        RetryMode::InMemory => Arc::new(InMemoryRetryTransmission::new(
            transport,
            config.export_timeout,
            config.retry_policy,
        )),
        RetryMode::Disk => Arc::new(PersistentTransmission::new(
            transport,
            config.export_timeout,
            &config.storage,
        )?),
    };
    Ok(handler)
}

/// Transmission counters.
#[derive(Debug, Default)]
pub struct TransmissionMetrics {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
}

impl TransmissionMetrics {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Payloads accepted by the transport, including ones resent from disk.
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Send attempts after the first.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    inflight: usize,
}

/// Admission control shared by every handler: counts in-flight submissions
/// and lets shutdown close the door and wait for them.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an in-flight submission, or `None` once closed.
    pub(crate) fn enter(&self) -> Option<InFlight<'_>> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.inflight += 1;
        Some(InFlight { gate: self })
    }

    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Sleeps for `delay` unless the gate closes first. Returns false if it
    /// closed.
    pub(crate) fn pause(&self, delay: Duration) -> bool {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, delay, |s| !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        !state.closed
    }

    /// Waits until no submission is in flight or `deadline` passes.
    pub(crate) fn wait_idle(&self, deadline: Deadline) -> bool {
        let mut state = self.lock();
        while state.inflight > 0 {
            let Some(remaining) = deadline.remaining() else {
                state = self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            if remaining.is_zero() {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// RAII marker for one in-flight submission.
pub(crate) struct InFlight<'a> {
    gate: &'a Gate,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gate.lock().inflight -= 1;
        self.gate.changed.notify_all();
    }
}

/// One attempt per payload.
pub struct PlainTransmission {
    transport: Arc<dyn Transport>,
    export_timeout: Duration,
    gate: Gate,
    metrics: TransmissionMetrics,
}

impl PlainTransmission {
    pub fn new(transport: Arc<dyn Transport>, export_timeout: Duration) -> Self {
        Self {
            transport,
            export_timeout,
            gate: Gate::default(),
            metrics: TransmissionMetrics::default(),
        }
    }
}

impl TransmissionHandler for PlainTransmission {
    fn try_submit_request(&self, payload: &[u8]) -> bool {
        self.metrics.record_submitted();
        let Some(_inflight) = self.gate.enter() else {
            self.metrics.record_failed();
            debug!("transmission handler is shut down; payload rejected");
            return false;
        };

        let outcome = self
            .transport
            .send(payload, Deadline::after(Some(self.export_timeout)));
        if outcome.is_success() {
            self.metrics.record_succeeded();
            true
        } else {
            self.metrics.record_failed();
            log_failure(&outcome, payload.len());
            false
        }
    }

    fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.gate.close();
        self.gate.wait_idle(Deadline::after(timeout))
    }

    fn metrics(&self) -> &TransmissionMetrics {
        &self.metrics
    }
}

impl fmt::Debug for PlainTransmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTransmission")
            .field("export_timeout", &self.export_timeout)
            .field("gate", &self.gate)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

pub(crate) fn log_failure(outcome: &SendOutcome, bytes: usize) {
    warn!(
        bytes,
        retryable = outcome.is_retryable(),
        retry_after = ?outcome.retry_after(),
        "payload transmission failed"
    );
}
