use super::{log_failure, Gate, TransmissionHandler, TransmissionMetrics};
use crate::config::RetryPolicy;
use crate::timeout::Deadline;
use crate::transport::Transport;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Jittered exponential backoff.
///
/// Each delay is either the server's throttle delay or a uniform draw from
/// `[0, next_backoff)`. After every retry `next_backoff` grows by the
/// multiplier up to `max_backoff`; a throttle delay replaces it as the base
/// of that growth.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    next_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
}

impl RetrySchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            next_backoff: policy.initial_backoff,
            max_backoff: policy.max_backoff,
            multiplier: policy.multiplier,
        }
    }

    /// Upper bound of the next jittered delay.
    pub fn next_backoff(&self) -> Duration {
        self.next_backoff
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self, throttle: Option<Duration>) -> Duration {
        let delay = throttle.unwrap_or_else(|| jitter(self.next_backoff));
        let base = throttle.unwrap_or(self.next_backoff);
        self.next_backoff = Duration::try_from_secs_f64(base.as_secs_f64() * self.multiplier)
            .map_or(self.max_backoff, |grown| grown.min(self.max_backoff));
        delay
    }
}

fn jitter(upper: Duration) -> Duration {
    let upper = u64::try_from(upper.as_nanos()).unwrap_or(u64::MAX);
    if upper == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..upper))
}

/// Resends retryable failures in place until the export timeout, measured
/// from the first attempt, would pass.
pub struct InMemoryRetryTransmission {
    transport: Arc<dyn Transport>,
    export_timeout: Duration,
    policy: RetryPolicy,
    gate: Gate,
    metrics: TransmissionMetrics,
}

impl InMemoryRetryTransmission {
    pub fn new(transport: Arc<dyn Transport>, export_timeout: Duration, policy: RetryPolicy) -> Self {
        Self {
            transport,
            export_timeout,
            policy,
            gate: Gate::default(),
            metrics: TransmissionMetrics::default(),
        }
    }
}

impl TransmissionHandler for InMemoryRetryTransmission {
    fn try_submit_request(&self, payload: &[u8]) -> bool {
        self.metrics.record_submitted();
        let Some(_inflight) = self.gate.enter() else {
            self.metrics.record_failed();
            debug!("transmission handler is shut down; payload rejected");
            return false;
        };

        let deadline = Deadline::after(Some(self.export_timeout));
        let mut schedule = RetrySchedule::new(&self.policy);
        let mut attempt = 1u32;

        loop {
            let outcome = self.transport.send(payload, deadline);
            if outcome.is_success() {
                self.metrics.record_succeeded();
                return true;
            }
            if !outcome.is_retryable() {
                self.metrics.record_failed();
                log_failure(&outcome, payload.len());
                return false;
            }

            let delay = schedule.next_delay(outcome.retry_after());
            if deadline.would_pass(delay) {
                self.metrics.record_failed();
                warn!(
                    attempts = attempt,
                    bytes = payload.len(),
                    "giving up on payload; next retry would pass the export timeout"
                );
                return false;
            }
            if !self.gate.pause(delay) {
                self.metrics.record_failed();
                debug!(attempts = attempt, "retry abandoned by shutdown");
                return false;
            }

            attempt += 1;
            self.metrics.record_retried();
            debug!(attempt, ?delay, "retrying payload transmission");
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

impl fmt::Debug for InMemoryRetryTransmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRetryTransmission")
            .field("export_timeout", &self.export_timeout)
            .field("policy", &self.policy)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transmission::tests::ScriptedTransport;
    use crate::transport::SendOutcome;
    use std::thread;
    use std::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 1.5,
        }
    }

    #[test]
    fn test_schedule_grows_to_cap() {
        let mut schedule = RetrySchedule::new(&RetryPolicy::default());
        let expected = [1000, 1500, 2250, 3375, 5000, 5000];

        for (i, bound) in expected.iter().enumerate() {
            assert_eq!(schedule.next_backoff().as_millis(), *bound, "step {i}");
            let delay = schedule.next_delay(None);
            assert!(delay < Duration::from_millis(*bound as u64));
        }
    }

    #[test]
    fn test_throttle_delay_is_used_and_seeds_backoff() {
        let mut schedule = RetrySchedule::new(&RetryPolicy::default());
        let delay = schedule.next_delay(Some(Duration::from_millis(2000)));
        assert_eq!(delay, Duration::from_millis(2000));
        assert_eq!(schedule.next_backoff(), Duration::from_millis(3000));

        // Absurd throttle delays saturate at the cap instead of overflowing.
        schedule.next_delay(Some(Duration::MAX));
        assert_eq!(schedule.next_backoff(), Duration::from_millis(5000));
    }

    #[test]
    fn test_retries_until_success() {
        let transport = ScriptedTransport::new([
            SendOutcome::from_http_status(503, None),
            SendOutcome::network_error(),
        ]);
        let handler =
            InMemoryRetryTransmission::new(transport.clone(), Duration::from_secs(2), fast_policy());

        assert!(handler.try_submit_request(b"payload"));
        assert_eq!(transport.attempts(), 3);
        assert_eq!(handler.metrics().retried(), 2);
        assert_eq!(handler.metrics().succeeded(), 1);
        assert_eq!(handler.metrics().failed(), 0);
    }

    #[test]
    fn test_non_retryable_failure_is_not_retried() {
        let transport = ScriptedTransport::new([SendOutcome::from_http_status(400, None)]);
        let handler =
            InMemoryRetryTransmission::new(transport.clone(), Duration::from_secs(2), fast_policy());

        assert!(!handler.try_submit_request(b"payload"));
        assert_eq!(transport.attempts(), 1);
        assert_eq!(handler.metrics().failed(), 1);
    }

    #[test]
    fn test_gives_up_when_throttle_passes_deadline() {
        let transport = ScriptedTransport::new([SendOutcome::from_http_status(
            429,
            Some(Duration::from_secs(30)),
        )]);
        let handler =
            InMemoryRetryTransmission::new(transport.clone(), Duration::from_secs(1), fast_policy());

        let start = Instant::now();
        assert!(!handler.try_submit_request(b"payload"));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(transport.attempts(), 1);
    }

    #[test]
    fn test_retry_budget_bounded_by_export_timeout() {
        let transport = Arc::new(crate::transport::FnTransport::new("down", |_: &[u8], _| {
            SendOutcome::network_error()
        }));
        let handler =
            InMemoryRetryTransmission::new(transport, Duration::from_millis(200), fast_policy());

        let start = Instant::now();
        assert!(!handler.try_submit_request(b"payload"));
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(handler.metrics().retried() >= 1);
    }

    #[test]
    fn test_shutdown_interrupts_backoff() {
        let transport = ScriptedTransport::new([SendOutcome::from_http_status(
            503,
            Some(Duration::from_secs(5)),
        )]);
        let handler = Arc::new(InMemoryRetryTransmission::new(
            transport.clone(),
            Duration::from_secs(30),
            fast_policy(),
        ));

        let submitter = {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.try_submit_request(b"payload"))
        };
        while transport.attempts() == 0 {
            thread::yield_now();
        }

        let start = Instant::now();
        assert!(handler.shutdown(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!submitter.join().unwrap());
        assert_eq!(transport.attempts(), 1);
    }
}
