//! Raw send contract and retryability classification.
//!
//! The transmission handlers never talk HTTP or gRPC themselves. A
//! [`Transport`] sends bytes and reports a [`SendOutcome`]; the constructors
//! here map protocol status codes onto that outcome.

use crate::timeout::Deadline;
use std::fmt;
use std::time::Duration;

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Failure {
        /// Whether sending the same payload again may succeed.
        retryable: bool,
        /// Server-provided throttle delay, if any.
        retry_after: Option<Duration>,
    },
}

/// gRPC status codes that matter for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GrpcCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SendOutcome::Failure { retryable: true, .. })
    }

    /// Throttle delay of a retryable failure.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SendOutcome::Failure {
                retryable: true,
                retry_after,
            } => *retry_after,
            _ => None,
        }
    }

    pub fn retryable(retry_after: Option<Duration>) -> Self {
        SendOutcome::Failure {
            retryable: true,
            retry_after,
        }
    }

    pub fn permanent() -> Self {
        SendOutcome::Failure {
            retryable: false,
            retry_after: None,
        }
    }

    /// No response at all (connection refused, reset, DNS). Always retryable.
    pub fn network_error() -> Self {
        Self::retryable(None)
    }

    /// Classifies an HTTP response.
    ///
    /// 429, 502, 503 and 504 are retryable. `Retry-After` is only honoured on
    /// 429 and 503.
    pub fn from_http_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            200..=299 => SendOutcome::Success,
            429 | 503 => Self::retryable(retry_after),
            502 | 504 => Self::retryable(None),
            _ => Self::permanent(),
        }
    }

    /// Classifies a gRPC status.
    ///
    /// `ResourceExhausted` is only retryable when the server attached a retry
    /// delay; without one the server gives no sign it will recover.
    pub fn from_grpc_status(code: GrpcCode, retry_delay: Option<Duration>) -> Self {
        match code {
            GrpcCode::Ok => SendOutcome::Success,
            GrpcCode::Cancelled
            | GrpcCode::DeadlineExceeded
            | GrpcCode::Aborted
            | GrpcCode::OutOfRange
            | GrpcCode::Unavailable
            | GrpcCode::DataLoss => Self::retryable(retry_delay),
            GrpcCode::ResourceExhausted => match retry_delay {
                Some(delay) => Self::retryable(Some(delay)),
                None => Self::permanent(),
            },
            GrpcCode::Unknown
            | GrpcCode::InvalidArgument
            | GrpcCode::NotFound
            | GrpcCode::AlreadyExists
            | GrpcCode::PermissionDenied
            | GrpcCode::FailedPrecondition
            | GrpcCode::Unimplemented
            | GrpcCode::Internal
            | GrpcCode::Unauthenticated => Self::permanent(),
        }
    }
}

/// Parses a `Retry-After` header given in delta-seconds.
///
/// HTTP-date values are not supported and yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Sends one serialized payload to the collector.
///
/// Implementations must return by `deadline` (or shortly after); the handlers
/// use it to bound a whole retry sequence.
pub trait Transport: Send + Sync {
    fn send(&self, payload: &[u8], deadline: Deadline) -> SendOutcome;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, payload: &[u8], deadline: Deadline) -> SendOutcome {
        (**self).send(payload, deadline)
    }
}

/// Adapts a closure into a [`Transport`].
pub struct FnTransport<F> {
    name: &'static str,
    send: F,
}

impl<F> FnTransport<F>
where
    F: Fn(&[u8], Deadline) -> SendOutcome + Send + Sync,
{
    pub fn new(name: &'static str, send: F) -> Self {
        Self { name, send }
    }
}

impl<F> Transport for FnTransport<F>
where
    F: Fn(&[u8], Deadline) -> SendOutcome + Send + Sync,
{
    fn send(&self, payload: &[u8], deadline: Deadline) -> SendOutcome {
        (self.send)(payload, deadline)
    }
}

impl<F> fmt::Debug for FnTransport<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransport").field("name", &self.name).finish()
    }
}
