//! Error types for resilience policies
//!
//! Each guard has its own small error struct so it can be returned on its own (a limiter check,
//! a bulkhead acquire). Guarded executions return [`ResilienceError<E>`], which folds those
//! together with the caller's own error type `E`.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use crate::context::ContextError;

/// The circuit for `service` is open; the call was not attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit open for {service}: {message}")]
pub struct CircuitOpenError {
    pub service: String,
    pub message: String,
    /// Time left before the breaker will admit a trial call.
    pub retry_after: Duration,
}

/// A rate limiter denied the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded for {service} ({limit} per {window:?}); retry after {retry_after:?}")]
pub struct RateLimitError {
    pub service: String,
    pub limit: u64,
    pub window: Duration,
    pub retry_after: Duration,
}

/// A bulkhead had no free slot.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("bulkhead full for {service} (max {max_concurrent} concurrent)")]
pub struct BulkheadFullError {
    pub service: String,
    pub max_concurrent: usize,
    /// How long the caller queued before giving up; `None` when rejected without queueing.
    pub waited: Option<Duration>,
}

/// An attempt ran past its time limit and was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{service} timed out after {elapsed:?} (limit {timeout:?})")]
pub struct TimeoutError {
    pub service: String,
    pub timeout: Duration,
    pub elapsed: Duration,
}

/// Failure reported by a [`KeyedStateStore`](crate::rate_limit::KeyedStateStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store backend error for key {key}: {message}")]
    Backend { key: String, message: String },
}

/// Rejected configuration. Raised at construction only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid policy field `{field}`: {reason}")]
pub struct InvalidPolicyError {
    pub field: String,
    pub reason: String,
}

impl InvalidPolicyError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }

    /// Prefix the field path, e.g. `jitter` -> `retry.jitter`.
    pub fn nested(mut self, parent: &str) -> Self {
        self.field = format!("{parent}.{}", self.field);
        self
    }
}

/// Errors that can advertise a transport-level status code (HTTP-style).
///
/// The retry policy uses this to classify failures; transport adapters use it to pick a
/// response status.
pub trait HasStatusCode {
    fn status_code(&self) -> Option<u16>;
}

impl HasStatusCode for std::convert::Infallible {
    fn status_code(&self) -> Option<u16> {
        match *self {}
    }
}

/// Unified error type for guarded executions
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open
    CircuitOpen(CircuitOpenError),
    /// A rate limiter denied admission
    RateLimited(RateLimitError),
    /// The bulkhead rejected the operation due to capacity
    BulkheadFull(BulkheadFullError),
    /// A single attempt exceeded its time limit
    Timeout(TimeoutError),
    /// All retry attempts were exhausted; `cause` is the final attempt's error
    RetryExhausted { service: String, attempts: usize, cause: Box<ResilienceError<E>> },
    /// The caller's context was cancelled or its deadline passed
    Context(ContextError),
    /// The keyed state store failed
    Store(StoreError),
    /// No policy is registered for the target
    UnknownTarget { target: String },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen(e) => write!(f, "{e}"),
            Self::RateLimited(e) => write!(f, "{e}"),
            Self::BulkheadFull(e) => write!(f, "{e}"),
            Self::Timeout(e) => write!(f, "{e}"),
            Self::RetryExhausted { service, attempts, cause } => {
                write!(f, "retry exhausted for {service} after {attempts} attempts; last error: {cause}")
            }
            Self::Context(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::UnknownTarget { target } => write!(f, "no resilience policy for target {target}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CircuitOpen(e) => Some(e),
            Self::RateLimited(e) => Some(e),
            Self::BulkheadFull(e) => Some(e),
            Self::Timeout(e) => Some(e),
            Self::RetryExhausted { cause, .. } => Some(cause.as_ref()),
            Self::Context(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::UnknownTarget { .. } => None,
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> From<CircuitOpenError> for ResilienceError<E> {
    fn from(e: CircuitOpenError) -> Self {
        Self::CircuitOpen(e)
    }
}

impl<E> From<RateLimitError> for ResilienceError<E> {
    fn from(e: RateLimitError) -> Self {
        Self::RateLimited(e)
    }
}

impl<E> From<BulkheadFullError> for ResilienceError<E> {
    fn from(e: BulkheadFullError) -> Self {
        Self::BulkheadFull(e)
    }
}

impl<E> From<TimeoutError> for ResilienceError<E> {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

impl<E> From<ContextError> for ResilienceError<E> {
    fn from(e: ContextError) -> Self {
        Self::Context(e)
    }
}

impl<E> From<StoreError> for ResilienceError<E> {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Check if this error is a rate-limit denial
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull(_))
    }

    /// Check if an attempt ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if the caller's context ended (cancelled or deadline exceeded)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Context(_))
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// The error wrapped by `RetryExhausted`.
    pub fn cause(&self) -> Option<&ResilienceError<E>> {
        match self {
            Self::RetryExhausted { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// Follow `RetryExhausted` causes down to the first non-retry error.
    pub fn root_cause(&self) -> &ResilienceError<E> {
        let mut current = self;
        while let Self::RetryExhausted { cause, .. } = current {
            current = cause.as_ref();
        }
        current
    }

    /// Number of attempts made, for `RetryExhausted`.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Suggested wait before trying again, when the guard that rejected the call knows one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(e) => Some(e.retry_after),
            Self::RateLimited(e) => Some(e.retry_after),
            Self::RetryExhausted { cause, .. } => cause.retry_after(),
            _ => None,
        }
    }

    /// Target service the error refers to, when known.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::CircuitOpen(e) => Some(&e.service),
            Self::RateLimited(e) => Some(&e.service),
            Self::BulkheadFull(e) => Some(&e.service),
            Self::Timeout(e) => Some(&e.service),
            Self::RetryExhausted { service, .. } => Some(service),
            Self::UnknownTarget { target } => Some(target),
            _ => None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CircuitOpen(_) => ErrorCode::CircuitOpen,
            Self::RateLimited(_) => ErrorCode::RateLimitExceeded,
            Self::BulkheadFull(_) => ErrorCode::BulkheadFull,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::Context(ContextError::Cancelled) => ErrorCode::Cancelled,
            Self::Context(ContextError::DeadlineExceeded) => ErrorCode::DeadlineExceeded,
            Self::Store(_) => ErrorCode::StoreUnavailable,
            Self::UnknownTarget { .. } => ErrorCode::UnknownTarget,
            Self::Inner(_) => ErrorCode::Inner,
        }
    }
}

impl<E: HasStatusCode> ResilienceError<E> {
    /// Transport status for this error: 503 for circuit-open, bulkhead-full and store failures,
    /// 429 for rate limiting, 504 for timeouts and deadlines, the cause's status for retry
    /// exhaustion.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::CircuitOpen(_) | Self::BulkheadFull(_) | Self::Store(_) => Some(503),
            Self::RateLimited(_) => Some(429),
            Self::Timeout(_) | Self::Context(ContextError::DeadlineExceeded) => Some(504),
            Self::Context(ContextError::Cancelled) | Self::UnknownTarget { .. } => None,
            Self::RetryExhausted { cause, .. } => cause.status_code(),
            Self::Inner(e) => e.status_code(),
        }
    }
}

impl<E: HasStatusCode> HasStatusCode for ResilienceError<E> {
    fn status_code(&self) -> Option<u16> {
        ResilienceError::status_code(self)
    }
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    CircuitOpen,
    RateLimitExceeded,
    BulkheadFull,
    Timeout,
    RetryExhausted,
    InvalidPolicy,
    Cancelled,
    DeadlineExceeded,
    StoreUnavailable,
    UnknownTarget,
    Inner,
}

/// Serializable form of an error, for logs and cross-service propagation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorReport>>,
}

impl<E: fmt::Display> ResilienceError<E> {
    /// Build a serializable report, tagging it (and every nested cause) with `correlation_id`.
    pub fn report(&self, correlation_id: Option<&str>) -> ErrorReport {
        ErrorReport {
            code: self.code(),
            service: self.service().map(str::to_owned),
            message: self.to_string(),
            correlation_id: correlation_id.map(str::to_owned),
            attempts: self.attempts(),
            retry_after_ms: self
                .retry_after()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            cause: self.cause().map(|c| Box::new(c.report(correlation_id))),
        }
    }
}

impl InvalidPolicyError {
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: ErrorCode::InvalidPolicy,
            service: None,
            message: self.to_string(),
            correlation_id: None,
            attempts: None,
            retry_after_ms: None,
            cause: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(u16);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "upstream returned {}", self.0)
        }
    }
    impl std::error::Error for DummyError {}
    impl HasStatusCode for DummyError {
        fn status_code(&self) -> Option<u16> {
            Some(self.0)
        }
    }

    fn circuit_open() -> ResilienceError<DummyError> {
        CircuitOpenError {
            service: "payments".into(),
            message: "failure threshold reached".into(),
            retry_after: Duration::from_secs(3),
        }
        .into()
    }

    #[test]
    fn circuit_open_display_names_service() {
        let msg = circuit_open().to_string();
        assert!(msg.contains("circuit open"));
        assert!(msg.contains("payments"));
    }

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            service: "ledger".into(),
            attempts: 4,
            cause: Box::new(ResilienceError::Inner(DummyError(503))),
        };
        let msg = err.to_string();
        assert!(msg.contains("after 4 attempts"));
        assert!(msg.contains("upstream returned 503"));
        assert_eq!(err.source().map(|s| s.to_string()), Some("upstream returned 503".into()));
    }

    #[test]
    fn status_codes_follow_error_class() {
        assert_eq!(circuit_open().status_code(), Some(503));
        let limited: ResilienceError<DummyError> = RateLimitError {
            service: "search".into(),
            limit: 10,
            window: Duration::from_secs(1),
            retry_after: Duration::from_millis(100),
        }
        .into();
        assert_eq!(limited.status_code(), Some(429));
        let full: ResilienceError<DummyError> = BulkheadFullError {
            service: "search".into(),
            max_concurrent: 2,
            waited: None,
        }
        .into();
        assert_eq!(full.status_code(), Some(503));
        let deadline: ResilienceError<DummyError> = ContextError::DeadlineExceeded.into();
        assert_eq!(deadline.status_code(), Some(504));
        let timed_out: ResilienceError<DummyError> = TimeoutError {
            service: "search".into(),
            timeout: Duration::from_millis(200),
            elapsed: Duration::from_millis(201),
        }
        .into();
        assert_eq!(timed_out.status_code(), Some(504));
        assert!(timed_out.is_timeout());
        assert_eq!(timed_out.code(), ErrorCode::Timeout);
        assert_eq!(timed_out.service(), Some("search"));
        let cancelled: ResilienceError<DummyError> = ContextError::Cancelled.into();
        assert_eq!(cancelled.status_code(), None);
        let unknown: ResilienceError<DummyError> =
            ResilienceError::UnknownTarget { target: "nope".into() };
        assert_eq!(unknown.status_code(), None);
        assert_eq!(ResilienceError::Inner(DummyError(502)).status_code(), Some(502));
    }

    #[test]
    fn retry_exhausted_takes_status_of_cause() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            service: "ledger".into(),
            attempts: 2,
            cause: Box::new(circuit_open()),
        };
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(err.root_cause().is_circuit_open());
    }

    #[test]
    fn predicates_cover_variants() {
        assert!(circuit_open().is_circuit_open());
        assert!(!circuit_open().is_inner());
        let inner = ResilienceError::Inner(DummyError(500));
        assert!(inner.is_inner());
        assert_eq!(inner.as_inner(), Some(&DummyError(500)));
        assert_eq!(inner.into_inner(), Some(DummyError(500)));
        let cancelled: ResilienceError<DummyError> = ContextError::Cancelled.into();
        assert!(cancelled.is_cancelled());
        assert!(cancelled.attempts().is_none());
    }

    #[test]
    fn report_serializes_with_screaming_codes_and_correlation_id() {
        let err: ResilienceError<DummyError> = ResilienceError::RetryExhausted {
            service: "ledger".into(),
            attempts: 3,
            cause: Box::new(ResilienceError::Inner(DummyError(503))),
        };
        let report = err.report(Some("req-42"));
        assert_eq!(report.code, ErrorCode::RetryExhausted);
        assert_eq!(report.attempts, Some(3));
        let cause = report.cause.as_deref().map(|c| (c.code, c.correlation_id.clone()));
        assert_eq!(cause, Some((ErrorCode::Inner, Some("req-42".to_string()))));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["code"], "RETRY_EXHAUSTED");
        assert_eq!(json["correlation_id"], "req-42");
        assert_eq!(json["cause"]["code"], "INNER");

        let back: ErrorReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn invalid_policy_paths_nest() {
        let err = InvalidPolicyError::new("jitter", "must be within [0, 1]").nested("retry");
        assert_eq!(err.field, "retry.jitter");
        assert_eq!(err.report().code, ErrorCode::InvalidPolicy);
        assert!(err.to_string().contains("retry.jitter"));
    }
}
