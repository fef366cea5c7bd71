//! Per-attempt time limit.
//!
//! The limit applies to one invocation of the operation. When it runs out the operation's future
//! is dropped and the caller gets [`TimeoutError`]. Inside [`PolicyEngine`](crate::PolicyEngine)
//! the timeout sits between the circuit breaker and the operation, so a timed-out attempt
//! counts as a breaker failure and, being a 504, is retryable under the default code set.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::context::CallContext;
use crate::emitter::EventEmitter;
use crate::error::{InvalidPolicyError, ResilienceError, TimeoutError};
use crate::events::{EventKind, ResilienceEvent};
use crate::rate_limit::duration_millis;

/// Shortest accepted limit.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest accepted limit.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    service: Arc<str>,
    duration: Duration,
    emitter: EventEmitter,
}

impl TimeoutPolicy {
    /// # Errors
    /// `InvalidPolicyError` on `timeout_ms` unless `duration` is within
    /// [`MIN_TIMEOUT`]..=[`MAX_TIMEOUT`].
    pub fn new(service: impl Into<String>, duration: Duration) -> Result<Self, InvalidPolicyError> {
        validate(duration)?;
        Ok(Self { service: Arc::from(service.into()), duration, emitter: EventEmitter::noop() })
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Run `operation`, abandoning it once the limit passes. `ctx` only contributes the
    /// correlation id of the timeout event; cancellation is handled by the layers around this.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    service = %self.service,
                    timeout_ms = duration_millis(self.duration),
                    elapsed_ms = duration_millis(elapsed),
                    "timeout: attempt abandoned"
                );
                self.emitter.emit(
                    ResilienceEvent::new(EventKind::Timeout, self.service.as_ref())
                        .with_correlation_id(ctx.correlation_id())
                        .with_meta("key", self.service.as_ref())
                        .with_meta("allowed", false)
                        .with_meta("timeout_ms", duration_millis(self.duration))
                        .with_meta("elapsed_ms", duration_millis(elapsed)),
                );
                Err(TimeoutError {
                    service: self.service.to_string(),
                    timeout: self.duration,
                    elapsed,
                }
                .into())
            }
        }
    }
}

pub(crate) fn validate(duration: Duration) -> Result<(), InvalidPolicyError> {
    if duration < MIN_TIMEOUT || duration > MAX_TIMEOUT {
        return Err(InvalidPolicyError::new(
            "timeout_ms",
            format!(
                "must be within [{}, {}]",
                duration_millis(MIN_TIMEOUT),
                duration_millis(MAX_TIMEOUT)
            ),
        ));
    }
    Ok(())
}
