//! Retry policy implementation
//!
//! Semantics:
//! - `max_retries` counts retries after the initial attempt, so an operation runs at most
//!   `max_retries + 1` times.
//! - An error is retryable when its [`HasStatusCode::status_code`] is in
//!   `retryable_status_codes` (default `{429, 502, 503, 504}`). Errors without a status, and
//!   context errors, are returned immediately.
//! - The delay before retry `n` (0-based) is `backoff.delay(n)` scaled by jitter.
//! - The inter-attempt sleep races the caller's [`CallContext`]; cancellation or deadline ends the
//!   loop with the context error.
//! - Exhaustion returns `ResilienceError::RetryExhausted` wrapping the last error.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use meshguard::{Backoff, CallContext, InstantSleeper, Jitter, ResilienceError, RetryPolicy};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .jitter(Jitter::none())
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result = policy
//!     .execute(&CallContext::new(), || async {
//!         Err::<(), ResilienceError<std::convert::Infallible>>(
//!             meshguard::BulkheadFullError {
//!                 service: "db".into(),
//!                 max_concurrent: 1,
//!                 waited: None,
//!             }
//!             .into(),
//!         )
//!     })
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), Some(3));
//! # });
//! ```

use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::context::CallContext;
use crate::emitter::EventEmitter;
use crate::error::{HasStatusCode, InvalidPolicyError, ResilienceError};
use crate::events::{EventKind, ResilienceEvent};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Status codes retried when none are configured.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

/// Upper bound on `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// A successful result and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: usize,
}

/// Retry policy combining backoff, jitter, retryability and sleeper. Immutable once built.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    retryable_status_codes: BTreeSet<u16>,
    sleeper: Arc<dyn Sleeper>,
    service: Arc<str>,
    emitter: EventEmitter,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn retryable_status_codes(&self) -> &BTreeSet<u16> {
        &self.retryable_status_codes
    }

    pub fn is_retryable(&self, status_code: u16) -> bool {
        self.retryable_status_codes.contains(&status_code)
    }

    /// Jittered delay before retry `attempt` (0-based). Pure when jitter is zero.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }

    pub fn calculate_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.jitter.apply_with_rng(self.backoff.delay(attempt), rng)
    }

    /// Execute an async operation with retry semantics.
    ///
    /// # Errors
    /// - `ResilienceError::Context` when `ctx` is cancelled or past its deadline, before an
    ///   attempt or during a backoff sleep.
    /// - The operation's own error when it is not retryable.
    /// - `ResilienceError::RetryExhausted` with `attempts = max_retries + 1` when every attempt
    ///   failed with a retryable error.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &CallContext,
        mut operation: Op,
    ) -> Result<RetryOutcome<T>, ResilienceError<E>>
    where
        E: HasStatusCode,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt: u32 = 0;
        loop {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }
            let err = match operation().await {
                Ok(value) => {
                    return Ok(RetryOutcome { value, attempts: attempt as usize + 1 });
                }
                Err(e @ ResilienceError::Context(_)) => return Err(e),
                Err(e) => e,
            };
            let status = err.status_code();
            if !status.is_some_and(|code| self.is_retryable(code)) {
                return Err(err);
            }

            if attempt >= self.max_retries {
                let attempts = self.max_retries as usize + 1;
                tracing::warn!(service = %self.service, attempts, status, "retry: exhausted");
                self.emitter.emit(
                    ResilienceEvent::new(EventKind::RetryExhausted, self.service.as_ref())
                        .with_correlation_id(ctx.correlation_id())
                        .with_meta("key", self.service.as_ref())
                        .with_meta("attempts", attempts)
                        .with_meta("status", status_label(status)),
                );
                return Err(ResilienceError::RetryExhausted {
                    service: self.service.to_string(),
                    attempts,
                    cause: Box::new(err),
                });
            }

            let delay = self.calculate_delay(attempt);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(
                service = %self.service,
                attempt = attempt + 1,
                delay_ms,
                status,
                "retry: backing off"
            );
            self.emitter.emit(
                ResilienceEvent::new(EventKind::RetryAttempt, self.service.as_ref())
                    .with_correlation_id(ctx.correlation_id())
                    .with_meta("key", self.service.as_ref())
                    .with_meta("attempt", attempt + 1)
                    .with_meta("delay_ms", delay_ms)
                    .with_meta("status", status_label(status)),
            );

            tokio::select! {
                reason = ctx.done() => return Err(reason.into()),
                _ = self.sleeper.sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn status_label(status: Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Run `operation` under `policy`.
pub async fn retry<T, E, Fut, Op>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    operation: Op,
) -> Result<RetryOutcome<T>, ResilienceError<E>>
where
    E: HasStatusCode,
    Fut: Future<Output = Result<T, ResilienceError<E>>>,
    Op: FnMut() -> Fut,
{
    policy.execute(ctx, operation).await
}

/// Builder for `RetryPolicy`.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    retryable_status_codes: BTreeSet<u16>,
    sleeper: Arc<dyn Sleeper>,
    service: String,
    emitter: EventEmitter,
}

impl RetryPolicyBuilder {
    /// 3 retries, 100ms doubling backoff capped at 10s, 10% jitter, real sleeps.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            jitter: Jitter::default(),
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect(),
            sleeper: Arc::new(TokioSleeper),
            service: "default".to_string(),
            emitter: EventEmitter::noop(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Name used in errors and events.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy, InvalidPolicyError> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(InvalidPolicyError::new(
                "max_retries",
                format!("must be <= {MAX_RETRIES_LIMIT}"),
            ));
        }
        if let Some(code) = self.retryable_status_codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(InvalidPolicyError::new(
                "retryable_status_codes",
                format!("{code} is not an HTTP status code"),
            ));
        }
        Ok(RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.backoff,
            jitter: self.jitter,
            retryable_status_codes: self.retryable_status_codes,
            sleeper: self.sleeper,
            service: Arc::from(self.service),
            emitter: self.emitter,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
