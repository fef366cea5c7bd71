//! Token bucket limiter.
//!
//! Each key owns a bucket of `capacity` tokens refilled continuously at `refill_rate` tokens per
//! second. Refill is computed lazily from the time since the last call; nothing ticks in the
//! background. A new key starts with a full bucket.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::store::{InMemoryStore, KeyedStateStore};
use super::{duration_millis, secs_f64, RateLimitDecision, RateLimitHeaders, RateLimiter};
use crate::clock::{wall_clock_millis, Clock, MonotonicClock};
use crate::emitter::EventEmitter;
use crate::error::{InvalidPolicyError, StoreError};
use crate::events::{EventKind, ResilienceEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketConfig {
    capacity: u64,
    refill_rate: f64,
}

impl TokenBucketConfig {
    /// `refill_rate` is in tokens per second.
    pub fn new(capacity: u64, refill_rate: f64) -> Result<Self, InvalidPolicyError> {
        if capacity == 0 {
            return Err(InvalidPolicyError::new("capacity", "must be > 0"));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(InvalidPolicyError::new("refill_rate", "must be a positive finite number"));
        }
        Ok(Self { capacity, refill_rate })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Time to refill an empty bucket.
    pub fn window(&self) -> Duration {
        secs_f64(self.capacity as f64 / self.refill_rate)
    }
}

/// Per-key bucket state. `0 <= tokens <= capacity` holds after every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_millis: u64,
}

impl TokenBucketState {
    fn full(config: &TokenBucketConfig, now: u64) -> Self {
        Self { tokens: config.capacity as f64, last_refill_millis: now }
    }

    fn refill(&mut self, config: &TokenBucketConfig, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill_millis) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * config.refill_rate).clamp(0.0, config.capacity as f64);
        self.last_refill_millis = now;
    }

    /// Projected token count at `now`, without mutating.
    fn projected(&self, config: &TokenBucketConfig, now: u64) -> f64 {
        let mut copy = self.clone();
        copy.refill(config, now);
        copy.tokens
    }
}

#[derive(Debug, Clone)]
pub struct TokenBucketLimiter<St = InMemoryStore<TokenBucketState>> {
    service: Arc<str>,
    config: TokenBucketConfig,
    store: St,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
}

impl TokenBucketLimiter {
    /// Limiter with a process-local store.
    pub fn new(service: impl Into<String>, config: TokenBucketConfig) -> Self {
        Self::with_store(service, config, InMemoryStore::new())
    }
}

impl<St> TokenBucketLimiter<St>
where
    St: KeyedStateStore<TokenBucketState>,
{
    pub fn with_store(service: impl Into<String>, config: TokenBucketConfig, store: St) -> Self {
        Self {
            service: Arc::from(service.into()),
            config,
            store,
            clock: Arc::new(MonotonicClock::default()),
            emitter: EventEmitter::noop(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Tokens available for `key` right now, including refill since the last call.
    /// Unknown keys report a full bucket.
    pub async fn token_count(&self, key: &str) -> Result<f64, StoreError> {
        let now = self.clock.now_millis();
        Ok(match self.store.load(key).await? {
            Some(state) => state.projected(&self.config, now),
            None => self.config.capacity as f64,
        })
    }

    fn decide(&self, state: &mut TokenBucketState, now: u64) -> RateLimitDecision {
        state.refill(&self.config, now);
        let allowed = state.tokens >= 1.0;
        let retry_after = if allowed {
            state.tokens -= 1.0;
            Duration::ZERO
        } else {
            secs_f64((1.0 - state.tokens) / self.config.refill_rate)
        };
        let headers = self.headers_for(state.tokens);
        RateLimitDecision {
            allowed,
            remaining: headers.remaining,
            limit: headers.limit,
            window: self.config.window(),
            reset_after: headers.reset_after,
            reset_at: headers.reset_at,
            retry_after,
        }
    }

    fn headers_for(&self, tokens: f64) -> RateLimitHeaders {
        let capacity = self.config.capacity as f64;
        let reset_after = secs_f64((capacity - tokens) / self.config.refill_rate);
        RateLimitHeaders {
            limit: self.config.capacity,
            remaining: tokens.floor().max(0.0) as u64,
            reset_after,
            reset_at: wall_clock_millis().saturating_add(duration_millis(reset_after)),
        }
    }
}

#[async_trait]
impl<St> RateLimiter for TokenBucketLimiter<St>
where
    St: KeyedStateStore<TokenBucketState>,
{
    fn service(&self) -> &str {
        &self.service
    }

    async fn allow(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now_millis();
        let mut decision = None;
        self.store
            .update(key, TokenBucketState::full(&self.config, now), &mut |state: &mut TokenBucketState| {
                decision = Some(self.decide(state, now));
            })
            .await?;
        let decision = decision.ok_or_else(|| StoreError::Backend {
            key: key.to_string(),
            message: "store did not apply the update".to_string(),
        })?;

        if !decision.allowed {
            tracing::debug!(
                service = %self.service,
                key,
                retry_after_ms = duration_millis(decision.retry_after),
                "token bucket: request denied"
            );
            self.emitter.emit(
                ResilienceEvent::new(EventKind::RateLimitHit, self.service.as_ref())
                    .with_meta("key", key)
                    .with_meta("algorithm", "token_bucket")
                    .with_meta("allowed", false)
                    .with_meta("limit", decision.limit)
                    .with_meta("remaining", decision.remaining)
                    .with_meta("retry_after_ms", duration_millis(decision.retry_after)),
            );
        }
        Ok(decision)
    }

    async fn headers(&self, key: &str) -> Result<RateLimitHeaders, StoreError> {
        let tokens = self.token_count(key).await?;
        Ok(self.headers_for(tokens))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key).await.map(|_| ())
    }

    async fn key_count(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }
}
