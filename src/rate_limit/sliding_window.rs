//! Sliding-window log limiter.
//!
//! Keeps the exact timestamp of every admitted request per key. A timestamp expires once it is
//! `window` old, so after a full window of silence a key's count is zero.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::store::{InMemoryStore, KeyedStateStore};
use super::{duration_millis, RateLimitDecision, RateLimitHeaders, RateLimiter};
use crate::clock::{wall_clock_millis, Clock, MonotonicClock};
use crate::emitter::EventEmitter;
use crate::error::{InvalidPolicyError, StoreError};
use crate::events::{EventKind, ResilienceEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    limit: u64,
    window: Duration,
}

impl SlidingWindowConfig {
    pub fn new(limit: u64, window: Duration) -> Result<Self, InvalidPolicyError> {
        if limit == 0 {
            return Err(InvalidPolicyError::new("limit", "must be > 0"));
        }
        if window.as_millis() == 0 {
            return Err(InvalidPolicyError::new("window_ms", "must be at least 1ms"));
        }
        Ok(Self { limit, window })
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Ascending timestamps (clock millis) of admitted requests still inside the window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    pub timestamps: VecDeque<u64>,
}

impl SlidingWindowState {
    fn prune(&mut self, window_ms: u64, now: u64) {
        while self.timestamps.front().is_some_and(|&ts| ts.saturating_add(window_ms) <= now) {
            self.timestamps.pop_front();
        }
    }

    /// Time until the oldest entry leaves the window.
    fn until_oldest_expires(&self, window_ms: u64, now: u64) -> Duration {
        self.timestamps
            .front()
            .map(|&oldest| Duration::from_millis(oldest.saturating_add(window_ms).saturating_sub(now)))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter<St = InMemoryStore<SlidingWindowState>> {
    service: Arc<str>,
    config: SlidingWindowConfig,
    store: St,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
}

impl SlidingWindowLimiter {
    /// Limiter with a process-local store.
    pub fn new(service: impl Into<String>, config: SlidingWindowConfig) -> Self {
        Self::with_store(service, config, InMemoryStore::new())
    }
}

impl<St> SlidingWindowLimiter<St>
where
    St: KeyedStateStore<SlidingWindowState>,
{
    pub fn with_store(service: impl Into<String>, config: SlidingWindowConfig, store: St) -> Self {
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

    pub fn config(&self) -> &SlidingWindowConfig {
        &self.config
    }

    fn window_ms(&self) -> u64 {
        duration_millis(self.config.window)
    }

    /// Requests currently counted against `key`, after pruning expired entries.
    pub async fn request_count(&self, key: &str) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let window_ms = self.window_ms();
        Ok(match self.store.load(key).await? {
            Some(mut state) => {
                state.prune(window_ms, now);
                state.timestamps.len()
            }
            None => 0,
        })
    }

    fn decide(&self, state: &mut SlidingWindowState, now: u64) -> RateLimitDecision {
        let window_ms = self.window_ms();
        state.prune(window_ms, now);
        let count = state.timestamps.len() as u64;
        let allowed = count < self.config.limit;
        let retry_after = if allowed {
            state.timestamps.push_back(now);
            Duration::ZERO
        } else {
            state.until_oldest_expires(window_ms, now)
        };
        let headers = self.headers_for(state, now);
        RateLimitDecision {
            allowed,
            remaining: headers.remaining,
            limit: headers.limit,
            window: self.config.window,
            reset_after: headers.reset_after,
            reset_at: headers.reset_at,
            retry_after,
        }
    }

    fn headers_for(&self, state: &SlidingWindowState, now: u64) -> RateLimitHeaders {
        let reset_after = state.until_oldest_expires(self.window_ms(), now);
        RateLimitHeaders {
            limit: self.config.limit,
            remaining: self.config.limit.saturating_sub(state.timestamps.len() as u64),
            reset_after,
            reset_at: wall_clock_millis().saturating_add(duration_millis(reset_after)),
        }
    }
}

#[async_trait]
impl<St> RateLimiter for SlidingWindowLimiter<St>
where
    St: KeyedStateStore<SlidingWindowState>,
{
    fn service(&self) -> &str {
        &self.service
    }

    async fn allow(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now_millis();
        let mut decision = None;
        self.store
            .update(key, SlidingWindowState::default(), &mut |state: &mut SlidingWindowState| {
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
                "sliding window: request denied"
            );
            self.emitter.emit(
                ResilienceEvent::new(EventKind::RateLimitHit, self.service.as_ref())
                    .with_meta("key", key)
                    .with_meta("algorithm", "sliding_window")
                    .with_meta("allowed", false)
                    .with_meta("limit", decision.limit)
                    .with_meta("remaining", decision.remaining)
                    .with_meta("retry_after_ms", duration_millis(decision.retry_after)),
            );
        }
        Ok(decision)
    }

    async fn headers(&self, key: &str) -> Result<RateLimitHeaders, StoreError> {
        let now = self.clock.now_millis();
        let mut state = self.store.load(key).await?.unwrap_or_default();
        state.prune(self.window_ms(), now);
        Ok(self.headers_for(&state, now))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(key).await.map(|_| ())
    }

    async fn key_count(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: u64, window_ms: u64) -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::new();
        let config = SlidingWindowConfig::new(limit, Duration::from_millis(window_ms)).unwrap();
        (SlidingWindowLimiter::new("api", config).with_clock(clock.clone()), clock)
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(SlidingWindowConfig::new(0, Duration::from_secs(1)).unwrap_err().field, "limit");
        assert_eq!(
            SlidingWindowConfig::new(1, Duration::from_micros(10)).unwrap_err().field,
            "window_ms"
        );
    }

    #[tokio::test]
    async fn counts_requests_and_expires_after_window() {
        for limit in [1u64, 3, 5, 10] {
            let (limiter, clock) = limiter(limit, 1_000);
            let n = limit.min(5);
            for _ in 0..n {
                assert!(limiter.allow("k").await.unwrap().allowed);
            }
            assert_eq!(limiter.request_count("k").await.unwrap() as u64, n);
            clock.advance(Duration::from_millis(1_000));
            assert_eq!(limiter.request_count("k").await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn denial_waits_for_oldest_entry() {
        let (limiter, clock) = limiter(2, 1_000);
        assert!(limiter.allow("k").await.unwrap().allowed);
        clock.advance(Duration::from_millis(300));
        assert!(limiter.allow("k").await.unwrap().allowed);
        clock.advance(Duration::from_millis(200));

        let denied = limiter.allow("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_millis(500));
        assert_eq!(limiter.request_count("k").await.unwrap(), 2, "denials are not recorded");

        clock.advance(Duration::from_millis(500));
        let allowed = limiter.allow("k").await.unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 0);
    }

    #[tokio::test]
    async fn headers_report_oldest_expiry() {
        let (limiter, clock) = limiter(3, 10_000);
        limiter.allow("k").await.unwrap();
        clock.advance(Duration::from_millis(4_000));
        let h = limiter.headers("k").await.unwrap();
        assert_eq!(h.limit, 3);
        assert_eq!(h.remaining, 2);
        assert_eq!(h.reset_after, Duration::from_millis(6_000));
    }

    #[tokio::test]
    async fn reset_clears_key() {
        let (limiter, _clock) = limiter(1, 60_000);
        assert!(limiter.allow("k").await.unwrap().allowed);
        assert!(!limiter.allow("k").await.unwrap().allowed);
        limiter.reset("k").await.unwrap();
        assert_eq!(limiter.key_count().await.unwrap(), 0);
        assert!(limiter.allow("k").await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_respect_limit() {
        let (limiter, _clock) = limiter(25, 60_000);
        let limiter = Arc::new(limiter);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0usize;
                for _ in 0..10 {
                    if limiter.allow("shared").await.unwrap().allowed {
                        allowed += 1;
                    }
                }
                allowed
            }));
        }
        let mut total = 0;
        for h in handles {
            total += h.await.unwrap();
        }
        assert_eq!(total, 25);
        assert_eq!(limiter.request_count("shared").await.unwrap(), 25);
    }
}
