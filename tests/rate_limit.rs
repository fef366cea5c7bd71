mod common;

use async_trait::async_trait;
use common::test_helpers::wait_for_events;
use meshguard::rate_limit::{SlidingWindowState, TokenBucketState};
use meshguard::{
    EventEmitter, EventKind, InMemoryStore, KeyedStateStore, ManualClock, MemorySink,
    RateLimiter, ResilienceError, SlidingWindowConfig, SlidingWindowLimiter, StoreError,
    TokenBucketConfig, TokenBucketLimiter,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn token_bucket_exhausts_after_capacity() {
    let clock = ManualClock::new();
    let limiter = TokenBucketLimiter::new("api", TokenBucketConfig::new(5, 5.0).unwrap())
        .with_clock(clock.clone());

    for _ in 0..5 {
        assert!(limiter.allow("client").await.unwrap().allowed);
    }
    let denied = limiter.allow("client").await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);

    let err = denied.into_result("api").unwrap_err();
    let err: ResilienceError<std::convert::Infallible> = err.into();
    assert_eq!(err.status_code(), Some(429));

    clock.advance(Duration::from_millis(200));
    assert!(limiter.token_count("client").await.unwrap() >= 1.0);
}

#[tokio::test]
async fn token_bucket_bounds_hold_for_random_configs() {
    let mut rng = StdRng::seed_from_u64(2024);
    for _ in 0..50 {
        let capacity = rng.random_range(1..=100u64);
        let rate = rng.random_range(0.1..100.0);
        let clock = ManualClock::new();
        let limiter = TokenBucketLimiter::new("api", TokenBucketConfig::new(capacity, rate).unwrap())
            .with_clock(clock.clone());
        for _ in 0..100 {
            if rng.random_bool(0.5) {
                clock.advance(Duration::from_millis(rng.random_range(0..500)));
            }
            let decision = limiter.allow("k").await.unwrap();
            assert!(decision.remaining <= capacity);
            let tokens = limiter.token_count("k").await.unwrap();
            assert!((0.0..=capacity as f64).contains(&tokens));
        }
    }
}

#[tokio::test]
async fn sliding_window_expires_for_various_limits() {
    for (limit, window_ms) in [(1u64, 100u64), (3, 1_000), (5, 250), (50, 60_000)] {
        let clock = ManualClock::new();
        let limiter = SlidingWindowLimiter::new(
            "api",
            SlidingWindowConfig::new(limit, Duration::from_millis(window_ms)).unwrap(),
        )
        .with_clock(clock.clone());

        let n = limit.min(5);
        for _ in 0..n {
            assert!(limiter.allow("k").await.unwrap().allowed);
        }
        assert_eq!(limiter.request_count("k").await.unwrap() as u64, n);
        clock.advance(Duration::from_millis(window_ms));
        assert_eq!(limiter.request_count("k").await.unwrap(), 0);
    }
}

#[tokio::test]
async fn sliding_window_headers_pairs() {
    let clock = ManualClock::new();
    let limiter =
        SlidingWindowLimiter::new("api", SlidingWindowConfig::new(2, Duration::from_secs(60)).unwrap())
            .with_clock(clock.clone());
    limiter.allow("k").await.unwrap();
    clock.advance(Duration::from_millis(500));
    limiter.allow("k").await.unwrap();
    let denied = limiter.allow("k").await.unwrap();
    let pairs = denied.header_pairs();
    assert_eq!(pairs[0], ("X-RateLimit-Limit", "2".to_string()));
    assert_eq!(pairs[1], ("X-RateLimit-Remaining", "0".to_string()));
    assert_eq!(pairs[2], ("X-RateLimit-Reset", "60".to_string()));
    assert_eq!(pairs[3], ("Retry-After", "60".to_string()));
}

#[tokio::test]
async fn denials_are_published_with_dashboard_metadata() {
    let emitter = EventEmitter::new();
    let sink = MemorySink::new();
    emitter.subscribe("memory", sink.clone());
    let limiter = TokenBucketLimiter::new("api", TokenBucketConfig::new(1, 1.0).unwrap())
        .with_clock(ManualClock::new())
        .with_emitter(emitter);

    limiter.allow("tenant-1").await.unwrap();
    limiter.allow("tenant-1").await.unwrap();

    wait_for_events(&sink, 1).await;
    let event = &sink.events()[0];
    assert_eq!(event.kind, EventKind::RateLimitHit);
    assert_eq!(event.meta("key"), Some("tenant-1"));
    assert_eq!(event.meta("allowed"), Some("false"));
    assert_eq!(event.meta("remaining"), Some("0"));
    assert_eq!(event.meta("retry_after_ms"), Some("1000"));
}

/// Store that counts calls and delegates to memory, standing in for a shared backend.
#[derive(Debug, Clone)]
struct CountingStore<S> {
    inner: InMemoryStore<S>,
    updates: Arc<AtomicUsize>,
}

#[async_trait]
impl<S> KeyedStateStore<S> for CountingStore<S>
where
    S: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn update(
        &self,
        key: &str,
        init: S,
        f: &mut (dyn for<'s> FnMut(&'s mut S) + Send),
    ) -> Result<(), StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(key, init, f).await
    }

    async fn load(&self, key: &str) -> Result<Option<S>, StoreError> {
        self.inner.load(key).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.remove(key).await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        self.inner.len().await
    }
}

/// Store whose backend is down.
#[derive(Debug, Clone, Default)]
struct UnavailableStore;

#[async_trait]
impl KeyedStateStore<SlidingWindowState> for UnavailableStore {
    async fn update(
        &self,
        _key: &str,
        _init: SlidingWindowState,
        _f: &mut (dyn for<'s> FnMut(&'s mut SlidingWindowState) + Send),
    ) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn load(&self, _key: &str) -> Result<Option<SlidingWindowState>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn remove(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn limiter_runs_over_a_pluggable_store() {
    let store: CountingStore<TokenBucketState> =
        CountingStore { inner: InMemoryStore::new(), updates: Arc::new(AtomicUsize::new(0)) };
    let limiter =
        TokenBucketLimiter::with_store("api", TokenBucketConfig::new(2, 1.0).unwrap(), store.clone())
            .with_clock(ManualClock::new());
    assert!(limiter.allow("a").await.unwrap().allowed);
    assert!(limiter.allow("a").await.unwrap().allowed);
    assert!(!limiter.allow("a").await.unwrap().allowed);
    assert_eq!(store.updates.load(Ordering::SeqCst), 3);
    assert_eq!(limiter.key_count().await.unwrap(), 1);
}

#[tokio::test]
async fn store_failures_surface_as_errors() {
    let limiter = SlidingWindowLimiter::with_store(
        "api",
        SlidingWindowConfig::new(10, Duration::from_secs(1)).unwrap(),
        UnavailableStore,
    );
    let err = limiter.allow("k").await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    let err: ResilienceError<std::convert::Infallible> = err.into();
    assert_eq!(err.status_code(), Some(503));
}
