//! Bulkhead implementation for concurrency limiting
//!
//! A semaphore caps in-flight calls per key. When it is exhausted, a caller either fails fast or,
//! if queueing is configured, waits up to `queue_timeout` for a slot. At most `max_queue`
//! callers wait at once. The wait honours the caller's [`CallContext`]; a cancelled wait never
//! holds a slot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::context::{CallContext, ContextError};
use crate::emitter::EventEmitter;
use crate::error::{BulkheadFullError, InvalidPolicyError, ResilienceError};
use crate::events::{EventKind, ResilienceEvent};
use crate::rate_limit::duration_millis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Option<Duration>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, max_queue: 100, queue_timeout: Some(Duration::from_secs(5)) }
    }
}

impl BulkheadConfig {
    /// Fail-fast bulkhead: no queueing.
    pub fn new(max_concurrent: usize) -> Result<Self, InvalidPolicyError> {
        let cfg = Self { max_concurrent, max_queue: 0, queue_timeout: None };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Let up to `max_queue` callers wait up to `queue_timeout` for a slot.
    pub fn with_queue(
        mut self,
        max_queue: usize,
        queue_timeout: Duration,
    ) -> Result<Self, InvalidPolicyError> {
        self.max_queue = max_queue;
        self.queue_timeout = Some(queue_timeout);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        if self.max_concurrent == 0 {
            return Err(InvalidPolicyError::new("max_concurrent", "must be > 0"));
        }
        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(InvalidPolicyError::new(
                "max_concurrent",
                format!("must be <= {}", Semaphore::MAX_PERMITS),
            ));
        }
        if self.queue_timeout.is_some_and(|t| t.is_zero()) {
            return Err(InvalidPolicyError::new("queue_timeout_ms", "must be > 0 when set"));
        }
        if self.queue_timeout.is_some() && self.max_queue == 0 {
            return Err(InvalidPolicyError::new("max_queue", "must be > 0 when queue_timeout_ms is set"));
        }
        Ok(())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout
    }
}

/// Why `acquire` did not return a permit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error(transparent)]
    Full(#[from] BulkheadFullError),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl<E> From<AcquireError> for ResilienceError<E> {
    fn from(e: AcquireError) -> Self {
        match e {
            AcquireError::Full(e) => ResilienceError::BulkheadFull(e),
            AcquireError::Context(e) => ResilienceError::Context(e),
        }
    }
}

/// A held slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

impl BulkheadPermit {
    pub fn release(self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    pub service: String,
    pub active_count: usize,
    pub queued_count: usize,
    pub rejected_count: u64,
    pub max_concurrent: usize,
}

/// Decrements the waiter count on every exit from the queued path.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct Bulkhead {
    service: Arc<str>,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    rejected: Arc<AtomicU64>,
    emitter: EventEmitter,
}

impl Bulkhead {
    pub fn new(service: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            service: Arc::from(service.into()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            queued: Arc::new(AtomicUsize::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            emitter: EventEmitter::noop(),
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// In-flight calls, always within `0..=max_concurrent`.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            service: self.service.to_string(),
            active_count: self.active_count(),
            queued_count: self.queued.load(Ordering::Acquire),
            rejected_count: self.rejected.load(Ordering::Relaxed),
            max_concurrent: self.config.max_concurrent,
        }
    }

    /// Take a slot, queueing if configured.
    ///
    /// # Errors
    /// `AcquireError::Full` when no slot is free and the caller cannot queue (or the queue wait
    /// timed out); `AcquireError::Context` when `ctx` ends first.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<BulkheadPermit, AcquireError> {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => return Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {}
        }

        let Some(queue_timeout) = self.config.queue_timeout else {
            return Err(self.reject(None).into());
        };
        let reserved = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                (q < self.config.max_queue).then_some(q + 1)
            })
            .is_ok();
        if !reserved {
            return Err(self.reject(None).into());
        }
        let _slot = QueueSlot(&self.queued);

        tracing::debug!(service = %self.service, timeout_ms = duration_millis(queue_timeout), "bulkhead: queued");
        let started = tokio::time::Instant::now();
        tokio::select! {
            reason = ctx.done() => Err(reason.into()),
            acquired = tokio::time::timeout(queue_timeout, self.semaphore.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => Ok(BulkheadPermit { _permit: permit }),
                    _ => Err(self.reject(Some(started.elapsed())).into()),
                }
            }
        }
    }

    /// Run `operation` while holding a slot. The slot is released on every exit path.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.acquire(ctx).await?;
        let result = operation().await;
        permit.release();
        result
    }

    fn reject(&self, waited: Option<Duration>) -> BulkheadFullError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        let active = self.active_count();
        tracing::debug!(
            service = %self.service,
            active,
            max = self.config.max_concurrent,
            waited_ms = waited.map(duration_millis),
            "bulkhead: rejected"
        );
        let mut event = ResilienceEvent::new(EventKind::BulkheadRejected, self.service.as_ref())
            .with_meta("key", self.service.as_ref())
            .with_meta("allowed", false)
            .with_meta("active_count", active)
            .with_meta("max_concurrent", self.config.max_concurrent)
            .with_meta("queued", self.queued.load(Ordering::Acquire));
        if let Some(w) = waited {
            event = event.with_meta("waited_ms", duration_millis(w));
        }
        self.emitter.emit(event);
        BulkheadFullError {
            service: self.service.to_string(),
            max_concurrent: self.config.max_concurrent,
            waited,
        }
    }
}

/// Bulkheads keyed by target, created on first use.
#[derive(Debug, Clone)]
pub struct BulkheadRegistry {
    inner: Arc<RwLock<HashMap<String, Bulkhead>>>,
    defaults: BulkheadConfig,
    emitter: EventEmitter,
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::new(BulkheadConfig::default())
    }
}

impl BulkheadRegistry {
    pub fn new(defaults: BulkheadConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())), defaults, emitter: EventEmitter::noop() }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn get_or_create(&self, key: &str) -> Bulkhead {
        if let Some(existing) = self.inner.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return existing.clone();
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.to_string())
            .or_insert_with(|| {
                Bulkhead::new(key, self.defaults.clone()).with_emitter(self.emitter.clone())
            })
            .clone()
    }

    pub async fn acquire(&self, ctx: &CallContext, key: &str) -> Result<BulkheadPermit, AcquireError> {
        self.get_or_create(key).acquire(ctx).await
    }

    pub fn remove(&self, key: &str) -> Option<Bulkhead> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    /// Metrics for every key, sorted by key.
    pub fn all_metrics(&self) -> Vec<BulkheadMetrics> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut metrics: Vec<_> = map.values().map(Bulkhead::metrics).collect();
        metrics.sort_by(|a, b| a.service.cmp(&b.service));
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn fail_fast(max: usize) -> Bulkhead {
        Bulkhead::new("reports", BulkheadConfig::new(max).unwrap())
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(BulkheadConfig::new(0).unwrap_err().field, "max_concurrent");
        let err = BulkheadConfig::new(1).unwrap().with_queue(1, Duration::ZERO).unwrap_err();
        assert_eq!(err.field, "queue_timeout_ms");
        assert_eq!(BulkheadConfig::default().max_queue(), 100);
    }

    #[test]
    fn queue_timeout_requires_queue_room() {
        let err = BulkheadConfig::new(1).unwrap().with_queue(0, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.field, "max_queue");
        assert!(BulkheadConfig::new(1).unwrap().with_queue(1, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_allows_operations_within_limit() {
        let bulkhead = fail_fast(3);
        let ctx = CallContext::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = counter.clone();
            let result = bulkhead
                .execute(&ctx, || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<TestError>>(42)
                })
                .await;
            assert_eq!(result.unwrap(), 42);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_when_at_capacity() {
        let bulkhead = fail_fast(2);
        let ctx = CallContext::new();
        let first = bulkhead.acquire(&ctx).await.unwrap();
        let _second = bulkhead.acquire(&ctx).await.unwrap();
        assert_eq!(bulkhead.active_count(), 2);

        let err = bulkhead.acquire(&ctx).await.unwrap_err();
        assert!(matches!(err, AcquireError::Full(BulkheadFullError { max_concurrent: 2, waited: None, .. })));
        assert_eq!(bulkhead.metrics().rejected_count, 1);

        first.release();
        assert_eq!(bulkhead.active_count(), 1);
        assert!(bulkhead.acquire(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_bulkhead_propagates_operation_errors() {
        let bulkhead = fail_fast(2);
        let result = bulkhead
            .execute(&CallContext::new(), || async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".to_string())))
            })
            .await;
        match result.unwrap_err() {
            ResilienceError::Inner(e) => assert_eq!(e.0, "operation failed"),
            e => panic!("Expected Inner error, got {:?}", e),
        }
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_caller_gets_slot_when_released() {
        let config = BulkheadConfig::new(1).unwrap().with_queue(4, Duration::from_secs(5)).unwrap();
        let bulkhead = Bulkhead::new("reports", config);
        let ctx = CallContext::new();
        let held = bulkhead.acquire(&ctx).await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire(&CallContext::new()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bulkhead.metrics().queued_count, 1);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(bulkhead.metrics().queued_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_wait_times_out() {
        let config = BulkheadConfig::new(1).unwrap().with_queue(4, Duration::from_millis(250)).unwrap();
        let bulkhead = Bulkhead::new("reports", config);
        let ctx = CallContext::new();
        let _held = bulkhead.acquire(&ctx).await.unwrap();

        let err = bulkhead.acquire(&ctx).await.unwrap_err();
        match err {
            AcquireError::Full(full) => assert!(full.waited.is_some_and(|w| w >= Duration::from_millis(250))),
            other => panic!("expected Full, got {other:?}"),
        }
        assert_eq!(bulkhead.metrics().queued_count, 0);
        assert_eq!(bulkhead.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_bound_rejects_extra_waiters() {
        let config = BulkheadConfig::new(1).unwrap().with_queue(1, Duration::from_secs(10)).unwrap();
        let bulkhead = Bulkhead::new("reports", config);
        let _held = bulkhead.acquire(&CallContext::new()).await.unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire(&CallContext::new()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = bulkhead.acquire(&CallContext::new()).await.unwrap_err();
        assert!(matches!(err, AcquireError::Full(BulkheadFullError { waited: None, .. })));
        waiter.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_wait_does_not_take_a_slot() {
        let config = BulkheadConfig::new(1).unwrap().with_queue(4, Duration::from_secs(10)).unwrap();
        let bulkhead = Bulkhead::new("reports", config);
        let held = bulkhead.acquire(&CallContext::new()).await.unwrap();

        let ctx = CallContext::new();
        let waiter = {
            let bulkhead = bulkhead.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { bulkhead.acquire(&ctx).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, AcquireError::Context(ContextError::Cancelled));

        assert_eq!(bulkhead.active_count(), 1);
        assert_eq!(bulkhead.metrics().queued_count, 0);
        drop(held);
        assert_eq!(bulkhead.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_the_queue_wait() {
        let config = BulkheadConfig::new(1).unwrap().with_queue(4, Duration::from_secs(10)).unwrap();
        let bulkhead = Bulkhead::new("reports", config);
        let _held = bulkhead.acquire(&CallContext::new()).await.unwrap();

        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let err = bulkhead.acquire(&ctx).await.unwrap_err();
        assert_eq!(err, AcquireError::Context(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn registry_isolates_keys() {
        let registry = BulkheadRegistry::new(BulkheadConfig::new(1).unwrap());
        let ctx = CallContext::new();
        let _a = registry.acquire(&ctx, "a").await.unwrap();
        assert!(registry.acquire(&ctx, "a").await.is_err());
        let _b = registry.acquire(&ctx, "b").await.unwrap();

        let metrics = registry.all_metrics();
        assert_eq!(metrics.len(), 2);
        assert_eq!((metrics[0].service.as_str(), metrics[0].rejected_count), ("a", 1));
        assert_eq!((metrics[1].service.as_str(), metrics[1].active_count), ("b", 1));
    }
}
