//! Composition root: per-target guards built from [`TargetPolicy`] values.
//!
//! The live table is swapped atomically, so readers on the hot path never take a lock. Upserting
//! a target rebuilds all of its guards; in-flight calls finish against the guards they started
//! with.
//!
//! Call order inside [`PolicyEngine::execute`]:
//! rate limit (key = target) → retry → bulkhead → circuit breaker → timeout → operation.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::bulkhead::{Bulkhead, BulkheadMetrics};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::clock::{Clock, MonotonicClock};
use crate::config::TargetPolicy;
use crate::context::CallContext;
use crate::emitter::EventEmitter;
use crate::error::{HasStatusCode, InvalidPolicyError, ResilienceError};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;

#[derive(Debug)]
struct TargetGuards {
    policy: TargetPolicy,
    version: u64,
    breaker: CircuitBreaker,
    bulkhead: Option<Bulkhead>,
    limiter: Option<Arc<dyn RateLimiter>>,
    retry: Option<RetryPolicy>,
    timeout: Option<TimeoutPolicy>,
}

type PolicyTable = HashMap<String, Arc<TargetGuards>>;

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    table: Arc<ArcSwap<PolicyTable>>,
    writer: Arc<Mutex<()>>,
    breakers: CircuitBreakerRegistry,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    emitter: EventEmitter,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(EventEmitter::noop())
    }
}

impl PolicyEngine {
    /// Every guard built by this engine publishes to `emitter`.
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            table: Arc::new(ArcSwap::from_pointee(PolicyTable::new())),
            writer: Arc::new(Mutex::new(())),
            breakers: CircuitBreakerRegistry::default().with_emitter(emitter.clone()),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            emitter,
        }
    }

    /// Clock for guards built by later upserts.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper for retry backoff in guards built by later upserts.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Validate `policy` and install fresh guards for `target`, replacing any previous ones.
    /// Returns the new version for the target (1 on first install).
    ///
    /// # Errors
    /// `InvalidPolicyError` naming the offending field; the table is left unchanged.
    pub fn upsert_policy(&self, target: &str, policy: TargetPolicy) -> Result<u64, InvalidPolicyError> {
        policy.validate()?;
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        let version = current.get(target).map_or(1, |g| g.version + 1);
        let guards = Arc::new(self.build_guards(target, policy, version)?);

        let mut next = PolicyTable::clone(&current);
        next.insert(target.to_string(), guards.clone());
        self.breakers.remove(target);
        self.breakers.register(guards.breaker.clone());
        self.table.store(Arc::new(next));

        tracing::info!(service = %target, version, "policy installed");
        Ok(version)
    }

    pub fn remove_policy(&self, target: &str) -> Option<TargetPolicy> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.table.load_full();
        let removed = current.get(target)?.policy.clone();
        let mut next = PolicyTable::clone(&current);
        next.remove(target);
        self.breakers.remove(target);
        self.table.store(Arc::new(next));
        tracing::info!(service = %target, "policy removed");
        Some(removed)
    }

    pub fn policy(&self, target: &str) -> Option<TargetPolicy> {
        self.guards(target).map(|g| g.policy.clone())
    }

    pub fn version(&self, target: &str) -> Option<u64> {
        self.guards(target).map(|g| g.version)
    }

    /// Configured targets, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<_> = self.table.load().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn breaker(&self, target: &str) -> Option<CircuitBreaker> {
        self.guards(target).map(|g| g.breaker.clone())
    }

    pub fn bulkhead(&self, target: &str) -> Option<Bulkhead> {
        self.guards(target).and_then(|g| g.bulkhead.clone())
    }

    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub fn bulkhead_metrics(&self) -> Vec<BulkheadMetrics> {
        let table = self.table.load();
        let mut metrics: Vec<_> =
            table.values().filter_map(|g| g.bulkhead.as_ref().map(Bulkhead::metrics)).collect();
        metrics.sort_by(|a, b| a.service.cmp(&b.service));
        metrics
    }

    /// Consume one unit of `target`'s rate limit for `key`. `Ok(None)` when the target has no
    /// rate limit configured. A denial is returned as a decision, not an error.
    pub async fn check_rate_limit(
        &self,
        target: &str,
        key: &str,
    ) -> Result<Option<RateLimitDecision>, ResilienceError<Infallible>> {
        let guards = self.require(target)?;
        match &guards.limiter {
            Some(limiter) => Ok(Some(limiter.allow(key).await?)),
            None => Ok(None),
        }
    }

    /// Close `target`'s breaker and clear its rate-limit state for the target key.
    pub async fn reset(&self, target: &str) -> Result<(), ResilienceError<Infallible>> {
        let guards = self.require(target)?;
        guards.breaker.reset();
        if let Some(limiter) = &guards.limiter {
            limiter.reset(target).await?;
        }
        Ok(())
    }

    /// Run `operation` against `target` under its configured guards.
    ///
    /// # Errors
    /// - `UnknownTarget` when no policy is installed for `target`.
    /// - `RateLimited` when admission is denied; the operation is not invoked and not retried.
    /// - Any guard or operation error, wrapped in `RetryExhausted` when a retry policy gave up.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        ctx: &CallContext,
        target: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        E: HasStatusCode,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        let guards = self.require(target)?;
        if let Some(limiter) = &guards.limiter {
            limiter.allow(target).await?.into_result(target)?;
        }

        let guards = guards.as_ref();
        let op_cell = Mutex::new(operation);
        let op_cell = &op_cell;
        let attempt = move || async move {
            let call = move || {
                let mut op = op_cell.lock().unwrap_or_else(PoisonError::into_inner);
                (*op)()
            };
            let timed = move || async move {
                match &guards.timeout {
                    Some(timeout) => timeout.execute(ctx, call).await,
                    None => call().await,
                }
            };
            let guarded = move || guards.breaker.execute(timed);
            match &guards.bulkhead {
                Some(bulkhead) => bulkhead.execute(ctx, guarded).await,
                None => guarded().await,
            }
        };

        match &guards.retry {
            Some(policy) => policy.execute(ctx, attempt).await.map(|outcome| outcome.value),
            None => attempt().await,
        }
    }

    fn guards(&self, target: &str) -> Option<Arc<TargetGuards>> {
        self.table.load().get(target).cloned()
    }

    fn require<E>(&self, target: &str) -> Result<Arc<TargetGuards>, ResilienceError<E>> {
        self.guards(target).ok_or_else(|| {
            tracing::debug!(service = %target, "no policy for target");
            ResilienceError::UnknownTarget { target: target.to_string() }
        })
    }

    fn build_guards(
        &self,
        target: &str,
        policy: TargetPolicy,
        version: u64,
    ) -> Result<TargetGuards, InvalidPolicyError> {
        let breaker = CircuitBreaker::new(target, policy.circuit_breaker_config()?)
            .with_shared_clock(self.clock.clone())
            .with_emitter(self.emitter.clone());
        let bulkhead = match &policy.bulkhead {
            Some(cfg) => Some(
                Bulkhead::new(target, cfg.to_bulkhead_config().map_err(|e| e.nested("bulkhead"))?)
                    .with_emitter(self.emitter.clone()),
            ),
            None => None,
        };
        let limiter = match &policy.rate_limit {
            Some(cfg) => Some(
                cfg.build_limiter(target, self.clock.clone(), self.emitter.clone())
                    .map_err(|e| e.nested("rate_limit"))?,
            ),
            None => None,
        };
        let retry = match &policy.retry {
            Some(cfg) => Some(
                cfg.to_builder()
                    .and_then(|b| {
                        b.service(target)
                            .with_shared_sleeper(self.sleeper.clone())
                            .with_emitter(self.emitter.clone())
                            .build()
                    })
                    .map_err(|e| e.nested("retry"))?,
            ),
            None => None,
        };
        let timeout = match policy.timeout_ms {
            Some(ms) => Some(
                TimeoutPolicy::new(target, Duration::from_millis(ms))?
                    .with_emitter(self.emitter.clone()),
            ),
            None => None,
        };
        Ok(TargetGuards { policy, version, breaker, bulkhead, limiter, retry, timeout })
    }
}
