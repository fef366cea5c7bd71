//! Convenient re-exports for common meshguard types.
pub use crate::{
    backoff::Backoff,
    bulkhead::{Bulkhead, BulkheadConfig, BulkheadPermit},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    config::TargetPolicy,
    context::CallContext,
    emitter::EventEmitter,
    engine::PolicyEngine,
    error::{HasStatusCode, ResilienceError},
    events::{EventKind, ResilienceEvent},
    jitter::Jitter,
    rate_limit::{RateLimiter, SlidingWindowLimiter, TokenBucketLimiter},
    retry::{retry, RetryPolicy},
    timeout::TimeoutPolicy,
};
