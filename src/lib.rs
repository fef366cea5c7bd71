#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # meshguard
//!
//! Resilience engine for calls to unreliable downstream services.
//!
//! ## Features
//!
//! - **Circuit breakers** with lazy open → half-open recovery and a bounded number of trial calls
//! - **Rate limiting**: token bucket and sliding-window log, per key, over a pluggable store
//! - **Bulkheads** with optional bounded, cancellable queueing
//! - **Timeouts** on each attempt, counted as breaker failures
//! - **Retry policies** with capped exponential backoff, jitter and status-code classification
//! - **Events** published without blocking to any number of `tower::Service` handlers
//! - **PolicyEngine** wiring all of the above per target from validated configuration
//!
//! ## Quick Start
//!
//! ```rust
//! use meshguard::config::{RetryConfig, TargetPolicy};
//! use meshguard::{CallContext, PolicyEngine, ResilienceError};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = PolicyEngine::default();
//!     engine
//!         .upsert_policy("payments", TargetPolicy::default().with_retry(RetryConfig::default()))
//!         .unwrap();
//!
//!     let result = engine
//!         .execute(&CallContext::new(), "payments", || async {
//!             // Your async operation here
//!             Ok::<_, ResilienceError<std::convert::Infallible>>(())
//!         })
//!         .await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod context;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod events;
pub mod jitter;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod timeout;

// Re-exports
pub use backoff::{Backoff, MAX_BACKOFF};
pub use bulkhead::{
    AcquireError, Bulkhead, BulkheadConfig, BulkheadMetrics, BulkheadPermit, BulkheadRegistry,
};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::{CallContext, ContextError};
pub use emitter::{EmitterStats, EventEmitter, LogSink, MemorySink};
pub use engine::PolicyEngine;
pub use error::{
    BulkheadFullError, CircuitOpenError, ErrorCode, ErrorReport, HasStatusCode,
    InvalidPolicyError, RateLimitError, ResilienceError, StoreError, TimeoutError,
};
pub use events::{EventKind, ResilienceEvent};
pub use jitter::Jitter;
pub use rate_limit::{
    InMemoryStore, KeyedStateStore, RateLimitDecision, RateLimitHeaders, RateLimiter,
    SlidingWindowConfig, SlidingWindowLimiter, TokenBucketConfig, TokenBucketLimiter,
};
pub use retry::{retry, RetryOutcome, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutPolicy;
