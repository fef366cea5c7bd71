//! Rate limiting primitives.
//!
//! - [`RateLimiter`]: the async interface both algorithms implement.
//! - [`TokenBucketLimiter`]: continuous refill, lazily computed on each call.
//! - [`SlidingWindowLimiter`]: exact timestamp log over a trailing window.
//! - [`KeyedStateStore`]: where per-key state lives. [`InMemoryStore`] is the default; a shared
//!   backend can be plugged in at construction for multi-instance limiting.
//!
//! Limiters never block and never retry: a denial is returned once, with `retry_after`, and the
//! caller decides what to do with it.

use async_trait::async_trait;
use std::time::Duration;

pub mod sliding_window;
pub mod store;
pub mod token_bucket;

pub use sliding_window::{SlidingWindowConfig, SlidingWindowLimiter, SlidingWindowState};
pub use store::{InMemoryStore, KeyedStateStore};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter, TokenBucketState};

use crate::error::{RateLimitError, StoreError};

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests still available after this one.
    pub remaining: u64,
    pub limit: u64,
    /// Period the limit applies to. For a token bucket, the time to refill from empty.
    pub window: Duration,
    /// How long until the quota is fully restored.
    pub reset_after: Duration,
    /// Unix epoch milliseconds at which the quota is fully restored.
    pub reset_at: u64,
    /// Only meaningful when `allowed` is false.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Turn a denial into a [`RateLimitError`] for `service`.
    pub fn into_result(self, service: &str) -> Result<Self, RateLimitError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitError {
                service: service.to_string(),
                limit: self.limit,
                window: self.window,
                retry_after: self.retry_after,
            })
        }
    }

    pub fn headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining,
            reset_after: self.reset_after,
            reset_at: self.reset_at,
        }
    }

    /// Header pairs for the response, including `Retry-After` on denial.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = self.headers().header_pairs();
        if !self.allowed {
            pairs.push(("Retry-After", ceil_secs(self.retry_after).to_string()));
        }
        pairs
    }
}

/// Values for `X-RateLimit-*` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
    /// Unix epoch milliseconds.
    pub reset_at: u64,
}

impl RateLimitHeaders {
    /// `X-RateLimit-Reset` is expressed in whole seconds until reset, rounded up.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", ceil_secs(self.reset_after).to_string()),
        ]
    }
}

/// Core interface for per-key admission control.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Target service this limiter protects; used in errors and events.
    fn service(&self) -> &str;

    /// Admit or deny one request for `key`. Per-key state is created on first use.
    async fn allow(&self, key: &str) -> Result<RateLimitDecision, StoreError>;

    /// Current header values for `key` without consuming quota.
    async fn headers(&self, key: &str) -> Result<RateLimitHeaders, StoreError>;

    /// Drop the state for `key`; the next request starts from a full quota.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Number of keys with live state.
    async fn key_count(&self) -> Result<usize, StoreError>;
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

pub(crate) fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// `Duration::from_secs_f64` that saturates instead of panicking on overflow or NaN.
pub(crate) fn secs_f64(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
