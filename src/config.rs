//! Per-target policy configuration.
//!
//! These are plain serde structs: the crate never parses a file format itself, it accepts values
//! already deserialized by the caller. Durations are integer milliseconds. `validate` checks every
//! field and reports the first problem with a dotted path such as `retry.jitter`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::bulkhead;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::clock::Clock;
use crate::emitter::EventEmitter;
use crate::error::InvalidPolicyError;
use crate::jitter::Jitter;
use crate::rate_limit::{
    RateLimiter, SlidingWindowConfig, SlidingWindowLimiter, TokenBucketConfig, TokenBucketLimiter,
};
use crate::retry::{RetryPolicyBuilder, DEFAULT_RETRYABLE_STATUS_CODES};
use crate::timeout;

/// Everything the engine needs to guard calls to one target service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TargetPolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_max_calls: u32,
    /// Limit on each attempt; unset means attempts may run indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 30_000,
            half_open_max_calls: 1,
            timeout_ms: None,
            rate_limit: None,
            bulkhead: None,
            retry: None,
        }
    }
}

impl TargetPolicy {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: BulkheadConfig) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        self.circuit_breaker_config()?;
        if let Some(ms) = self.timeout_ms {
            timeout::validate(Duration::from_millis(ms))?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate().map_err(|e| e.nested("rate_limit"))?;
        }
        if let Some(bh) = &self.bulkhead {
            bh.to_bulkhead_config().map_err(|e| e.nested("bulkhead"))?;
        }
        if let Some(retry) = &self.retry {
            retry.validate().map_err(|e| e.nested("retry"))?;
        }
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> Result<CircuitBreakerConfig, InvalidPolicyError> {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_millis(self.open_timeout_ms),
        )?
        .with_half_open_max_calls(self.half_open_max_calls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
}

/// `capacity`/`refill_rate` apply to the token bucket, `limit`/`window_ms` to the sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    pub capacity: u64,
    /// Tokens per second.
    pub refill_rate: f64,
    pub limit: u64,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            capacity: 100,
            refill_rate: 10.0,
            limit: 100,
            window_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn token_bucket(capacity: u64, refill_rate: f64) -> Self {
        Self { algorithm: RateLimitAlgorithm::TokenBucket, capacity, refill_rate, ..Self::default() }
    }

    pub fn sliding_window(limit: u64, window_ms: u64) -> Self {
        Self { algorithm: RateLimitAlgorithm::SlidingWindow, limit, window_ms, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                TokenBucketConfig::new(self.capacity, self.refill_rate).map(|_| ())
            }
            RateLimitAlgorithm::SlidingWindow => {
                SlidingWindowConfig::new(self.limit, Duration::from_millis(self.window_ms))
                    .map(|_| ())
            }
        }
    }

    /// Build the limiter this config describes, backed by a process-local store.
    pub fn build_limiter(
        &self,
        service: &str,
        clock: Arc<dyn Clock>,
        emitter: EventEmitter,
    ) -> Result<Arc<dyn RateLimiter>, InvalidPolicyError> {
        Ok(match self.algorithm {
            RateLimitAlgorithm::TokenBucket => {
                let config = TokenBucketConfig::new(self.capacity, self.refill_rate)?;
                Arc::new(
                    TokenBucketLimiter::new(service, config)
                        .with_shared_clock(clock)
                        .with_emitter(emitter),
                )
            }
            RateLimitAlgorithm::SlidingWindow => {
                let config =
                    SlidingWindowConfig::new(self.limit, Duration::from_millis(self.window_ms))?;
                Arc::new(
                    SlidingWindowLimiter::new(service, config)
                        .with_shared_clock(clock)
                        .with_emitter(emitter),
                )
            }
        })
    }
}

/// Bulkhead settings. Without `queue_timeout_ms` the bulkhead fails fast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub queue_timeout_ms: Option<u64>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10, max_queue: 100, queue_timeout_ms: Some(5_000) }
    }
}

impl BulkheadConfig {
    pub fn to_bulkhead_config(&self) -> Result<bulkhead::BulkheadConfig, InvalidPolicyError> {
        let config = bulkhead::BulkheadConfig::new(self.max_concurrent)?;
        match self.queue_timeout_ms {
            Some(ms) => config.with_queue(self.max_queue, Duration::from_millis(ms)),
            None => Ok(config),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.1,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        self.to_builder().and_then(RetryPolicyBuilder::build).map(|_| ())
    }

    /// A builder preloaded with these values; the caller adds service name, sleeper and emitter.
    pub fn to_builder(&self) -> Result<RetryPolicyBuilder, InvalidPolicyError> {
        if self.base_delay_ms == 0 {
            return Err(InvalidPolicyError::new("base_delay_ms", "must be > 0"));
        }
        let backoff = Backoff::exponential(Duration::from_millis(self.base_delay_ms))
            .with_max(Duration::from_millis(self.max_delay_ms))?
            .with_multiplier(self.multiplier)?;
        Ok(RetryPolicyBuilder::new()
            .max_retries(self.max_retries)
            .backoff(backoff)
            .jitter(Jitter::new(self.jitter)?)
            .retryable_status_codes(self.retryable_status_codes.iter().copied()))
    }
}
