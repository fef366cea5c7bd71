//! Exponential backoff for retry policies.
//!
//! Attempt semantics: attempt `0` is the delay before the first retry, so `delay(0) == base`.
//! The delay for attempt `n` is `base * multiplier^n`, capped at `max`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use meshguard::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_millis(500))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(3), Duration::from_millis(500)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `max`, which itself never
//! exceeds `MAX_BACKOFF` (1 day).

use std::time::Duration;

use crate::error::InvalidPolicyError;

/// Upper bound on any computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Doubling backoff starting at `base`, capped at [`MAX_BACKOFF`].
    pub fn exponential(base: Duration) -> Self {
        Self { base: base.min(MAX_BACKOFF), max: MAX_BACKOFF, multiplier: 2.0 }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, InvalidPolicyError> {
        if max.is_zero() {
            return Err(InvalidPolicyError::new("max_delay_ms", "must be > 0"));
        }
        if max < self.base {
            return Err(InvalidPolicyError::new(
                "max_delay_ms",
                format!("must be >= base delay ({}ms)", self.base.as_millis()),
            ));
        }
        self.max = max.min(MAX_BACKOFF);
        Ok(self)
    }

    /// Growth factor between consecutive attempts, within `[1, 10]`.
    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, InvalidPolicyError> {
        if !(1.0..=10.0).contains(&multiplier) {
            return Err(InvalidPolicyError::new("multiplier", "must be within [1, 10]"));
        }
        self.multiplier = multiplier;
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let nanos = self.base.as_nanos() as f64 * self.multiplier.powi(exponent);
        let cap = self.max.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return self.max;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl Default for Backoff {
    /// 100ms base, 10s cap, doubling.
    fn default() -> Self {
        Self { base: Duration::from_millis(100), max: Duration::from_secs(10), multiplier: 2.0 }
    }
}
