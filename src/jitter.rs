//! Jitter to prevent thundering herd
//!
//! A jitter factor `f` in `[0, 1]` scales each delay by a uniformly sampled value in
//! `[1 - f, 1 + f]`. With `f = 0` the delay is returned unchanged and no randomness is drawn.
//!
//! Notes:
//! - RNG: uses `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//!   `apply_with_rng`.
//! - Results saturate at [`MAX_BACKOFF`](crate::backoff::MAX_BACKOFF) instead of panicking.
//!
//! Example:
//! ```rust
//! use meshguard::Jitter;
//! use std::time::Duration;
//!
//! let jitter = Jitter::new(0.2).unwrap();
//! let d = jitter.apply(Duration::from_millis(100));
//! assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

use crate::backoff::MAX_BACKOFF;
use crate::error::InvalidPolicyError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jitter {
    factor: f64,
}

impl Default for Jitter {
    fn default() -> Self {
        Self { factor: 0.1 }
    }
}

impl Jitter {
    /// No jitter; delays are deterministic.
    pub fn none() -> Self {
        Self { factor: 0.0 }
    }

    pub fn new(factor: f64) -> Result<Self, InvalidPolicyError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(InvalidPolicyError::new("jitter", "must be within [0, 1]"));
        }
        Ok(Self { factor })
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        if self.factor == 0.0 {
            return delay;
        }
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        if self.factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rng.random_range((1.0 - self.factor)..=(1.0 + self.factor));
        Duration::try_from_secs_f64(delay.as_secs_f64() * scale)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}
