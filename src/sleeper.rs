//! Where retry backoff actually waits.
//!
//! [`RetryPolicy`](crate::retry::RetryPolicy) never calls `tokio::time::sleep` directly; it asks
//! its [`Sleeper`]. The retry loop races every sleep against the caller's
//! [`CallContext`](crate::context::CallContext), so a sleeper only has to wait.
//!
//! [`TrackingSleeper`] can drive a [`ManualClock`]: each recorded wait moves simulated time
//! forward by the same amount, which lets a test watch a breaker's open timeout run out while
//! a retry policy backs off.

use futures::future::{self, BoxFuture, FutureExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::ManualClock;

pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Real waits on the Tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return future::ready(()).boxed();
        }
        tokio::time::sleep(duration).boxed()
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
        future::ready(()).boxed()
    }
}

/// Records every requested wait without waiting. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    waits: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance `clock` by each recorded wait.
    pub fn driving(clock: ManualClock) -> Self {
        Self { waits: Arc::default(), clock: Some(clock) }
    }

    /// Requested waits, in call order.
    pub fn calls(&self) -> Vec<Duration> {
        self.waits().clone()
    }

    pub fn total(&self) -> Duration {
        self.waits().iter().sum()
    }

    pub fn clear(&self) {
        self.waits().clear();
    }

    fn waits(&self) -> MutexGuard<'_, Vec<Duration>> {
        self.waits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.waits().push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        future::ready(()).boxed()
    }
}
