//! Circuit breaker guarding calls to a single downstream service.
//!
//! State machine: `Closed -> Open` after `failure_threshold` consecutive failures,
//! `Open -> HalfOpen` once `open_timeout` has elapsed (evaluated lazily when a call arrives; no
//! background timer), `HalfOpen -> Closed` after `success_threshold` consecutive successful
//! trial calls, and `HalfOpen -> Open` on any failed trial call.
//!
//! All counters live behind one short critical section, so concurrent callers can never both act
//! on a pre-transition count. Every transition bumps a generation number; outcomes of calls that
//! were admitted under an older generation are discarded. Events are published after the lock is
//! released.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::emitter::EventEmitter;
use crate::error::{CircuitOpenError, InvalidPolicyError, ResilienceError};
use crate::events::{EventKind, ResilienceEvent};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Trial mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation. `half_open_max_calls` defaults to 1.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        open_timeout: Duration,
    ) -> Result<Self, InvalidPolicyError> {
        let cfg = Self { failure_threshold, success_threshold, open_timeout, half_open_max_calls: 1 };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the number of concurrent half-open trial calls; must be > 0.
    pub fn with_half_open_max_calls(mut self, limit: u32) -> Result<Self, InvalidPolicyError> {
        self.half_open_max_calls = limit;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), InvalidPolicyError> {
        if self.failure_threshold == 0 {
            return Err(InvalidPolicyError::new("failure_threshold", "must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(InvalidPolicyError::new("success_threshold", "must be > 0"));
        }
        if self.open_timeout.is_zero() {
            return Err(InvalidPolicyError::new("open_timeout_ms", "must be > 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(InvalidPolicyError::new("half_open_max_calls", "must be > 0"));
        }
        Ok(())
    }

    /// Consecutive failures before opening from Closed.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Consecutive half-open successes before closing.
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    /// Duration to stay Open before admitting trial calls.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Maximum concurrent calls while Half-Open.
    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }
}

/// Point-in-time view of a breaker, for admin endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    pub last_transition_millis: u64,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failure_count: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    last_transition_millis: u64,
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
    failure_count: u32,
}

impl BreakerCore {
    fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            last_transition_millis: now,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: u64) -> Transition {
        let from = self.state;
        self.state = to;
        self.generation = self.generation.wrapping_add(1);
        self.last_transition_millis = now;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        Transition { from, to, failure_count: self.failure_count }
    }

    fn on_success(&mut self, config: &CircuitBreakerConfig, now: u64) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                (self.consecutive_successes >= config.success_threshold)
                    .then(|| self.transition(CircuitState::Closed, now))
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&mut self, config: &CircuitBreakerConfig, now: u64) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                (self.failure_count >= config.failure_threshold)
                    .then(|| self.transition(CircuitState::Open, now))
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                Some(self.transition(CircuitState::Open, now))
            }
            CircuitState::Open => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Releases a half-open trial slot on every exit path, including panics and dropped futures.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut core = self.breaker.lock();
            if core.generation == self.generation && core.half_open_in_flight > 0 {
                core.half_open_in_flight -= 1;
            }
        }
    }
}

/// Circuit breaker guarding an async operation.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    service: Arc<str>,
    config: CircuitBreakerConfig,
    core: Arc<Mutex<BreakerCore>>,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
}

impl CircuitBreaker {
    /// # Examples
    /// ```
    /// use meshguard::{CircuitBreaker, CircuitBreakerConfig};
    /// use std::time::Duration;
    /// let config = CircuitBreakerConfig::new(5, 2, Duration::from_secs(30)).unwrap();
    /// let breaker = CircuitBreaker::new("payments", config);
    /// assert_eq!(breaker.service(), "payments");
    /// ```
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        let core = BreakerCore::new(clock.now_millis());
        Self {
            service: Arc::from(service.into()),
            config,
            core: Arc::new(Mutex::new(core)),
            clock,
            emitter: EventEmitter::noop(),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self.lock().last_transition_millis = self.clock.now_millis();
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Executes the provided async operation under circuit breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` without invoking `operation` while the circuit is
    /// open or the half-open trial limit is reached. Errors from `operation` are returned as-is
    /// and count as failures.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let admission = self.admit()?;
        let mut guard =
            TrialGuard { breaker: self, generation: admission.generation, armed: admission.trial };

        let result = operation().await;

        guard.armed = false;
        self.complete(admission, result.is_ok());
        result
    }

    /// Report a success observed outside `execute`.
    pub fn record_success(&self) {
        let transition = {
            let mut core = self.lock();
            core.on_success(&self.config, self.clock.now_millis())
        };
        self.announce(transition);
    }

    /// Report a failure observed outside `execute`.
    pub fn record_failure(&self) {
        let transition = {
            let mut core = self.lock();
            core.on_failure(&self.config, self.clock.now_millis())
        };
        self.announce(transition);
    }

    /// Force `Closed` with all counters cleared.
    pub fn reset(&self) {
        let transition = {
            let mut core = self.lock();
            let was = core.state;
            let t = core.transition(CircuitState::Closed, self.clock.now_millis());
            (was != CircuitState::Closed).then_some(t)
        };
        tracing::info!(service = %self.service, "circuit breaker reset");
        self.announce(transition);
    }

    /// Stored state. Does not perform the lazy Open -> HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let core = self.lock();
        CircuitBreakerSnapshot {
            service: self.service.to_string(),
            state: core.state,
            failure_count: core.failure_count,
            consecutive_successes: core.consecutive_successes,
            half_open_in_flight: core.half_open_in_flight,
            last_transition_millis: core.last_transition_millis,
        }
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let now = self.clock.now_millis();
        let mut half_opened = None;
        let admission = {
            let mut core = self.lock();
            if core.state == CircuitState::Open {
                let elapsed = now.saturating_sub(core.last_transition_millis);
                let timeout = duration_millis(self.config.open_timeout);
                if elapsed < timeout {
                    return Err(self.open_error(
                        "circuit is open",
                        Duration::from_millis(timeout - elapsed),
                    ));
                }
                half_opened = Some(core.transition(CircuitState::HalfOpen, now));
            }
            match core.state {
                CircuitState::HalfOpen => {
                    if core.half_open_in_flight >= self.config.half_open_max_calls {
                        None
                    } else {
                        core.half_open_in_flight += 1;
                        tracing::debug!(
                            service = %self.service,
                            in_flight = core.half_open_in_flight,
                            max = self.config.half_open_max_calls,
                            "circuit breaker: half-open trial call admitted"
                        );
                        Some(Admission { generation: core.generation, trial: true })
                    }
                }
                _ => Some(Admission { generation: core.generation, trial: false }),
            }
        };
        self.announce(half_opened);
        admission.ok_or_else(|| self.open_error("half-open trial limit reached", Duration::ZERO))
    }

    fn complete(&self, admission: Admission, success: bool) {
        let transition = {
            let mut core = self.lock();
            if core.generation != admission.generation {
                // Admitted before the last transition; the outcome no longer applies.
                return;
            }
            if admission.trial && core.half_open_in_flight > 0 {
                core.half_open_in_flight -= 1;
            }
            let now = self.clock.now_millis();
            if success {
                core.on_success(&self.config, now)
            } else {
                core.on_failure(&self.config, now)
            }
        };
        self.announce(transition);
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some(Transition { from, to, failure_count }) = transition else {
            return;
        };
        let kind = match to {
            CircuitState::Open => {
                if from == CircuitState::HalfOpen {
                    tracing::warn!(service = %self.service, failures = failure_count, "circuit breaker: trial call failed → open");
                } else {
                    tracing::error!(
                        service = %self.service,
                        failures = failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
                EventKind::CircuitOpened
            }
            CircuitState::HalfOpen => {
                tracing::info!(service = %self.service, "circuit breaker → half-open");
                EventKind::CircuitHalfOpen
            }
            CircuitState::Closed => {
                tracing::info!(service = %self.service, "circuit breaker → closed");
                EventKind::CircuitClosed
            }
        };
        self.emitter.emit(
            ResilienceEvent::new(kind, self.service.as_ref())
                .with_meta("key", self.service.as_ref())
                .with_meta("state", to)
                .with_meta("previous_state", from)
                .with_meta("failure_count", failure_count),
        );
    }

    fn open_error(&self, message: &str, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            service: self.service.to_string(),
            message: message.to_string(),
            retry_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
