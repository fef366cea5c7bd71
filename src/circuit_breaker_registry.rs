//! Registry of circuit breakers keyed by target service.
//!
//! Owned by the composition root and passed by reference; there is no process-wide singleton.
//! Entries live until `remove` is called or the registry is dropped.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot};
use crate::clock::{Clock, MonotonicClock};
use crate::emitter::EventEmitter;
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no circuit breaker registered for '{service}'")]
    NotFound { service: String },
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// `defaults` is used for breakers created through [`get_or_create`](Self::get_or_create).
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            defaults,
            clock: Arc::new(MonotonicClock::default()),
            emitter: EventEmitter::noop(),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Fetch the breaker for `service`, creating it with the registry defaults on first use.
    /// Concurrent first callers all receive the same instance.
    pub fn get_or_create(&self, service: &str) -> CircuitBreaker {
        if let Some(existing) = self.read().get(service) {
            return existing.clone();
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(service.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(service, self.defaults.clone())
                    .with_shared_clock(self.clock.clone())
                    .with_emitter(self.emitter.clone())
            })
            .clone()
    }

    /// Register a breaker under its service name, replacing any existing entry.
    pub fn register(&self, breaker: CircuitBreaker) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let service = breaker.service().to_string();
        if map.contains_key(&service) {
            warn!(service = %service, "circuit breaker replaced; last registration wins");
        }
        map.insert(service, breaker);
    }

    pub fn get(&self, service: &str) -> Option<CircuitBreaker> {
        self.read().get(service).cloned()
    }

    /// Reset a breaker by name, erroring if missing.
    pub fn reset(&self, service: &str) -> Result<(), RegistryError> {
        match self.read().get(service) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { service: service.to_string() }),
        }
    }

    pub fn remove(&self, service: &str) -> Option<CircuitBreaker> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner).remove(service)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot breaker states sorted by service.
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut entries: Vec<_> = self.read().values().map(CircuitBreaker::snapshot).collect();
        entries.sort_by(|a, b| a.service.cmp(&b.service));
        entries
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CircuitBreaker>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}
