//! Structured events emitted by every guard.
//!
//! Events flow through the [`EventEmitter`](crate::emitter::EventEmitter) to handlers that log,
//! aggregate, or forward them. Each event carries enough metadata (`key`, `state`, `allowed`,
//! `remaining`, `retry_after_ms`, ...) to drive a dashboard without further lookups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::clock::wall_clock_millis;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
    RateLimitHit,
    BulkheadRejected,
    Timeout,
    RetryAttempt,
    RetryExhausted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CircuitOpened => "circuit_opened",
            EventKind::CircuitClosed => "circuit_closed",
            EventKind::CircuitHalfOpen => "circuit_half_open",
            EventKind::RateLimitHit => "rate_limit_hit",
            EventKind::BulkheadRejected => "bulkhead_rejected",
            EventKind::Timeout => "timeout",
            EventKind::RetryAttempt => "retry_attempt",
            EventKind::RetryExhausted => "retry_exhausted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single resilience event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceEvent {
    pub id: Uuid,
    pub kind: EventKind,
    /// Target service the emitting guard protects.
    pub service: String,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ResilienceEvent {
    pub fn new(kind: EventKind, service: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            service: service.into(),
            timestamp: wall_clock_millis(),
            correlation_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    pub fn with_correlation_id(mut self, id: Option<&str>) -> Self {
        self.correlation_id = id.map(str::to_owned);
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.service)?;
        for (k, v) in &self.metadata {
            write!(f, " {k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_kind_service_and_metadata() {
        let event = ResilienceEvent::new(EventKind::RateLimitHit, "search")
            .with_meta("key", "tenant-a")
            .with_meta("allowed", false);
        let rendered = event.to_string();
        assert!(rendered.starts_with("rate_limit_hit[search]"));
        assert!(rendered.contains("allowed=false"));
        assert!(rendered.contains("key=tenant-a"));
    }

    #[test]
    fn ids_are_unique() {
        let a = ResilienceEvent::new(EventKind::CircuitOpened, "svc");
        let b = ResilienceEvent::new(EventKind::CircuitOpened, "svc");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn json_uses_snake_case_kinds() {
        let event = ResilienceEvent::new(EventKind::CircuitHalfOpen, "ledger")
            .with_correlation_id(Some("req-1"))
            .with_meta("state", "half_open");
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["kind"], "circuit_half_open");
        assert_eq!(v["service"], "ledger");
        assert_eq!(v["correlation_id"], "req-1");
        assert_eq!(v["metadata"]["state"], "half_open");
        let back: ResilienceEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, event);
    }
}
