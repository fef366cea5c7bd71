#![allow(dead_code)]

use meshguard::{HasStatusCode, MemorySink};
use std::time::Duration;

/// Downstream failure carrying an HTTP-style status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream(pub u16);

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream returned {}", self.0)
    }
}

impl std::error::Error for Upstream {}

impl HasStatusCode for Upstream {
    fn status_code(&self) -> Option<u16> {
        Some(self.0)
    }
}

/// Poll until `sink` holds at least `n` events; panics after two seconds.
pub async fn wait_for_events(sink: &MemorySink, n: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while sink.len() < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {n} events, got {}", sink.len()));
}
