//! Fire-and-forget event publication.
//!
//! `emit` never blocks: the event is pushed into a bounded queue with `try_send` and dropped
//! (and counted) when the queue is full. A dispatcher task fans each event out to one bounded
//! queue per handler; every handler runs on its own worker task, so a slow or failing handler
//! only ever affects itself. Delivery to a single handler preserves publish order.
//!
//! Handlers are `tower::Service<ResilienceEvent>`. Errors and panics raised by a handler are
//! captured at the call boundary, logged, and counted in [`EmitterStats::handler_failures`].

mod sinks;

pub use sinks::{LogSink, MemorySink};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use crate::events::ResilienceEvent;

/// Default bound for the publish queue and for each handler queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitterStats {
    /// Events accepted into the publish queue.
    pub published: u64,
    /// Events discarded because the publish queue or a handler queue was full.
    pub dropped: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> EmitterStats {
        EmitterStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

struct HandlerQueue {
    name: String,
    tx: mpsc::Sender<ResilienceEvent>,
}

struct Shared {
    tx: Option<mpsc::Sender<ResilienceEvent>>,
    handlers: Arc<RwLock<Vec<HandlerQueue>>>,
    counters: Arc<Counters>,
    handler_capacity: usize,
}

/// Cheaply clonable handle; all clones publish into the same queue.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("handlers", &self.handler_count())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::noop()
    }
}

impl EventEmitter {
    /// Emitter with the default queue bounds. Spawns its dispatcher on the current Tokio runtime.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }

    /// Outside a Tokio runtime this degrades to [`EventEmitter::noop`] and every emit counts
    /// as dropped.
    pub fn with_capacity(queue_capacity: usize, handler_capacity: usize) -> Self {
        let handlers: Arc<RwLock<Vec<HandlerQueue>>> = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("event emitter created outside a tokio runtime; events will be dropped");
            return Self {
                shared: Arc::new(Shared {
                    tx: None,
                    handlers,
                    counters,
                    handler_capacity: handler_capacity.max(1),
                }),
            };
        };

        let (tx, mut rx) = mpsc::channel::<ResilienceEvent>(queue_capacity.max(1));
        let dispatch_handlers = handlers.clone();
        let dispatch_counters = counters.clone();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let queues = dispatch_handlers.read().unwrap_or_else(PoisonError::into_inner);
                for handler in queues.iter() {
                    if handler.tx.try_send(event.clone()).is_err() {
                        dispatch_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(handler = %handler.name, kind = %event.kind, "handler queue full; event dropped");
                    }
                }
            }
        });

        Self {
            shared: Arc::new(Shared {
                tx: Some(tx),
                handlers,
                counters,
                handler_capacity: handler_capacity.max(1),
            }),
        }
    }

    /// Emitter that discards everything. Usable without a runtime.
    pub fn noop() -> Self {
        Self {
            shared: Arc::new(Shared {
                tx: None,
                handlers: Arc::new(RwLock::new(Vec::new())),
                counters: Arc::new(Counters::default()),
                handler_capacity: 1,
            }),
        }
    }

    /// Publish without blocking. Returns `false` when the event was dropped.
    pub fn emit(&self, event: ResilienceEvent) -> bool {
        let Some(tx) = &self.shared.tx else {
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(kind = %err.into_inner().kind, "event queue full; event dropped");
                false
            }
        }
    }

    /// Register a handler for the lifetime of the emitter.
    ///
    /// The handler gets its own worker task and bounded queue. Returns `false` when the emitter
    /// is a no-op and the handler was not registered.
    pub fn subscribe<S>(&self, name: impl Into<String>, mut handler: S) -> bool
    where
        S: Service<ResilienceEvent, Response = ()> + Send + 'static,
        S::Error: fmt::Display + Send,
        S::Future: Send,
    {
        let name = name.into();
        if self.shared.tx.is_none() {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(handler = %name, "subscribe called outside a tokio runtime; handler ignored");
            return false;
        };

        let (tx, mut rx) = mpsc::channel::<ResilienceEvent>(self.shared.handler_capacity);
        let counters = self.shared.counters.clone();
        let worker_name = name.clone();
        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let call = async {
                    let ready = handler.ready().await?;
                    ready.call(event).await
                };
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(())) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(handler = %worker_name, error = %err, "event handler failed");
                    }
                    Err(_) => {
                        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(handler = %worker_name, "event handler panicked");
                    }
                }
            }
        });

        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HandlerQueue { name, tx });
        true
    }

    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> EmitterStats {
        self.shared.counters.snapshot()
    }
}
