//! Event publishing for resilience primitives
//!
//! Each primitive owns an [`EventPublisher`] for its own event type. Building
//! an event is skipped entirely while nobody is subscribed.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Subscriber callback
pub type EventConsumer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Fan-out of events to zero or more subscribers
pub struct EventPublisher<E> {
    consumers: RwLock<Vec<EventConsumer<E>>>,
    has_consumers: AtomicBool,
}

impl<E: fmt::Debug> EventPublisher<E> {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(Vec::new()),
            has_consumers: AtomicBool::new(false),
        }
    }

    /// Subscribe to every event
    pub fn on_event<F>(&self, f: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.consumers.write().push(Arc::new(f));
        self.has_consumers.store(true, Ordering::Release);
    }

    /// Drop every subscriber
    pub fn clear(&self) {
        self.consumers.write().clear();
        self.has_consumers.store(false, Ordering::Release);
    }

    pub fn has_consumers(&self) -> bool {
        self.has_consumers.load(Ordering::Acquire)
    }

    /// Build and publish an event, but only if someone is listening
    pub fn publish_with(&self, make: impl FnOnce() -> E) {
        if !self.has_consumers() {
            return;
        }
        self.publish(&make());
    }

    /// Publish an already-built event
    pub fn publish(&self, event: &E) {
        let consumers: Vec<EventConsumer<E>> = self.consumers.read().clone();
        for consumer in consumers {
            if catch_unwind(AssertUnwindSafe(|| consumer(event))).is_err() {
                tracing::warn!(?event, "event consumer panicked");
            }
        }
        tracing::debug!(?event, "event published");
    }
}

impl<E: fmt::Debug> Default for EventPublisher<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventPublisher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("consumers", &self.consumers.read().len())
            .finish()
    }
}
