//! Bulkhead implementation for concurrency limiting
//!
//! A semaphore-style pool of admission permits. Callers may wait a bounded
//! time for a permit; the pool size can change at runtime without evicting
//! callers that already hold a permit.

use crate::{
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interrupt::InterruptToken,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum number of permits held at once
    pub max_concurrent_calls: usize,
    /// How long a caller waits for a permit; zero never blocks
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::invalid(
                "max_concurrent_calls",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Events emitted by a bulkhead
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadEvent {
    CallPermitted { name: String },
    CallRejected { name: String },
    CallFinished { name: String },
}

/// Read-only metrics view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
}

#[derive(Debug)]
struct Permits {
    max: usize,
    in_use: usize,
    max_wait: Duration,
}

impl Permits {
    fn try_take(&mut self) -> bool {
        if self.in_use < self.max {
            self.in_use += 1;
            true
        } else {
            false
        }
    }
}

/// State shared with interrupt wake hooks
#[derive(Debug)]
struct Shared {
    permits: Mutex<Permits>,
    cond: Condvar,
}

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Bulkheading prevents thread pool exhaustion by rejecting requests
/// when a maximum concurrency limit is reached.
pub struct SemaphoreBulkhead {
    name: String,
    shared: Arc<Shared>,
    reconfig: Mutex<()>,
    events: EventPublisher<BulkheadEvent>,
}

impl SemaphoreBulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            shared: Arc::new(Shared {
                permits: Mutex::new(Permits {
                    max: config.max_concurrent_calls,
                    in_use: 0,
                    max_wait: config.max_wait_duration,
                }),
                cond: Condvar::new(),
            }),
            reconfig: Mutex::new(()),
            events: EventPublisher::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_publisher(&self) -> &EventPublisher<BulkheadEvent> {
        &self.events
    }

    pub fn config(&self) -> BulkheadConfig {
        let permits = self.shared.permits.lock();
        BulkheadConfig {
            max_concurrent_calls: permits.max,
            max_wait_duration: permits.max_wait,
        }
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        let permits = self.shared.permits.lock();
        BulkheadMetrics {
            available_concurrent_calls: permits.max.saturating_sub(permits.in_use),
            max_allowed_concurrent_calls: permits.max,
        }
    }

    /// Try to take a permit, waiting at most the configured max wait
    pub fn try_acquire_permission(&self) -> bool {
        self.acquire_permission().is_ok()
    }

    /// Take a permit, waiting at most the configured max wait
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        let wait = self.shared.permits.lock().max_wait;
        self.acquire(wait, None)
    }

    /// Take a permit, waiting at most the configured max wait unless `token`
    /// is interrupted first
    pub fn acquire_permission_interruptibly(&self, token: &InterruptToken) -> Result<(), Rejection> {
        let wait = self.shared.permits.lock().max_wait;
        self.acquire(wait, Some(token))
    }

    /// Take a permit, waiting at most `wait` unless `token` is interrupted
    ///
    /// A zero `wait` never blocks.
    pub fn try_acquire_with(&self, wait: Duration, token: &InterruptToken) -> Result<(), Rejection> {
        self.acquire(wait, Some(token))
    }

    /// Return a permit after a completed call
    pub fn on_complete(&self) {
        self.release_permission();
        self.events.publish_with(|| BulkheadEvent::CallFinished {
            name: self.name.clone(),
        });
    }

    /// Return a permit for a call that was abandoned before running
    pub fn release_permission(&self) {
        let mut permits = self.shared.permits.lock();
        permits.in_use = permits.in_use.saturating_sub(1);
        self.shared.cond.notify_one();
    }

    /// Take a permit and hold it until the guard is dropped
    pub fn enter(&self) -> Result<BulkheadGuard<'_>, Rejection> {
        self.acquire_permission()?;
        Ok(BulkheadGuard { bulkhead: self })
    }

    /// Run `f` while holding a permit
    pub fn call<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let _guard = self.enter()?;
        f().map_err(ResilienceError::Execution)
    }

    /// Swap the pool size and wait duration
    ///
    /// Growing the pool wakes blocked callers. Shrinking it never evicts
    /// holders; new acquisitions are refused until enough permits return.
    pub fn change_config(&self, config: BulkheadConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let _reconfig = self.reconfig.lock();
        let previous = {
            let mut permits = self.shared.permits.lock();
            let previous = permits.max;
            permits.max = config.max_concurrent_calls;
            permits.max_wait = config.max_wait_duration;
            if permits.max > previous {
                self.shared.cond.notify_all();
            }
            previous
        };
        tracing::info!(
            name = %self.name,
            from = previous,
            to = config.max_concurrent_calls,
            "bulkhead reconfigured"
        );
        Ok(())
    }

    fn acquire(&self, wait: Duration, token: Option<&InterruptToken>) -> Result<(), Rejection> {
        let result = self.wait_for_permit(wait, token);
        match &result {
            Ok(()) => self.events.publish_with(|| BulkheadEvent::CallPermitted {
                name: self.name.clone(),
            }),
            Err(_) => self.events.publish_with(|| BulkheadEvent::CallRejected {
                name: self.name.clone(),
            }),
        }
        result
    }

    fn wait_for_permit(&self, wait: Duration, token: Option<&InterruptToken>) -> Result<(), Rejection> {
        {
            let mut permits = self.shared.permits.lock();
            if permits.try_take() {
                return Ok(());
            }
            if wait.is_zero() {
                return Err(self.full(permits.max));
            }
        }

        // wake this waiter when the token is interrupted
        let _hook = token.map(|token| {
            let shared = Arc::clone(&self.shared);
            token.register(Arc::new(move || {
                let _permits = shared.permits.lock();
                shared.cond.notify_all();
            }))
        });

        let deadline = Instant::now().checked_add(wait);
        let mut permits = self.shared.permits.lock();
        loop {
            if token.is_some_and(InterruptToken::is_interrupted) {
                // pass on a release notification this waiter may have consumed
                if permits.in_use < permits.max {
                    self.shared.cond.notify_one();
                }
                return Err(Rejection::Interrupted {
                    name: self.name.clone(),
                });
            }
            if permits.try_take() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.full(permits.max));
                    }
                    self.shared.cond.wait_for(&mut permits, deadline - now);
                }
                None => self.shared.cond.wait(&mut permits),
            }
        }
    }

    fn full(&self, max_concurrent_calls: usize) -> Rejection {
        Rejection::BulkheadFull {
            name: self.name.clone(),
            max_concurrent_calls,
        }
    }
}

impl fmt::Debug for SemaphoreBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreBulkhead")
            .field("name", &self.name)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics.
#[derive(Debug)]
pub struct BulkheadGuard<'a> {
    bulkhead: &'a SemaphoreBulkhead,
}

impl Drop for BulkheadGuard<'_> {
    fn drop(&mut self) {
        self.bulkhead.on_complete();
    }
}
