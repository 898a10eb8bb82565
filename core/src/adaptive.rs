//! Adaptive bulkhead
//!
//! A [`SemaphoreBulkhead`] whose limit is steered by the outcomes of the calls
//! it admits. Every completed call is recorded into a sliding window and
//! evaluated against failure and slow-call thresholds; the resulting
//! [`ThresholdVerdict`] is handed to a [`LimitPolicy`] that picks the next
//! concurrency limit.

use crate::{
    bulkhead::{BulkheadConfig, SemaphoreBulkhead},
    clock::{self, Clock},
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interrupt::InterruptToken,
    metrics::{self, MetricsWindow, Outcome, SlidingWindowType, ThresholdVerdict, Thresholds},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Picks the next concurrency limit after each evaluated call
pub trait LimitPolicy: Send + Sync + fmt::Debug {
    /// `current` is the limit in force; the result is clamped to the
    /// configured min/max before it is applied.
    fn next_limit(&self, current: usize, verdict: ThresholdVerdict) -> usize;
}

/// Keeps the limit where it is
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLimit;

impl LimitPolicy for FixedLimit {
    fn next_limit(&self, current: usize, _verdict: ThresholdVerdict) -> usize {
        current
    }
}

/// Adaptive bulkhead configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveBulkheadConfig {
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration_threshold: Duration,
    pub sliding_window_type: SlidingWindowType,
    pub sliding_window_size: u32,
    pub minimum_number_of_calls: u32,
    pub initial_concurrent_calls: usize,
    pub min_concurrent_calls: usize,
    pub max_concurrent_calls: usize,
    pub max_wait_duration: Duration,
}

impl Default for AdaptiveBulkheadConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            initial_concurrent_calls: 25,
            min_concurrent_calls: 2,
            max_concurrent_calls: 200,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl AdaptiveBulkheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds().validate()?;
        if self.sliding_window_size == 0 {
            return Err(ConfigError::invalid(
                "sliding_window_size",
                "must be greater than 0",
            ));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::invalid(
                "minimum_number_of_calls",
                "must be greater than 0",
            ));
        }
        if self.min_concurrent_calls == 0 {
            return Err(ConfigError::invalid(
                "min_concurrent_calls",
                "must be greater than 0",
            ));
        }
        if self.min_concurrent_calls > self.max_concurrent_calls {
            return Err(ConfigError::invalid(
                "min_concurrent_calls",
                format!(
                    "must not exceed max_concurrent_calls ({})",
                    self.max_concurrent_calls
                ),
            ));
        }
        if !(self.min_concurrent_calls..=self.max_concurrent_calls)
            .contains(&self.initial_concurrent_calls)
        {
            return Err(ConfigError::invalid(
                "initial_concurrent_calls",
                format!(
                    "must be within [{}, {}]",
                    self.min_concurrent_calls, self.max_concurrent_calls
                ),
            ));
        }
        Ok(())
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure_rate: self.failure_rate_threshold,
            slow_call_rate: self.slow_call_rate_threshold,
        }
    }
}

/// Events emitted by an adaptive bulkhead
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptiveBulkheadEvent {
    CallPermitted {
        name: String,
    },
    CallRejected {
        name: String,
    },
    CallFinished {
        name: String,
        verdict: ThresholdVerdict,
    },
    LimitChanged {
        name: String,
        from: usize,
        to: usize,
    },
}

/// Read-only metrics view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBulkheadMetrics {
    pub failure_rate: f32,
    pub slow_call_rate: f32,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub max_allowed_concurrent_calls: usize,
    pub available_concurrent_calls: usize,
}

pub struct AdaptiveBulkhead {
    name: String,
    config: AdaptiveBulkheadConfig,
    bulkhead: SemaphoreBulkhead,
    window: Box<dyn MetricsWindow>,
    policy: Arc<dyn LimitPolicy>,
    /// Serializes read-decide-apply of the limit
    adjusting: Mutex<()>,
    clock: Arc<dyn Clock>,
    events: EventPublisher<AdaptiveBulkheadEvent>,
}

impl AdaptiveBulkhead {
    /// Adaptive bulkhead with the [`FixedLimit`] policy
    pub fn new(name: impl Into<String>, config: AdaptiveBulkheadConfig) -> Result<Self, ConfigError> {
        Self::with_policy(name, config, Arc::new(FixedLimit), clock::default_clock())
    }

    pub fn with_policy(
        name: impl Into<String>,
        config: AdaptiveBulkheadConfig,
        policy: Arc<dyn LimitPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let bulkhead = SemaphoreBulkhead::new(
            name.clone(),
            BulkheadConfig {
                max_concurrent_calls: config.initial_concurrent_calls,
                max_wait_duration: config.max_wait_duration,
            },
        )?;
        let window = metrics::new_window(
            config.sliding_window_type,
            config.sliding_window_size,
            config.minimum_number_of_calls,
            Arc::clone(&clock),
        );

        Ok(Self {
            name,
            config,
            bulkhead,
            window,
            policy,
            adjusting: Mutex::new(()),
            clock,
            events: EventPublisher::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AdaptiveBulkheadConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<AdaptiveBulkheadEvent> {
        &self.events
    }

    pub fn max_allowed_concurrent_calls(&self) -> usize {
        self.bulkhead.metrics().max_allowed_concurrent_calls
    }

    pub fn available_concurrent_calls(&self) -> usize {
        self.bulkhead.metrics().available_concurrent_calls
    }

    pub fn try_acquire_permission(&self) -> bool {
        self.acquire_permission().is_ok()
    }

    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        self.admitted(self.bulkhead.acquire_permission())
    }

    pub fn acquire_permission_interruptibly(&self, token: &InterruptToken) -> Result<(), Rejection> {
        self.admitted(self.bulkhead.acquire_permission_interruptibly(token))
    }

    /// Return a permit for a call that was abandoned before running
    pub fn release_permission(&self) {
        self.bulkhead.release_permission();
    }

    /// Record a successful call, return its permit and adjust the limit
    pub fn on_success(&self, elapsed: Duration) -> ThresholdVerdict {
        self.complete(elapsed, false)
    }

    /// Record a failed call, return its permit and adjust the limit
    pub fn on_error(&self, elapsed: Duration) -> ThresholdVerdict {
        self.complete(elapsed, true)
    }

    /// Run `f` while holding a permit and feed its outcome back
    pub fn call<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.acquire_permission()?;
        let mut permit = Permit {
            bulkhead: &self.bulkhead,
            armed: true,
        };
        let start = self.clock.now_nanos();
        let result = f();
        let elapsed = Duration::from_nanos(self.clock.now_nanos().saturating_sub(start));
        permit.armed = false;

        match result {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.on_error(elapsed);
                Err(ResilienceError::Execution(e))
            }
        }
    }

    pub fn metrics(&self) -> AdaptiveBulkheadMetrics {
        let snapshot = self.window.snapshot();
        let bulkhead = self.bulkhead.metrics();
        AdaptiveBulkheadMetrics {
            failure_rate: snapshot.failure_rate(),
            slow_call_rate: snapshot.slow_call_rate(),
            buffered_calls: snapshot.total_number_of_calls(),
            failed_calls: snapshot.number_of_failed_calls(),
            slow_calls: snapshot.number_of_slow_calls(),
            max_allowed_concurrent_calls: bulkhead.max_allowed_concurrent_calls,
            available_concurrent_calls: bulkhead.available_concurrent_calls,
        }
    }

    fn admitted(&self, result: Result<(), Rejection>) -> Result<(), Rejection> {
        match &result {
            Ok(()) => self.events.publish_with(|| AdaptiveBulkheadEvent::CallPermitted {
                name: self.name.clone(),
            }),
            Err(_) => self.events.publish_with(|| AdaptiveBulkheadEvent::CallRejected {
                name: self.name.clone(),
            }),
        }
        result
    }

    fn complete(&self, elapsed: Duration, failed: bool) -> ThresholdVerdict {
        let outcome = Outcome::classify(elapsed, self.config.slow_call_duration_threshold, failed);
        let snapshot = self.window.record(elapsed, outcome);
        let verdict = self.config.thresholds().evaluate(&snapshot);
        self.bulkhead.release_permission();
        self.events.publish_with(|| AdaptiveBulkheadEvent::CallFinished {
            name: self.name.clone(),
            verdict,
        });
        self.adjust(verdict);
        verdict
    }

    fn adjust(&self, verdict: ThresholdVerdict) {
        let (current, next) = {
            let _adjusting = self.adjusting.lock();
            let current = self.max_allowed_concurrent_calls();
            let next = self
                .policy
                .next_limit(current, verdict)
                .clamp(self.config.min_concurrent_calls, self.config.max_concurrent_calls);
            if next == current {
                return;
            }
            let changed = self.bulkhead.change_config(BulkheadConfig {
                max_concurrent_calls: next,
                max_wait_duration: self.config.max_wait_duration,
            });
            if let Err(e) = changed {
                tracing::warn!(name = %self.name, error = %e, "adaptive limit not applied");
                return;
            }
            (current, next)
        };

        tracing::info!(name = %self.name, from = current, to = next, ?verdict, "adaptive limit changed");
        self.events.publish_with(|| AdaptiveBulkheadEvent::LimitChanged {
            name: self.name.clone(),
            from: current,
            to: next,
        });
    }
}

impl fmt::Debug for AdaptiveBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBulkhead")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Releases the permit if the protected call unwinds
struct Permit<'a> {
    bulkhead: &'a SemaphoreBulkhead,
    armed: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bulkhead.release_permission();
        }
    }
}
