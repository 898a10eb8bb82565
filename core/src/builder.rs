//! Builder API for ergonomic circuit breaker configuration

use crate::{
    circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitState},
    classifier::FailureClassifier,
    clock::{self, Clock},
    errors::ConfigError,
    interval::IntervalFunction,
    metrics::SlidingWindowType,
};
use std::sync::Arc;
use std::time::Duration;

type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: CircuitBreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Vec<(CircuitState, StateCallback)>,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            clock: None,
            failure_classifier: None,
            callbacks: Vec::new(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Failure percentage (0, 100] at or above which the circuit opens
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Slow-call percentage (0, 100] at or above which the circuit opens
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls slower than this count as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Keep the last `size` calls
    pub fn count_based_window(mut self, size: u32) -> Self {
        self.config.sliding_window_type = SlidingWindowType::CountBased;
        self.config.sliding_window_size = size;
        self
    }

    /// Keep the calls of the last `seconds` seconds
    pub fn time_based_window(mut self, seconds: u32) -> Self {
        self.config.sliding_window_type = SlidingWindowType::TimeBased;
        self.config.sliding_window_size = seconds;
        self
    }

    /// Set minimum number of calls before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: u32) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// Set the number of trial calls admitted while half-open
    pub fn permitted_calls_in_half_open_state(mut self, calls: u32) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Set how long the circuit stays open before a trial call
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Grow the open-state wait with consecutive trips
    ///
    /// Use [`IntervalFunction::exponential_random`] for a jittered wait.
    pub fn wait_interval_in_open_state(mut self, interval: IntervalFunction) -> Self {
        self.config.wait_interval_in_open_state = Some(interval);
        self
    }

    /// Set the time source (tests use [`ManualClock`](crate::ManualClock))
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// Ignored errors are not recorded and give their permission back. Use
    /// this for "expected" errors like validation failures or client errors
    /// (4xx), while still tripping on server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only count slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// assert!(circuit.is_closed());
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition_to(CircuitState::Open, f)
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition_to(CircuitState::Closed, f)
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_transition_to(CircuitState::HalfOpen, f)
    }

    fn on_transition_to<F>(mut self, state: CircuitState, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.push((state, Arc::new(f)));
        self
    }

    /// Build the circuit breaker, validating the configuration
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let clock = self.clock.unwrap_or_else(clock::default_clock);
        let circuit =
            CircuitBreaker::with_parts(self.name, self.config, clock, self.failure_classifier)?;

        for (state, callback) in self.callbacks {
            circuit.event_publisher().on_event(move |event| {
                if let CircuitBreakerEvent::StateTransition { name, to, .. } = event
                    && *to == state
                {
                    callback(name);
                }
            });
        }

        Ok(circuit)
    }
}
