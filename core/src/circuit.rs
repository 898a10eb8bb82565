//! Circuit breaker implementation using state machines
//!
//! Closed → Open → HalfOpen → Closed is driven automatically by the failure
//! and slow-call rates of a sliding window. Disabled and ForcedOpen are only
//! entered and left through manual transitions, which are extra edges of the
//! same machine and may fire from any state.

use crate::{
    builder::CircuitBuilder,
    classifier::{self, FailureClassifier, FailureContext},
    clock::{self, Clock},
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interval::IntervalFunction,
    metrics::{
        self, CountWindow, MetricsWindow, Outcome, SlidingWindowType, Snapshot,
        ThresholdVerdict, Thresholds,
    },
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failure percentage (0, 100] at or above which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow-call percentage (0, 100] at or above which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls taking longer than this are recorded as slow
    pub slow_call_duration_threshold: Duration,

    /// Shape of the window used while Closed
    pub sliding_window_type: SlidingWindowType,

    /// Calls (count-based) or seconds (time-based) kept in the Closed window
    pub sliding_window_size: u32,

    /// Calls required before rates are evaluated
    pub minimum_number_of_calls: u32,

    /// Trial calls admitted while HalfOpen
    pub permitted_number_of_calls_in_half_open_state: u32,

    /// Wait before Open allows a trial call
    pub wait_duration_in_open_state: Duration,

    /// Optional backoff for the open-state wait, keyed on consecutive trips.
    /// When unset, `wait_duration_in_open_state` is used for every trip.
    pub wait_interval_in_open_state: Option<IntervalFunction>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: SlidingWindowType::CountBased,
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            permitted_number_of_calls_in_half_open_state: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            wait_interval_in_open_state: None,
        }
    }
}

impl CircuitBreakerConfig {
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
        if self.permitted_number_of_calls_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "permitted_number_of_calls_in_half_open_state",
                "must be greater than 0",
            ));
        }
        if self.wait_duration_in_open_state < Duration::from_millis(1) {
            return Err(ConfigError::invalid(
                "wait_duration_in_open_state",
                "must be at least 1ms",
            ));
        }
        if let Some(interval) = &self.wait_interval_in_open_state {
            interval.validate()?;
        }
        Ok(())
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure_rate: self.failure_rate_threshold,
            slow_call_rate: self.slow_call_rate_threshold,
        }
    }

    fn open_wait(&self, consecutive_opens: u32) -> Duration {
        self.wait_interval_in_open_state
            .map(|f| f.interval(consecutive_opens))
            .unwrap_or(self.wait_duration_in_open_state)
    }
}

/// Public view of the machine's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
    Disabled,
    ForcedOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Closed" => CircuitState::Closed,
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "Disabled" => CircuitState::Disabled,
            "ForcedOpen" => CircuitState::ForcedOpen,
            other => unreachable!("circuit machine has no state named {other}"),
        }
    }

    /// Whether outcomes are recorded into a window in this state
    pub fn records_metrics(self) -> bool {
        matches!(self, CircuitState::Closed | CircuitState::HalfOpen)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
        };
        f.write_str(s)
    }
}

/// Events emitted by a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    CallPermitted {
        name: String,
    },
    Success {
        name: String,
        elapsed: Duration,
    },
    Error {
        name: String,
        elapsed: Duration,
    },
    IgnoredError {
        name: String,
        elapsed: Duration,
    },
    NotPermitted {
        name: String,
    },
    StateTransition {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    Reset {
        name: String,
    },
    FailureRateExceeded {
        name: String,
        failure_rate: f32,
    },
    SlowCallRateExceeded {
        name: String,
        slow_call_rate: f32,
    },
}

/// Read-only metrics view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Failure percentage, -1.0 below the minimum number of calls
    pub failure_rate: f32,
    /// Slow-call percentage, -1.0 below the minimum number of calls
    pub slow_call_rate: f32,
    pub buffered_calls: u32,
    pub failed_calls: u32,
    pub successful_calls: u32,
    pub slow_calls: u32,
    pub slow_successful_calls: u32,
    pub slow_failed_calls: u32,
    pub not_permitted_calls: u64,
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub clock: Arc<dyn Clock>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            clock: clock::default_clock(),
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at_nanos: u64,
    pub wait_nanos: u64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub permitted_calls_remaining: u32,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        Disabled,
        ForcedOpen,
    ],
    events {
        trip {
            transition: { from: [Closed, HalfOpen, Disabled, ForcedOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        probe {
            transition: { from: [Closed, Open, Disabled, ForcedOpen], to: HalfOpen }
        }
        close {
            transition: { from: [Open, HalfOpen, Disabled, ForcedOpen], to: Closed }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
        }
    }
}

impl Circuit<Open> {
    /// Check if the wait recorded for this trip has elapsed
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .map(|data| ctx.clock.now_nanos().saturating_sub(data.opened_at_nanos) >= data.wait_nanos)
            .unwrap_or(true)
    }
}

struct Inner {
    machine: DynamicCircuit,
    window: Box<dyn MetricsWindow>,
    consecutive_opens: u32,
}

impl Inner {
    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }
}

/// Circuit breaker public API
///
/// All methods take `&self`; share the breaker between threads with `Arc`.
pub struct CircuitBreaker {
    context: CircuitContext,
    config: CircuitBreakerConfig,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    inner: Mutex<Inner>,
    not_permitted_calls: AtomicU64,
    events: EventPublisher<CircuitBreakerEvent>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker (use builder() for more options)
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_parts(name.into(), config, clock::default_clock(), None)
    }

    /// Create a circuit breaker with every collaborator supplied (used by builder)
    pub(crate) fn with_parts(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let context = CircuitContext { name, clock };
        let window = closed_window(&config, &context);
        let machine = DynamicCircuit::new(context.clone());

        Ok(Self {
            context,
            config,
            failure_classifier,
            inner: Mutex::new(Inner {
                machine,
                window,
                consecutive_opens: 0,
            }),
            not_permitted_calls: AtomicU64::new(0),
            events: EventPublisher::new(),
        })
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> CircuitBuilder {
        CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.events
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Ask for permission to run one call
    ///
    /// An Open circuit whose wait has elapsed moves to HalfOpen here and the
    /// call counts as one of the trial calls.
    pub fn try_acquire_permission(&self) -> Result<(), Rejection> {
        let mut pending = Vec::new();
        let decision = {
            let mut inner = self.inner.lock();
            if inner.state() == CircuitState::Open
                && inner.machine.handle(CircuitEvent::AttemptReset).is_ok()
            {
                self.enter(&mut inner, CircuitState::HalfOpen);
                pending.push(self.transition_event(CircuitState::Open, CircuitState::HalfOpen));
            }

            let state = inner.state();
            match state {
                CircuitState::Closed | CircuitState::Disabled => Ok(()),
                CircuitState::HalfOpen => match inner.machine.half_open_data_mut() {
                    Some(data) if data.permitted_calls_remaining > 0 => {
                        data.permitted_calls_remaining -= 1;
                        Ok(())
                    }
                    _ => Err(state),
                },
                CircuitState::Open | CircuitState::ForcedOpen => Err(state),
            }
        };
        self.publish(pending);

        if decision.is_ok() {
            self.events.publish_with(|| CircuitBreakerEvent::CallPermitted {
                name: self.context.name.clone(),
            });
        }
        decision.map_err(|state| {
            self.not_permitted_calls.fetch_add(1, Ordering::Relaxed);
            self.events.publish_with(|| CircuitBreakerEvent::NotPermitted {
                name: self.context.name.clone(),
            });
            Rejection::CallNotPermitted {
                name: self.context.name.clone(),
                state,
            }
        })
    }

    /// Same as [`try_acquire_permission`](Self::try_acquire_permission)
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        self.try_acquire_permission()
    }

    /// Give back a permission for a call that will report no outcome
    pub fn release_permission(&self) {
        let mut inner = self.inner.lock();
        let permitted = self.config.permitted_number_of_calls_in_half_open_state;
        if let Some(data) = inner.machine.half_open_data_mut()
            && data.permitted_calls_remaining < permitted
        {
            data.permitted_calls_remaining += 1;
        }
    }

    /// Record a successful call that took `elapsed`
    pub fn on_success(&self, elapsed: Duration) {
        self.events.publish_with(|| CircuitBreakerEvent::Success {
            name: self.context.name.clone(),
            elapsed,
        });
        self.record(elapsed, false);
    }

    /// Record a failed call; ignored errors only hand back the permission
    pub fn on_error<E: 'static>(&self, elapsed: Duration, error: &E) {
        let ctx = FailureContext {
            name: &self.context.name,
            error: error as &dyn std::any::Any,
            duration: elapsed,
            attempt: 1,
        };
        if !classifier::classify(self.failure_classifier.as_ref(), &ctx) {
            self.release_permission();
            self.events.publish_with(|| CircuitBreakerEvent::IgnoredError {
                name: self.context.name.clone(),
                elapsed,
            });
            return;
        }

        self.events.publish_with(|| CircuitBreakerEvent::Error {
            name: self.context.name.clone(),
            elapsed,
        });
        self.record(elapsed, true);
    }

    /// Execute a fallible operation with circuit breaker protection
    pub fn call<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
        E: 'static,
    {
        self.try_acquire_permission()?;
        let start = self.context.clock.now_nanos();
        let result = f();
        let elapsed = self.elapsed_since(start);
        self.complete(elapsed, result)
    }

    /// Await a fallible future with circuit breaker protection
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        self.try_acquire_permission()?;
        let start = self.context.clock.now_nanos();
        let result = fut.await;
        let elapsed = self.elapsed_since(start);
        self.complete(elapsed, result)
    }

    pub fn transition_to_closed_state(&self) {
        self.manual_transition(CircuitState::Closed);
    }

    pub fn transition_to_open_state(&self) {
        self.manual_transition(CircuitState::Open);
    }

    pub fn transition_to_half_open_state(&self) {
        self.manual_transition(CircuitState::HalfOpen);
    }

    pub fn transition_to_disabled_state(&self) {
        self.manual_transition(CircuitState::Disabled);
    }

    pub fn transition_to_forced_open_state(&self) {
        self.manual_transition(CircuitState::ForcedOpen);
    }

    /// Return to Closed with an empty window
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state();
            // Recreate machine in Closed state
            inner.machine = DynamicCircuit::new(self.context.clone());
            self.enter(&mut inner, CircuitState::Closed);
            previous
        };
        if previous != CircuitState::Closed {
            self.publish(vec![self.transition_event(previous, CircuitState::Closed)]);
        }
        tracing::info!(name = %self.context.name, "circuit breaker reset");
        self.events.publish_with(|| CircuitBreakerEvent::Reset {
            name: self.context.name.clone(),
        });
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, snapshot) = {
            let inner = self.inner.lock();
            (inner.state(), inner.window.snapshot())
        };
        metrics_view(state, &snapshot, self.not_permitted_calls.load(Ordering::Relaxed))
    }

    fn complete<T, E: 'static>(
        &self,
        elapsed: Duration,
        result: Result<T, E>,
    ) -> Result<T, ResilienceError<E>> {
        match result {
            Ok(value) => {
                self.on_success(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.on_error(elapsed, &e);
                Err(ResilienceError::Execution(e))
            }
        }
    }

    fn elapsed_since(&self, start_nanos: u64) -> Duration {
        Duration::from_nanos(self.context.clock.now_nanos().saturating_sub(start_nanos))
    }

    fn record(&self, elapsed: Duration, failed: bool) {
        let outcome = Outcome::classify(elapsed, self.config.slow_call_duration_threshold, failed);
        let thresholds = self.config.thresholds();
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state() {
                CircuitState::Closed => {
                    let snapshot = inner.window.record(elapsed, outcome);
                    if thresholds.evaluate(&snapshot) == ThresholdVerdict::AboveThresholds {
                        self.exceeded_events(&thresholds, &snapshot, &mut pending);
                        self.fire(&mut inner, CircuitState::Open, &mut pending);
                    }
                }
                CircuitState::HalfOpen => {
                    let snapshot = inner.window.record(elapsed, outcome);
                    let permitted = self.config.permitted_number_of_calls_in_half_open_state;
                    if snapshot.total_number_of_calls() >= permitted {
                        if thresholds.evaluate(&snapshot) == ThresholdVerdict::AboveThresholds {
                            self.exceeded_events(&thresholds, &snapshot, &mut pending);
                            self.fire(&mut inner, CircuitState::Open, &mut pending);
                        } else {
                            self.fire(&mut inner, CircuitState::Closed, &mut pending);
                        }
                    }
                }
                CircuitState::Open | CircuitState::ForcedOpen | CircuitState::Disabled => {}
            }
        }
        self.publish(pending);
    }

    fn manual_transition(&self, to: CircuitState) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state() == to {
                self.enter(&mut inner, to);
            } else {
                self.fire(&mut inner, to, &mut pending);
            }
            // an automatic trip keeps the window that caused it, a manual one does not
            if to == CircuitState::Open {
                inner.window.reset();
            }
        }
        self.publish(pending);
    }

    /// Fire the machine event leading to `to` and apply entry bookkeeping
    fn fire(&self, inner: &mut Inner, to: CircuitState, pending: &mut Vec<CircuitBreakerEvent>) {
        let from = inner.state();
        let event = match to {
            CircuitState::Closed => CircuitEvent::Close,
            CircuitState::Open => CircuitEvent::Trip,
            CircuitState::HalfOpen => CircuitEvent::Probe,
            CircuitState::Disabled => CircuitEvent::Disable,
            CircuitState::ForcedOpen => CircuitEvent::ForceOpen,
        };
        if inner.machine.handle(event).is_ok() {
            self.enter(inner, to);
            pending.push(self.transition_event(from, to));
        }
    }

    /// Entry bookkeeping for `to`: fresh window, open timestamp, trial permits
    fn enter(&self, inner: &mut Inner, to: CircuitState) {
        match to {
            CircuitState::Closed => {
                inner.consecutive_opens = 0;
                inner.window = closed_window(&self.config, &self.context);
            }
            CircuitState::Open => {
                inner.consecutive_opens = inner.consecutive_opens.saturating_add(1);
                let wait = self.config.open_wait(inner.consecutive_opens);
                let now = self.context.clock.now_nanos();
                if let Some(data) = inner.machine.open_data_mut() {
                    data.opened_at_nanos = now;
                    data.wait_nanos = clock::duration_nanos(wait);
                }
            }
            CircuitState::HalfOpen => {
                let permitted = self.config.permitted_number_of_calls_in_half_open_state;
                if let Some(data) = inner.machine.half_open_data_mut() {
                    data.permitted_calls_remaining = permitted;
                }
                inner.window = Box::new(CountWindow::new(permitted, permitted));
            }
            CircuitState::Disabled | CircuitState::ForcedOpen => inner.window.reset(),
        }
    }

    fn exceeded_events(
        &self,
        thresholds: &Thresholds,
        snapshot: &Snapshot,
        pending: &mut Vec<CircuitBreakerEvent>,
    ) {
        if thresholds.failure_rate_exceeded(snapshot) {
            pending.push(CircuitBreakerEvent::FailureRateExceeded {
                name: self.context.name.clone(),
                failure_rate: snapshot.failure_rate(),
            });
        }
        if thresholds.slow_call_rate_exceeded(snapshot) {
            pending.push(CircuitBreakerEvent::SlowCallRateExceeded {
                name: self.context.name.clone(),
                slow_call_rate: snapshot.slow_call_rate(),
            });
        }
    }

    fn transition_event(&self, from: CircuitState, to: CircuitState) -> CircuitBreakerEvent {
        CircuitBreakerEvent::StateTransition {
            name: self.context.name.clone(),
            from,
            to,
        }
    }

    /// Log and publish events gathered while the state lock was held
    fn publish(&self, pending: Vec<CircuitBreakerEvent>) {
        for event in pending {
            if let CircuitBreakerEvent::StateTransition { name, from, to } = &event {
                tracing::info!(%name, %from, %to, "circuit breaker state transition");
            }
            if self.events.has_consumers() {
                self.events.publish(&event);
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

fn closed_window(config: &CircuitBreakerConfig, context: &CircuitContext) -> Box<dyn MetricsWindow> {
    metrics::new_window(
        config.sliding_window_type,
        config.sliding_window_size,
        config.minimum_number_of_calls,
        Arc::clone(&context.clock),
    )
}

fn metrics_view(state: CircuitState, snapshot: &Snapshot, not_permitted_calls: u64) -> CircuitBreakerMetrics {
    CircuitBreakerMetrics {
        state,
        failure_rate: snapshot.failure_rate(),
        slow_call_rate: snapshot.slow_call_rate(),
        buffered_calls: snapshot.total_number_of_calls(),
        failed_calls: snapshot.number_of_failed_calls(),
        successful_calls: snapshot.number_of_successful_calls(),
        slow_calls: snapshot.number_of_slow_calls(),
        slow_successful_calls: snapshot.number_of_slow_successful_calls(),
        slow_failed_calls: snapshot.number_of_slow_failed_calls(),
        not_permitted_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::classifier::PredicateClassifier;
    use std::sync::atomic::AtomicUsize;

    fn config(minimum_calls: u32, failure_rate: f32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_rate_threshold: failure_rate,
            minimum_number_of_calls: minimum_calls,
            sliding_window_size: 10,
            permitted_number_of_calls_in_half_open_state: 2,
            wait_duration_in_open_state: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn breaker(config: CircuitBreakerConfig) -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = ManualClock::shared();
        let circuit = CircuitBreaker::with_parts("test".to_string(), config, clock.clone(), None)
            .expect("valid config");
        (clock, circuit)
    }

    fn fail(circuit: &CircuitBreaker) {
        circuit.try_acquire_permission().expect("permitted");
        circuit.on_error(Duration::from_millis(1), &"boom");
    }

    fn succeed(circuit: &CircuitBreaker) {
        circuit.try_acquire_permission().expect("permitted");
        circuit.on_success(Duration::from_millis(1));
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = CircuitBreaker::new("test", CircuitBreakerConfig::default()).unwrap();

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert_eq!(circuit.name(), "test");
        assert_eq!(circuit.metrics().failure_rate, -1.0);
    }

    #[test]
    fn test_success_then_failure_opens_circuit() {
        let (_clock, circuit) = breaker(config(2, 50.0));

        succeed(&circuit);
        assert!(circuit.is_closed());
        fail(&circuit);

        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_two_successes_keep_circuit_closed() {
        let (_clock, circuit) = breaker(config(2, 50.0));

        succeed(&circuit);
        succeed(&circuit);

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, 0.0);
    }

    #[test]
    fn test_minimum_calls_prevents_premature_trip() {
        let (_clock, circuit) = breaker(config(5, 50.0));

        for _ in 0..4 {
            fail(&circuit);
        }
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, -1.0);

        fail(&circuit);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_open_rejects_until_wait_elapses_then_half_open() {
        let (clock, circuit) = breaker(config(2, 50.0));
        fail(&circuit);
        fail(&circuit);
        assert!(circuit.is_open());

        for _ in 0..3 {
            let rejection = circuit.try_acquire_permission().unwrap_err();
            assert_eq!(
                rejection,
                Rejection::CallNotPermitted {
                    name: "test".to_string(),
                    state: CircuitState::Open,
                }
            );
        }
        clock.advance(Duration::from_millis(4_999));
        assert!(circuit.try_acquire_permission().is_err());
        assert_eq!(circuit.metrics().not_permitted_calls, 4);

        clock.advance(Duration::from_millis(1));
        assert!(circuit.try_acquire_permission().is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_limits_trial_calls_and_closes() {
        let (clock, circuit) = breaker(config(2, 50.0));
        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_secs(5));

        circuit.try_acquire_permission().unwrap();
        circuit.try_acquire_permission().unwrap();
        assert!(circuit.try_acquire_permission().is_err());

        circuit.on_success(Duration::from_millis(1));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.on_success(Duration::from_millis(1));

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);
    }

    #[test]
    fn test_half_open_failure_reopens_circuit() {
        let (clock, circuit) = breaker(config(2, 50.0));
        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_secs(5));

        fail(&circuit);
        fail(&circuit);

        assert!(circuit.is_open());
        assert!(circuit.try_acquire_permission().is_err());
    }

    #[test]
    fn test_open_wait_grows_with_backoff() {
        let mut cfg = config(2, 50.0);
        cfg.wait_interval_in_open_state =
            Some(IntervalFunction::exponential(Duration::from_secs(1), 2.0));
        let (clock, circuit) = breaker(cfg);

        fail(&circuit);
        fail(&circuit);
        // first trip waits 1s
        clock.advance(Duration::from_secs(1));
        fail(&circuit);
        fail(&circuit);
        assert!(circuit.is_open());

        // second consecutive trip waits 2s
        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire_permission().is_err());
        clock.advance(Duration::from_secs(1));
        succeed(&circuit);
        succeed(&circuit);
        assert!(circuit.is_closed());

        // closing resets the backoff
        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_slow_calls_trip_circuit() {
        let cfg = CircuitBreakerConfig {
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_millis(100),
            ..config(2, 100.0)
        };
        let (_clock, circuit) = breaker(cfg);

        circuit.on_success(Duration::from_millis(150));
        circuit.on_success(Duration::from_millis(10));

        assert!(circuit.is_open());
    }

    #[test]
    fn test_slow_call_measured_through_call() {
        let cfg = CircuitBreakerConfig {
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_millis(100),
            ..config(1, 100.0)
        };
        let (clock, circuit) = breaker(cfg);

        let value = circuit
            .call(|| {
                clock.advance(Duration::from_millis(200));
                Ok::<_, String>(7)
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().slow_successful_calls, 1);
    }

    #[test]
    fn test_call_passes_error_through_unchanged() {
        let (_clock, circuit) = breaker(config(2, 50.0));

        let err = circuit.call(|| Err::<(), _>("error 1")).unwrap_err();
        assert!(matches!(err, ResilienceError::Execution("error 1")));

        let _ = circuit.call(|| Err::<(), _>("error 2"));
        let err = circuit.call(|| Ok::<_, &str>(())).unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::Rejected(Rejection::CallNotPermitted { .. })
        ));
    }

    #[test]
    fn test_failure_classifier_ignores_errors() {
        let clock = ManualClock::shared();
        let classifier: Arc<dyn FailureClassifier> = Arc::new(PredicateClassifier::new(|ctx| {
            ctx.error
                .downcast_ref::<&str>()
                .map(|e| !e.starts_with("validation"))
                .unwrap_or(true)
        }));
        let circuit = CircuitBreaker::with_parts(
            "test".to_string(),
            config(2, 50.0),
            clock,
            Some(classifier),
        )
        .unwrap();

        for _ in 0..5 {
            let _ = circuit.call(|| Err::<(), _>("validation failed"));
        }
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);

        let _ = circuit.call(|| Err::<(), _>("server error"));
        let _ = circuit.call(|| Err::<(), _>("server error"));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_ignored_error_in_half_open_returns_permit() {
        let clock = ManualClock::shared();
        let classifier: Arc<dyn FailureClassifier> =
            Arc::new(PredicateClassifier::new(|ctx| ctx.error.downcast_ref::<u16>().is_none()));
        let circuit =
            CircuitBreaker::with_parts("test".to_string(), config(2, 50.0), clock.clone(), Some(classifier))
                .unwrap();
        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_secs(5));

        circuit.try_acquire_permission().unwrap();
        circuit.try_acquire_permission().unwrap();
        circuit.on_error(Duration::from_millis(1), &404_u16);

        assert!(circuit.try_acquire_permission().is_ok());
        assert!(circuit.try_acquire_permission().is_err());
    }

    #[test]
    fn test_forced_open_and_disabled_are_manual_only() {
        let (clock, circuit) = breaker(config(2, 50.0));

        circuit.transition_to_forced_open_state();
        clock.advance(Duration::from_secs(600));
        let rejection = circuit.try_acquire_permission().unwrap_err();
        assert!(matches!(
            rejection,
            Rejection::CallNotPermitted {
                state: CircuitState::ForcedOpen,
                ..
            }
        ));

        circuit.transition_to_disabled_state();
        for _ in 0..10 {
            fail(&circuit);
        }
        assert_eq!(circuit.state(), CircuitState::Disabled);
        assert_eq!(circuit.metrics().buffered_calls, 0);

        circuit.transition_to_closed_state();
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_manual_transitions_clear_window() {
        let (_clock, circuit) = breaker(config(5, 50.0));
        fail(&circuit);
        fail(&circuit);
        assert_eq!(circuit.metrics().buffered_calls, 2);

        circuit.transition_to_closed_state();
        assert_eq!(circuit.metrics().buffered_calls, 0);

        succeed(&circuit);
        circuit.transition_to_open_state();
        assert!(circuit.is_open());
        assert_eq!(circuit.metrics().buffered_calls, 0);

        circuit.transition_to_half_open_state();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_reset_clears_state() {
        let (_clock, circuit) = breaker(config(2, 50.0));
        fail(&circuit);
        fail(&circuit);
        assert!(circuit.is_open());

        circuit.reset();
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().buffered_calls, 0);
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_events_are_published() {
        let (_clock, circuit) = breaker(config(2, 50.0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        circuit
            .event_publisher()
            .on_event(move |e| sink.lock().push(e.clone()));

        succeed(&circuit);
        fail(&circuit);
        let _ = circuit.try_acquire_permission();
        circuit.reset();

        let events = seen.lock().clone();
        assert_eq!(events.len(), 9);
        assert_eq!(
            events[0],
            CircuitBreakerEvent::CallPermitted {
                name: "test".to_string()
            }
        );
        assert!(matches!(events[1], CircuitBreakerEvent::Success { .. }));
        assert!(matches!(events[2], CircuitBreakerEvent::CallPermitted { .. }));
        assert!(matches!(events[3], CircuitBreakerEvent::Error { .. }));
        assert!(matches!(
            events[4],
            CircuitBreakerEvent::FailureRateExceeded { failure_rate, .. } if failure_rate == 50.0
        ));
        assert_eq!(
            events[5],
            CircuitBreakerEvent::StateTransition {
                name: "test".to_string(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
        assert!(matches!(events[6], CircuitBreakerEvent::NotPermitted { .. }));
        assert!(matches!(
            events[7],
            CircuitBreakerEvent::StateTransition {
                to: CircuitState::Closed,
                ..
            }
        ));
        assert!(matches!(events[8], CircuitBreakerEvent::Reset { .. }));
    }

    #[test]
    fn test_permitted_calls_are_announced_in_every_admitting_state() {
        let (clock, circuit) = breaker(config(2, 50.0));
        let permitted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&permitted);
        circuit.event_publisher().on_event(move |e| {
            if matches!(e, CircuitBreakerEvent::CallPermitted { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        circuit.try_acquire_permission().unwrap();
        circuit.transition_to_disabled_state();
        circuit.try_acquire_permission().unwrap();
        circuit.transition_to_open_state();
        assert!(circuit.try_acquire_permission().is_err());
        clock.advance(Duration::from_secs(60));
        circuit.try_acquire_permission().unwrap();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        assert_eq!(permitted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_every_machine_state_maps_to_a_circuit_state() {
        let (_clock, circuit) = breaker(config(2, 50.0));
        let cases = [
            ("Closed", CircuitState::Closed),
            ("Open", CircuitState::Open),
            ("HalfOpen", CircuitState::HalfOpen),
            ("Disabled", CircuitState::Disabled),
            ("ForcedOpen", CircuitState::ForcedOpen),
        ];
        for (name, state) in cases {
            assert_eq!(CircuitState::from_machine(name), state);
        }

        circuit.transition_to_forced_open_state();
        assert_eq!(circuit.state(), CircuitState::ForcedOpen);
        circuit.transition_to_half_open_state();
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.transition_to_disabled_state();
        assert_eq!(circuit.state(), CircuitState::Disabled);
        circuit.transition_to_open_state();
        assert_eq!(circuit.state(), CircuitState::Open);
        circuit.transition_to_closed_state();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    #[should_panic(expected = "no state named")]
    fn test_unknown_machine_state_is_a_bug() {
        let _ = CircuitState::from_machine("Tripped");
    }

    #[test]
    fn test_time_based_window() {
        let cfg = CircuitBreakerConfig {
            sliding_window_type: SlidingWindowType::TimeBased,
            sliding_window_size: 2,
            ..config(3, 50.0)
        };
        let (clock, circuit) = breaker(cfg);

        fail(&circuit);
        fail(&circuit);
        clock.advance(Duration::from_secs(3));
        // the two failures have left the window
        succeed(&circuit);
        fail(&circuit);
        assert!(circuit.is_closed());
        fail(&circuit);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_concurrent_calls_record_every_outcome() {
        let cfg = CircuitBreakerConfig {
            sliding_window_size: 1_000,
            minimum_number_of_calls: 1_000,
            ..Default::default()
        };
        let circuit = Arc::new(CircuitBreaker::new("concurrent", cfg).unwrap());
        let mut handles = vec![];
        for _ in 0..4 {
            let circuit = Arc::clone(&circuit);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let _ = circuit.call(|| Ok::<_, ()>(()));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(circuit.metrics().buffered_calls, 400);
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let zero_rate = CircuitBreakerConfig {
            failure_rate_threshold: 0.0,
            ..Default::default()
        };
        assert!(CircuitBreaker::new("bad", zero_rate).is_err());

        let above_hundred = CircuitBreakerConfig {
            slow_call_rate_threshold: 101.0,
            ..Default::default()
        };
        assert!(above_hundred.validate().is_err());

        let zero_window = CircuitBreakerConfig {
            sliding_window_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_window.validate(),
            Err(ConfigError::Invalid {
                field: "sliding_window_size",
                ..
            })
        ));

        let zero_half_open = CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 0,
            ..Default::default()
        };
        assert!(zero_half_open.validate().is_err());

        let zero_wait = CircuitBreakerConfig {
            wait_duration_in_open_state: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_wait.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let cfg: CircuitBreakerConfig = serde_json::from_str(
            r#"{ "failure_rate_threshold": 25.0, "sliding_window_type": "TIME_BASED" }"#,
        )
        .unwrap();
        assert_eq!(cfg.failure_rate_threshold, 25.0);
        assert_eq!(cfg.sliding_window_type, SlidingWindowType::TimeBased);
        assert_eq!(cfg.minimum_number_of_calls, 100);
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn test_call_async_records_outcome() {
        let (_clock, circuit) = breaker(config(2, 50.0));

        let value = circuit.call_async(async { Ok::<_, String>(1) }).await.unwrap();
        assert_eq!(value, 1);
        let err = circuit
            .call_async(async { Err::<u8, _>("down".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Execution(ref e) if e == "down"));
        assert!(circuit.is_open());
    }
}
