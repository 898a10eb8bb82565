//! ResilienceMachines - fault-tolerance primitives for calls to flaky collaborators
//!
//! This crate provides:
//! - Sliding-window call metrics (count-based and time-based)
//! - A circuit breaker state machine (Closed → Open → HalfOpen, plus Disabled and ForcedOpen)
//! - A lock-free rate limiter over fixed refresh cycles
//! - Semaphore and adaptive bulkheads with live reconfiguration
//! - A retry engine with pluggable interval functions
//! - A time limiter racing a computation against a deadline
//!
//! The primitives never call each other; compose them in whatever order the
//! call site needs.
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{CircuitBreaker, Retry, SemaphoreBulkhead, BulkheadConfig};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .minimum_number_of_calls(10)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .unwrap();
//! let bulkhead = SemaphoreBulkhead::new("my_service", BulkheadConfig::default()).unwrap();
//! let retry = Retry::builder("my_service")
//!     .max_attempts(3)
//!     .wait_duration(Duration::from_millis(10))
//!     .build()
//!     .unwrap();
//!
//! // Bulkhead, then circuit breaker, retried as a whole
//! let result = retry.execute(|| {
//!     bulkhead.call(|| circuit.call(|| Ok::<_, String>("success")))
//! });
//! assert!(result.is_ok());
//!
//! if circuit.is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod adaptive;
pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod events;
pub mod interrupt;
pub mod interval;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod time_limiter;

pub use adaptive::{
    AdaptiveBulkhead, AdaptiveBulkheadConfig, AdaptiveBulkheadEvent, AdaptiveBulkheadMetrics,
    FixedLimit, LimitPolicy,
};
pub use builder::CircuitBuilder;
pub use bulkhead::{BulkheadConfig, BulkheadEvent, BulkheadGuard, BulkheadMetrics, SemaphoreBulkhead};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerMetrics, CircuitState,
};
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier, TypeClassifier,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use errors::{ConfigError, Rejection, ResilienceError};
pub use events::{EventConsumer, EventPublisher};
pub use interrupt::{InterruptToken, Interrupted};
pub use interval::IntervalFunction;
pub use metrics::{
    MetricsWindow, Outcome, SlidingWindowType, Snapshot, ThresholdVerdict, Thresholds,
};
pub use rate_limiter::{AtomicRateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterMetrics};
pub use registry::Registry;
pub use retry::{Retry, RetryBuilder, RetryConfig, RetryEvent, RetryMetrics};
pub use time_limiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterEvent};
