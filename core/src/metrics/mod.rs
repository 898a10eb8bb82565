//! Sliding-window call metrics
//!
//! Two window shapes share one aggregate model:
//! - [`CountWindow`]: the last N calls
//! - [`TimeWindow`]: calls made during the last N seconds
//!
//! Both keep a running total so that recording and reading a [`Snapshot`]
//! are O(1). Every mutation happens under the window's lock, so a snapshot
//! never observes a half-applied record.

pub mod count_window;
pub mod time_window;

pub use count_window::CountWindow;
pub use time_window::TimeWindow;

use crate::clock::Clock;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Classification of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Error,
    SlowSuccess,
    SlowError,
}

impl Outcome {
    /// Derive the outcome from the caller's verdict and the slow-call threshold
    pub fn classify(duration: Duration, slow_call_threshold: Duration, failed: bool) -> Self {
        let slow = duration > slow_call_threshold;
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (true, false) => Outcome::Error,
            (false, true) => Outcome::SlowSuccess,
            (true, true) => Outcome::SlowError,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Error | Outcome::SlowError)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowError)
    }
}

/// Window shape selector used by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlidingWindowType {
    #[default]
    CountBased,
    TimeBased,
}

/// Abstract metrics window
pub trait MetricsWindow: Send + Sync + fmt::Debug {
    /// Record one call and return the aggregate that includes it
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot;

    /// Current aggregate
    fn snapshot(&self) -> Snapshot;

    /// Drop every recorded call
    fn reset(&self);
}

/// Build a window of the requested shape
///
/// `size` is a number of calls for [`SlidingWindowType::CountBased`] and a
/// number of seconds for [`SlidingWindowType::TimeBased`].
pub fn new_window(
    kind: SlidingWindowType,
    size: u32,
    minimum_number_of_calls: u32,
    clock: Arc<dyn Clock>,
) -> Box<dyn MetricsWindow> {
    match kind {
        SlidingWindowType::CountBased => {
            Box::new(CountWindow::new(size, minimum_number_of_calls))
        }
        SlidingWindowType::TimeBased => {
            Box::new(TimeWindow::new(size, minimum_number_of_calls, clock))
        }
    }
}

/// Running per-outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    calls: u32,
    failed: u32,
    slow: u32,
    slow_failed: u32,
    duration_nanos: u128,
}

impl Totals {
    pub(crate) fn add(&mut self, duration: Duration, outcome: Outcome) {
        self.calls += 1;
        self.duration_nanos += duration.as_nanos();
        if outcome.is_failure() {
            self.failed += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
        if outcome == Outcome::SlowError {
            self.slow_failed += 1;
        }
    }

    /// Subtract a bucket or slot that is leaving the window
    pub(crate) fn remove(&mut self, other: &Totals) {
        self.calls -= other.calls;
        self.failed -= other.failed;
        self.slow -= other.slow;
        self.slow_failed -= other.slow_failed;
        self.duration_nanos -= other.duration_nanos;
    }

    pub(crate) fn snapshot(&self, minimum_number_of_calls: u32) -> Snapshot {
        Snapshot {
            total_calls: self.calls,
            failed_calls: self.failed,
            slow_calls: self.slow,
            slow_failed_calls: self.slow_failed,
            total_duration: Duration::from_nanos(
                u64::try_from(self.duration_nanos).unwrap_or(u64::MAX),
            ),
            minimum_number_of_calls,
        }
    }
}

/// Immutable point-in-time aggregate of a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    total_calls: u32,
    failed_calls: u32,
    slow_calls: u32,
    slow_failed_calls: u32,
    total_duration: Duration,
    minimum_number_of_calls: u32,
}

impl Snapshot {
    pub fn total_number_of_calls(&self) -> u32 {
        self.total_calls
    }

    pub fn number_of_failed_calls(&self) -> u32 {
        self.failed_calls
    }

    pub fn number_of_successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    pub fn number_of_slow_calls(&self) -> u32 {
        self.slow_calls
    }

    pub fn number_of_slow_successful_calls(&self) -> u32 {
        self.slow_calls - self.slow_failed_calls
    }

    pub fn number_of_slow_failed_calls(&self) -> u32 {
        self.slow_failed_calls
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.total_calls
        }
    }

    /// True once enough calls are buffered for the rates to mean anything
    pub fn has_minimum_calls(&self) -> bool {
        self.total_calls > 0 && self.total_calls >= self.minimum_number_of_calls
    }

    /// Failure percentage, or -1.0 below the minimum-calls floor
    pub fn failure_rate(&self) -> f32 {
        self.rate_of(self.failed_calls)
    }

    /// Slow-call percentage, or -1.0 below the minimum-calls floor
    pub fn slow_call_rate(&self) -> f32 {
        self.rate_of(self.slow_calls)
    }

    fn rate_of(&self, count: u32) -> f32 {
        if !self.has_minimum_calls() {
            return -1.0;
        }
        count as f32 * 100.0 / self.total_calls as f32
    }
}

/// Result of comparing a snapshot against rate thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdVerdict {
    BelowThresholds,
    AboveThresholds,
    BelowMinimumCalls,
}

/// Failure and slow-call rate thresholds, in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub failure_rate: f32,
    pub slow_call_rate: f32,
}

impl Thresholds {
    /// Both rates must lie in (0, 100]
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_percentage("failure_rate_threshold", self.failure_rate)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate)
    }

    pub fn evaluate(&self, snapshot: &Snapshot) -> ThresholdVerdict {
        if !snapshot.has_minimum_calls() {
            return ThresholdVerdict::BelowMinimumCalls;
        }
        if self.failure_rate_exceeded(snapshot) || self.slow_call_rate_exceeded(snapshot) {
            ThresholdVerdict::AboveThresholds
        } else {
            ThresholdVerdict::BelowThresholds
        }
    }

    pub fn failure_rate_exceeded(&self, snapshot: &Snapshot) -> bool {
        let rate = snapshot.failure_rate();
        rate >= 0.0 && rate >= self.failure_rate
    }

    pub fn slow_call_rate_exceeded(&self, snapshot: &Snapshot) -> bool {
        let rate = snapshot.slow_call_rate();
        rate >= 0.0 && rate >= self.slow_call_rate
    }
}

fn check_percentage(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("must be in (0, 100], got {value}"),
        ))
    }
}
