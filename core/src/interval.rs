//! Wait-interval functions
//!
//! Used between retry attempts and to grow the circuit breaker's open-state
//! wait after consecutive trips. Attempts are numbered from 1.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval as a function of the attempt number
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntervalFunction {
    /// Same interval every time
    Fixed { interval: Duration },
    /// `initial * multiplier^(attempt - 1)`, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
    /// Exponential interval shortened by up to `randomization_factor`
    ///
    /// Jitter follows the chrono-machines formula
    /// `interval * (1 - factor + rand * factor)`.
    ExponentialRandom {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        randomization_factor: f64,
    },
}

impl IntervalFunction {
    pub fn fixed(interval: Duration) -> Self {
        IntervalFunction::Fixed { interval }
    }

    pub fn exponential(initial: Duration, multiplier: f64) -> Self {
        IntervalFunction::Exponential {
            initial,
            multiplier,
            max: Duration::MAX,
        }
    }

    pub fn exponential_random(initial: Duration, multiplier: f64, randomization_factor: f64) -> Self {
        IntervalFunction::ExponentialRandom {
            initial,
            multiplier,
            max: Duration::MAX,
            randomization_factor,
        }
    }

    /// Cap an exponential interval; no-op for fixed intervals
    pub fn with_max(self, cap: Duration) -> Self {
        match self {
            IntervalFunction::Fixed { .. } => self,
            IntervalFunction::Exponential {
                initial,
                multiplier,
                ..
            } => IntervalFunction::Exponential {
                initial,
                multiplier,
                max: cap,
            },
            IntervalFunction::ExponentialRandom {
                initial,
                multiplier,
                randomization_factor,
                ..
            } => IntervalFunction::ExponentialRandom {
                initial,
                multiplier,
                max: cap,
                randomization_factor,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            IntervalFunction::Fixed { .. } => Ok(()),
            IntervalFunction::Exponential { multiplier, .. } => check_multiplier(multiplier),
            IntervalFunction::ExponentialRandom {
                multiplier,
                randomization_factor,
                ..
            } => {
                check_multiplier(multiplier)?;
                if !(0.0..=1.0).contains(&randomization_factor) {
                    return Err(ConfigError::invalid(
                        "randomization_factor",
                        format!("must be in [0, 1], got {randomization_factor}"),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Interval to wait after attempt number `attempt` (1-based)
    pub fn interval(&self, attempt: u32) -> Duration {
        match *self {
            IntervalFunction::Fixed { interval } => interval,
            IntervalFunction::Exponential {
                initial,
                multiplier,
                max,
            } => exponential(initial, multiplier, max, attempt),
            IntervalFunction::ExponentialRandom {
                initial,
                multiplier,
                max,
                randomization_factor,
            } => jitter(
                exponential(initial, multiplier, max, attempt),
                randomization_factor,
            ),
        }
    }
}

impl Default for IntervalFunction {
    fn default() -> Self {
        IntervalFunction::fixed(Duration::from_millis(500))
    }
}

fn check_multiplier(multiplier: f64) -> Result<(), ConfigError> {
    if multiplier.is_finite() && multiplier >= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "multiplier",
            format!("must be >= 1.0, got {multiplier}"),
        ))
    }
}

fn exponential(initial: Duration, multiplier: f64, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let nanos = initial.as_nanos() as f64 * multiplier.powi(exponent);
    if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
        return max;
    }
    Duration::from_nanos(nanos as u64).min(max)
}

fn jitter(interval: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: interval_ms,
        multiplier: 1.0,
        max_delay_ms: interval_ms,
    };
    Duration::from_millis(policy.calculate_delay(1, factor) as u64)
}
