//! Error types for resilience primitives

use crate::circuit::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// Configuration rejected at construction time
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field is outside its accepted range
    #[error("invalid configuration for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Admission was refused before the protected call ran
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Circuit breaker is Open or ForcedOpen (or HalfOpen with no trial calls left)
    #[error("CircuitBreaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted { name: String, state: CircuitState },
    /// Bulkhead had no free permit within the wait duration
    #[error("Bulkhead '{name}' is full and does not permit further calls (limit: {max_concurrent_calls})")]
    BulkheadFull {
        name: String,
        max_concurrent_calls: usize,
    },
    /// Rate limiter could not hand out a permit within the timeout
    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },
    /// The caller's wait was interrupted before an outcome was reached
    #[error("'{name}' was interrupted while waiting")]
    Interrupted { name: String },
}

impl Rejection {
    /// Returns true for [`Rejection::Interrupted`]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Rejection::Interrupted { .. })
    }
}

/// Errors produced when a call runs through a resilience primitive
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The call was never started
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// The time limiter's deadline fired first
    #[error("TimeLimiter '{name}' recorded a timeout after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    /// Every attempt failed; `last` is the failure of the final attempt
    #[error("Retry '{name}' exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        name: String,
        attempts: u32,
        last: E,
    },
    /// The wrapped operation failed
    #[error("{0}")]
    Execution(E),
}

impl<E> ResilienceError<E> {
    /// Returns the underlying call failure, if the call ran and failed
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Execution(e) | ResilienceError::RetryExhausted { last: e, .. } => {
                Some(e)
            }
            _ => None,
        }
    }

    /// Returns the admission rejection, if any
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            ResilienceError::Rejected(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout { .. })
    }
}
