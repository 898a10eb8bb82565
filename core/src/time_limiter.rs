//! Time limiter
//!
//! Races a computation against a deadline. Exactly one of success, error or
//! timeout is reported per call: the async variants get that from
//! `tokio::time::timeout`, the blocking variant from a one-shot flag shared
//! with its worker thread.

use crate::{
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interrupt::InterruptToken,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Time limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLimiterConfig {
    pub timeout_duration: Duration,
    /// Abort the task, or interrupt the worker, once the deadline passes
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: Duration::from_secs(1),
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_duration.is_zero() {
            return Err(ConfigError::invalid(
                "timeout_duration",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeLimiterEvent {
    Success { name: String },
    Error { name: String },
    Timeout { name: String },
}

#[derive(Debug)]
pub struct TimeLimiter {
    name: String,
    config: TimeLimiterConfig,
    events: EventPublisher<TimeLimiterEvent>,
}

impl TimeLimiter {
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            events: EventPublisher::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TimeLimiterConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<TimeLimiterEvent> {
        &self.events
    }

    /// Await `fut` for at most the configured timeout
    ///
    /// The future is owned here, so on timeout it is dropped and therefore
    /// cancelled whatever `cancel_running_future` says.
    pub async fn execute_future<T, E, Fut>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.config.timeout_duration, fut).await {
            Ok(outcome) => self.finish(outcome),
            Err(_) => Err(self.on_timeout()),
        }
    }

    /// Await a spawned task for at most the configured timeout
    ///
    /// On timeout the task is aborted only when `cancel_running_future` is
    /// set; otherwise it keeps running detached. A task cancelled from
    /// elsewhere is reported as [`Rejection::Interrupted`]; a panicking task
    /// resumes its panic here.
    pub async fn execute_task<T, E>(
        &self,
        mut task: tokio::task::JoinHandle<Result<T, E>>,
    ) -> Result<T, ResilienceError<E>> {
        match tokio::time::timeout(self.config.timeout_duration, &mut task).await {
            Ok(Ok(outcome)) => self.finish(outcome),
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                Err(Rejection::Interrupted {
                    name: self.name.clone(),
                }
                .into())
            }
            Err(_) => {
                if self.config.cancel_running_future {
                    task.abort();
                }
                Err(self.on_timeout())
            }
        }
    }

    /// Run `f` on a worker thread and wait for it up to the configured timeout
    ///
    /// `f` gets an [`InterruptToken`] that is interrupted when the deadline
    /// passes with `cancel_running_future` set; long-running work should poll
    /// it or sleep through [`InterruptToken::sleep`]. A result that arrives
    /// after the deadline is discarded.
    pub fn execute_blocking<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce(&InterruptToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let token = InterruptToken::new();
        let resolved = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::sync_channel(1);

        let worker = {
            let token = token.clone();
            let resolved = Arc::clone(&resolved);
            let name = self.name.clone();
            std::thread::spawn(move || {
                let outcome = f(&token);
                if resolve(&resolved) {
                    let _ = tx.send(outcome);
                } else {
                    tracing::debug!(%name, "late completion discarded");
                }
            })
        };

        let outcome = match rx.recv_timeout(self.config.timeout_duration) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if resolve(&resolved) {
                    if self.config.cancel_running_future {
                        token.interrupt();
                    }
                    return Err(self.on_timeout());
                }
                // the worker won the race and is sending its outcome
                match rx.recv() {
                    Ok(outcome) => outcome,
                    Err(_) => propagate_panic(worker),
                }
            }
            Err(RecvTimeoutError::Disconnected) => propagate_panic(worker),
        };
        self.finish(outcome)
    }

    fn finish<T, E>(&self, outcome: Result<T, E>) -> Result<T, ResilienceError<E>> {
        match outcome {
            Ok(value) => {
                self.events.publish_with(|| TimeLimiterEvent::Success {
                    name: self.name.clone(),
                });
                Ok(value)
            }
            Err(error) => {
                self.events.publish_with(|| TimeLimiterEvent::Error {
                    name: self.name.clone(),
                });
                Err(ResilienceError::Execution(error))
            }
        }
    }

    fn on_timeout<E>(&self) -> ResilienceError<E> {
        tracing::warn!(
            name = %self.name,
            timeout_ms = self.config.timeout_duration.as_millis() as u64,
            "call timed out"
        );
        self.events.publish_with(|| TimeLimiterEvent::Timeout {
            name: self.name.clone(),
        });
        ResilienceError::Timeout {
            name: self.name.clone(),
            timeout: self.config.timeout_duration,
        }
    }
}

/// Claim the single resolution of a race
fn resolve(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

/// The worker dropped its sender without resolving, so it panicked
fn propagate_panic(worker: JoinHandle<()>) -> ! {
    match worker.join() {
        Err(payload) => std::panic::resume_unwind(payload),
        Ok(()) => panic!("time limiter worker exited without an outcome"),
    }
}
