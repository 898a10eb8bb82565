//! Retry engine
//!
//! Re-runs a call while its error (or result) is classified as retryable and
//! attempts remain, waiting an [`IntervalFunction`] between attempts. The
//! blocking variants sleep the calling thread; [`Retry::execute_async`] waits
//! on the tokio timer, so dropping its future cancels the pending attempt.

use crate::{
    classifier::{self, FailureClassifier, FailureContext},
    clock::{self, Clock},
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interrupt::InterruptToken,
    interval::IntervalFunction,
};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Predicate deciding whether a successful result should be retried anyway
pub type ResultPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Retry configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Wait before attempt `n + 1`, keyed on `n`
    pub interval: IntervalFunction,
    /// Which errors are retried; unset retries every error
    #[serde(skip)]
    pub retry_on_error: Option<Arc<dyn FailureClassifier>>,
    /// Which results are retried; unset never retries a result
    #[serde(skip)]
    pub retry_on_result: Option<ResultPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: IntervalFunction::default(),
            retry_on_error: None,
            retry_on_result: None,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "max_attempts",
                "must be greater than 0",
            ));
        }
        self.interval.validate()
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("interval", &self.interval)
            .field("retry_on_error", &self.retry_on_error)
            .field("retry_on_result", &self.retry_on_result.is_some())
            .finish()
    }
}

/// Events emitted by a retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Attempt `attempt` failed; the next one starts after `wait`
    Retry {
        name: String,
        attempt: u32,
        wait: Duration,
    },
    /// The call succeeded after at least one retry
    Success { name: String, attempts: u32 },
    /// Attempts ran out
    Error { name: String, attempts: u32 },
    /// The error was not retryable
    IgnoredError { name: String },
}

/// Outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

#[derive(Debug, Default)]
struct Counters {
    succeeded_without_retry: AtomicU64,
    succeeded_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

enum Next<T, E> {
    Done(Result<T, ResilienceError<E>>),
    Wait(Duration),
}

pub struct Retry {
    name: String,
    config: RetryConfig,
    counters: Counters,
    events: EventPublisher<RetryEvent>,
    clock: Arc<dyn Clock>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, clock::default_clock())
    }

    /// Attempt durations handed to the classifier are measured on `clock`
    pub fn with_clock(
        name: impl Into<String>,
        config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            counters: Counters::default(),
            events: EventPublisher::new(),
            clock,
        })
    }

    pub fn builder(name: impl Into<String>) -> RetryBuilder {
        RetryBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn event_publisher(&self) -> &EventPublisher<RetryEvent> {
        &self.events
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self.counters.succeeded_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.counters.succeeded_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or runs
    /// out of attempts, sleeping the calling thread between attempts
    pub fn execute<T, E, F>(&self, mut f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Result<T, E>,
        T: 'static,
        E: 'static,
    {
        let mut attempt = 1;
        loop {
            let started = self.clock.now_nanos();
            let result = f();
            match self.on_outcome(attempt, self.elapsed_since(started), result) {
                Next::Done(result) => return result,
                Next::Wait(wait) => std::thread::sleep(wait),
            }
            attempt += 1;
        }
    }

    /// Like [`execute`](Self::execute), but a wait between attempts ends
    /// with [`Rejection::Interrupted`] once `token` is interrupted
    pub fn execute_interruptibly<T, E, F>(
        &self,
        token: &InterruptToken,
        mut f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Result<T, E>,
        T: 'static,
        E: 'static,
    {
        let mut attempt = 1;
        loop {
            let started = self.clock.now_nanos();
            let result = f();
            match self.on_outcome(attempt, self.elapsed_since(started), result) {
                Next::Done(result) => return result,
                Next::Wait(wait) => {
                    if token.sleep(wait).is_err() {
                        return Err(Rejection::Interrupted {
                            name: self.name.clone(),
                        }
                        .into());
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Async variant; each re-attempt is scheduled on the tokio timer
    pub async fn execute_async<T, E, F, Fut>(&self, mut f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: 'static,
        E: 'static,
    {
        let mut attempt = 1;
        loop {
            let started = self.clock.now_nanos();
            let result = f().await;
            match self.on_outcome(attempt, self.elapsed_since(started), result) {
                Next::Done(result) => return result,
                Next::Wait(wait) => tokio::time::sleep(wait).await,
            }
            attempt += 1;
        }
    }

    fn elapsed_since(&self, started: u64) -> Duration {
        Duration::from_nanos(self.clock.now_nanos().saturating_sub(started))
    }

    /// Decide what follows attempt number `attempt`
    fn on_outcome<T: 'static, E: 'static>(
        &self,
        attempt: u32,
        elapsed: Duration,
        result: Result<T, E>,
    ) -> Next<T, E> {
        let max_attempts = self.config.max_attempts;
        match result {
            Ok(value) => {
                let retry_result = self
                    .config
                    .retry_on_result
                    .as_ref()
                    .is_some_and(|predicate| predicate(&value as &dyn Any));
                if !retry_result {
                    self.record_success(attempt);
                    return Next::Done(Ok(value));
                }
                if attempt >= max_attempts {
                    self.record_exhausted(attempt);
                    return Next::Done(Ok(value));
                }
                Next::Wait(self.schedule(attempt))
            }
            Err(error) => {
                let ctx = FailureContext {
                    name: &self.name,
                    error: &error as &dyn Any,
                    duration: elapsed,
                    attempt,
                };
                if !classifier::classify(self.config.retry_on_error.as_ref(), &ctx) {
                    self.counters
                        .failed_without_retry
                        .fetch_add(1, Ordering::Relaxed);
                    self.events.publish_with(|| RetryEvent::IgnoredError {
                        name: self.name.clone(),
                    });
                    return Next::Done(Err(ResilienceError::Execution(error)));
                }
                if attempt >= max_attempts {
                    self.record_exhausted(attempt);
                    return Next::Done(Err(ResilienceError::RetryExhausted {
                        name: self.name.clone(),
                        attempts: attempt,
                        last: error,
                    }));
                }
                Next::Wait(self.schedule(attempt))
            }
        }
    }

    fn schedule(&self, attempt: u32) -> Duration {
        let wait = self.config.interval.interval(attempt);
        tracing::warn!(
            name = %self.name,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "attempt failed, retrying"
        );
        self.events.publish_with(|| RetryEvent::Retry {
            name: self.name.clone(),
            attempt,
            wait,
        });
        wait
    }

    fn record_success(&self, attempts: u32) {
        if attempts == 1 {
            self.counters
                .succeeded_without_retry
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .succeeded_with_retry
            .fetch_add(1, Ordering::Relaxed);
        self.events.publish_with(|| RetryEvent::Success {
            name: self.name.clone(),
            attempts,
        });
    }

    fn record_exhausted(&self, attempts: u32) {
        self.counters
            .failed_with_retry
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(name = %self.name, attempts, "retries exhausted");
        self.events.publish_with(|| RetryEvent::Error {
            name: self.name.clone(),
            attempts,
        });
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// Builder for [`Retry`] in the style of [`CircuitBuilder`](crate::CircuitBuilder)
pub struct RetryBuilder {
    name: String,
    config: RetryConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl RetryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: RetryConfig::default(),
            clock: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Total attempts including the first call
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Same wait between every attempt
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.interval = IntervalFunction::fixed(wait);
        self
    }

    pub fn interval_function(mut self, interval: IntervalFunction) -> Self {
        self.config.interval = interval;
        self
    }

    /// Only retry errors the classifier counts
    pub fn retry_on_error(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.retry_on_error = Some(classifier);
        self
    }

    /// Retry successful results matching `predicate`
    pub fn retry_on_result<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn Any) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_result = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Result<Retry, ConfigError> {
        let clock = self.clock.unwrap_or_else(clock::default_clock);
        Retry::with_clock(self.name, self.config, clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PredicateClassifier;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    fn retry(max_attempts: u32) -> Retry {
        Retry::builder("test")
            .max_attempts(max_attempts)
            .wait_duration(Duration::ZERO)
            .build()
            .unwrap()
    }

    #[test]
    fn test_always_failing_call_runs_max_attempts() {
        let retry = retry(3);
        let calls = AtomicU32::new(0);

        let err = retry
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err::<(), _>(format!("failure {n}"))
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ResilienceError::RetryExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    #[test]
    fn test_success_after_retries() {
        let retry = retry(5);
        let calls = AtomicU32::new(0);

        let value = retry
            .execute(|| match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("transient"),
                n => Ok(n),
            })
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(
            retry.metrics(),
            RetryMetrics {
                successful_calls_with_retry: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_first_attempt_success_counts_without_retry() {
        let retry = retry(3);
        assert_eq!(retry.execute(|| Ok::<_, ()>("ok")).unwrap(), "ok");
        assert_eq!(retry.metrics().successful_calls_without_retry, 1);
    }

    #[test]
    fn test_non_retryable_error_fails_immediately() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .wait_duration(Duration::ZERO)
            .retry_on_error(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error.downcast_ref::<u16>().is_some_and(|status| *status >= 500)
            })))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        let err = retry
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), u16>(404)
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ResilienceError::Execution(404)));
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);

        let _ = retry.execute(|| Err::<(), u16>(503));
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    #[test]
    fn test_classifier_sees_attempt_duration_from_clock() {
        let clock = ManualClock::shared();
        let retry = Retry::builder("test")
            .max_attempts(4)
            .wait_duration(Duration::ZERO)
            .clock(clock.clone())
            .retry_on_error(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.duration < Duration::from_secs(2)
            })))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        // each attempt takes one second longer than the previous one
        let err = retry
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                clock.advance(Duration::from_secs(n as u64));
                Err::<(), &str>("slow")
            })
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, ResilienceError::Execution("slow")));
        assert_eq!(retry.metrics().failed_calls_without_retry, 1);
    }

    #[test]
    fn test_retry_on_result() {
        let retry = Retry::builder("test")
            .max_attempts(5)
            .wait_duration(Duration::ZERO)
            .retry_on_result(|value| value.downcast_ref::<u32>().is_some_and(|v| *v < 3))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        let value = retry
            .execute(|| Ok::<_, ()>(calls.fetch_add(1, Ordering::SeqCst)))
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(retry.metrics().successful_calls_with_retry, 1);
    }

    #[test]
    fn test_exhausted_result_is_returned() {
        let retry = Retry::builder("test")
            .max_attempts(2)
            .wait_duration(Duration::ZERO)
            .retry_on_result(|value| value.downcast_ref::<&str>() == Some(&"pending"))
            .build()
            .unwrap();

        assert_eq!(retry.execute(|| Ok::<_, ()>("pending")).unwrap(), "pending");
        assert_eq!(retry.metrics().failed_calls_with_retry, 1);
    }

    #[test]
    fn test_waits_between_attempts() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .wait_duration(Duration::from_millis(20))
            .build()
            .unwrap();

        let started = Instant::now();
        let _ = retry.execute(|| Err::<(), _>("down"));
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_events_are_published() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .interval_function(
                IntervalFunction::exponential(Duration::from_millis(1), 2.0),
            )
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        retry
            .event_publisher()
            .on_event(move |e| sink.lock().push(e.clone()));

        let _ = retry.execute(|| Err::<(), _>("down"));

        let name = "test".to_string();
        assert_eq!(
            *seen.lock(),
            vec![
                RetryEvent::Retry {
                    name: name.clone(),
                    attempt: 1,
                    wait: Duration::from_millis(1),
                },
                RetryEvent::Retry {
                    name: name.clone(),
                    attempt: 2,
                    wait: Duration::from_millis(2),
                },
                RetryEvent::Error { name, attempts: 3 },
            ]
        );
    }

    #[test]
    fn test_interrupt_ends_wait() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .wait_duration(Duration::from_secs(30))
            .build()
            .unwrap();
        let token = InterruptToken::new();
        let interrupter = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                token.interrupt();
            })
        };

        let started = Instant::now();
        let err = retry
            .execute_interruptibly(&token, || Err::<(), _>("down"))
            .unwrap_err();
        interrupter.join().unwrap();

        assert!(err.rejection().is_some_and(Rejection::is_interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(retry_config_error(RetryConfig {
            max_attempts: 0,
            ..Default::default()
        }));
        assert!(retry_config_error(RetryConfig {
            interval: IntervalFunction::exponential(Duration::from_millis(10), 0.5),
            ..Default::default()
        }));
        assert!(
            RetryConfig {
                interval: IntervalFunction::fixed(Duration::ZERO),
                ..Default::default()
            }
            .validate()
            .is_ok()
        );
    }

    fn retry_config_error(config: RetryConfig) -> bool {
        Retry::new("bad", config).is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_retries_on_timer() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .wait_duration(Duration::from_secs(10))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let value = retry
            .execute_async(|| async {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("transient"),
                    n => Ok(n),
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 1);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_async_retry_cancels_next_attempt() {
        let retry = Retry::builder("test")
            .max_attempts(3)
            .wait_duration(Duration::from_secs(10))
            .build()
            .unwrap();
        let calls = AtomicU32::new(0);

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            retry.execute_async(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down")
            }),
        )
        .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
