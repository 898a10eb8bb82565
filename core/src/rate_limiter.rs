//! Atomic rate limiter
//!
//! Permits refill at `limit_for_period` per `limit_refresh_period`. The
//! whole state lives in one `AtomicU64`: the high half is the refill cycle
//! index, the low half a signed permit count. A negative count means that
//! many permits of future cycles are already promised to waiting callers.
//!
//! Every acquisition is a compare-and-swap over that cell. A caller only
//! takes a permit when it will be served within its timeout; one interrupted
//! while waiting for a granted permit hands it back with a second swap.

use crate::{
    clock::{self, Clock},
    errors::{ConfigError, Rejection, ResilienceError},
    events::EventPublisher,
    interrupt::InterruptToken,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Permits handed out per refresh period
    pub limit_for_period: u32,
    /// Length of one refill cycle
    pub limit_refresh_period: Duration,
    /// Default wait used by [`AtomicRateLimiter::try_acquire_permission`]
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_millis(500),
            timeout_duration: Duration::from_secs(5),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_limit(self.limit_for_period)?;
        validate_period(self.limit_refresh_period)
    }
}

fn validate_limit(limit: u32) -> Result<(), ConfigError> {
    if limit == 0 || limit > i32::MAX as u32 {
        return Err(ConfigError::invalid(
            "limit_for_period",
            format!("must be in [1, {}], got {limit}", i32::MAX),
        ));
    }
    Ok(())
}

fn validate_period(period: Duration) -> Result<(), ConfigError> {
    if period < Duration::from_millis(1) {
        return Err(ConfigError::invalid(
            "limit_refresh_period",
            "must be at least 1ms",
        ));
    }
    Ok(())
}

/// Events emitted by a rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimiterEvent {
    SuccessfulAcquire { name: String },
    FailedAcquire { name: String },
}

/// Read-only metrics view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    /// Permits left in the current cycle; negative when future permits are
    /// already reserved
    pub available_permissions: i32,
    /// Nanoseconds until a new caller could get a permit
    pub nanos_to_wait: u64,
    /// Callers currently blocked waiting for a permit
    pub number_of_waiting_threads: u32,
}

/// Refill timing; the cycle index stays monotonic across period changes
#[derive(Debug, Clone, Copy)]
struct Timing {
    limit: i32,
    period_nanos: u64,
    timeout: Duration,
    epoch_nanos: u64,
    epoch_cycle: u64,
}

impl Timing {
    fn cycle_at(&self, now: u64) -> u64 {
        self.epoch_cycle + now.saturating_sub(self.epoch_nanos) / self.period_nanos
    }

    fn nanos_to_next_cycle(&self, now: u64) -> u64 {
        self.period_nanos - now.saturating_sub(self.epoch_nanos) % self.period_nanos
    }

    /// Wait before permit number `permits` (the count seen before taking
    /// one) is covered by refills
    fn nanos_to_wait(&self, permits: i32, now: u64) -> u64 {
        if permits > 0 {
            return 0;
        }
        let full_cycles = u64::from(permits.unsigned_abs()) / self.limit as u64;
        full_cycles
            .saturating_mul(self.period_nanos)
            .saturating_add(self.nanos_to_next_cycle(now))
    }
}

/// Unpacked atomic cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cell {
    cycle: u32,
    permits: i32,
}

impl Cell {
    fn pack(self) -> u64 {
        (u64::from(self.cycle) << 32) | u64::from(self.permits as u32)
    }

    fn unpack(packed: u64) -> Self {
        Self {
            cycle: (packed >> 32) as u32,
            permits: packed as u32 as i32,
        }
    }

    /// Advance to the cycle at `now`, refilling up to one cycle's worth
    ///
    /// Cycle indices are compared with wrapping arithmetic, so a counter that
    /// wrapped past `u32::MAX` still refills.
    fn refresh(self, timing: &Timing, now: u64) -> Self {
        let current = timing.cycle_at(now) as u32;
        let elapsed = current.wrapping_sub(self.cycle);
        if elapsed == 0 {
            return self;
        }
        let limit = i64::from(timing.limit);
        let refilled = i64::from(self.permits)
            .saturating_add(i64::from(elapsed).saturating_mul(limit))
            .min(limit);
        Self {
            cycle: current,
            permits: refilled as i32,
        }
    }
}

/// Lock-free rate limiter
pub struct AtomicRateLimiter {
    name: String,
    state: AtomicU64,
    timing: RwLock<Timing>,
    reconfig: Mutex<()>,
    waiting_threads: AtomicU32,
    clock: Arc<dyn Clock>,
    events: EventPublisher<RateLimiterEvent>,
}

impl AtomicRateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, clock::default_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limit = config.limit_for_period as i32;
        let timing = Timing {
            limit,
            period_nanos: clock::duration_nanos(config.limit_refresh_period),
            timeout: config.timeout_duration,
            epoch_nanos: clock.now_nanos(),
            epoch_cycle: 0,
        };

        Ok(Self {
            name: name.into(),
            state: AtomicU64::new(Cell { cycle: 0, permits: limit }.pack()),
            timing: RwLock::new(timing),
            reconfig: Mutex::new(()),
            waiting_threads: AtomicU32::new(0),
            clock,
            events: EventPublisher::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_publisher(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.events
    }

    pub fn config(&self) -> RateLimiterConfig {
        let timing = self.timing.read();
        RateLimiterConfig {
            limit_for_period: timing.limit as u32,
            limit_refresh_period: Duration::from_nanos(timing.period_nanos),
            timeout_duration: timing.timeout,
        }
    }

    /// Acquire a permit, blocking at most the configured timeout
    pub fn try_acquire_permission(&self) -> bool {
        let timeout = self.timing.read().timeout;
        self.acquire_permission(timeout)
    }

    /// Acquire a permit, blocking at most `timeout`
    ///
    /// Returns false if no permit could be had in time. A zero timeout never
    /// blocks.
    pub fn acquire_permission(&self, timeout: Duration) -> bool {
        self.acquire(timeout, None).is_ok()
    }

    /// Acquire a permit, blocking at most `timeout` unless `token` is
    /// interrupted first
    ///
    /// Fails with [`Rejection::RequestNotPermitted`] when the timeout is too
    /// short and with [`Rejection::Interrupted`] when the wait was cut short;
    /// the token stays interrupted. Either way the reservation is returned.
    pub fn acquire_permission_strict(
        &self,
        timeout: Duration,
        token: &InterruptToken,
    ) -> Result<(), Rejection> {
        self.acquire(timeout, Some(token))
    }

    /// Reserve a permit without blocking
    ///
    /// On success the caller must wait the returned duration before using
    /// the permit. When the permit cannot be had within `timeout` nothing is
    /// reserved.
    pub fn reserve_permission(&self, timeout: Duration) -> Result<Duration, Rejection> {
        let timeout_nanos = clock::duration_nanos(timeout);
        let reserved = self.update(|cell, timing, now| {
            let wait = timing.nanos_to_wait(cell.permits, now);
            if wait <= timeout_nanos {
                (cell.permits.saturating_sub(1), Some(wait))
            } else {
                (cell.permits, None)
            }
        });

        match reserved {
            Some(wait) => {
                tracing::trace!(name = %self.name, wait_ms = wait / 1_000_000, "permit reserved");
                self.publish_success();
                Ok(Duration::from_nanos(wait))
            }
            None => {
                self.publish_failure();
                Err(self.not_permitted())
            }
        }
    }

    /// Acquire a permit, awaiting the reservation on the tokio timer
    ///
    /// Dropping the future before the wait is over hands the reservation back.
    pub async fn acquire_permission_async(&self, timeout: Duration) -> Result<(), Rejection> {
        let wait = self.reserve_permission(timeout)?;
        if !wait.is_zero() {
            let mut pending = PendingReservation {
                limiter: self,
                armed: true,
            };
            tokio::time::sleep(wait).await;
            pending.armed = false;
        }
        Ok(())
    }

    /// Run `f` once a permit is acquired within the configured timeout
    pub fn call<T, E, F>(&self, f: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let timeout = self.timing.read().timeout;
        self.acquire(timeout, None)?;
        f().map_err(ResilienceError::Execution)
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let timing = *self.timing.read();
        let now = self.clock.now_nanos();
        let cell = Cell::unpack(self.state.load(Ordering::Acquire)).refresh(&timing, now);
        RateLimiterMetrics {
            available_permissions: cell.permits,
            nanos_to_wait: timing.nanos_to_wait(cell.permits, now),
            number_of_waiting_threads: self.waiting_threads.load(Ordering::Acquire),
        }
    }

    /// New permits per cycle; applies from the next refill on
    pub fn change_limit_for_period(&self, limit: u32) -> Result<(), ConfigError> {
        validate_limit(limit)?;
        let _reconfig = self.reconfig.lock();
        let previous = {
            let mut timing = self.timing.write();
            std::mem::replace(&mut timing.limit, limit as i32)
        };
        tracing::info!(name = %self.name, from = previous, to = limit, "rate limit changed");
        Ok(())
    }

    /// New default timeout for [`try_acquire_permission`](Self::try_acquire_permission)
    pub fn change_timeout_duration(&self, timeout: Duration) {
        let _reconfig = self.reconfig.lock();
        self.timing.write().timeout = timeout;
        tracing::info!(name = %self.name, timeout_ms = timeout.as_millis() as u64, "rate limiter timeout changed");
    }

    /// New cycle length; the current cycle ends one new period from now
    pub fn change_limit_refresh_period(&self, period: Duration) -> Result<(), ConfigError> {
        validate_period(period)?;
        let _reconfig = self.reconfig.lock();
        {
            let mut timing = self.timing.write();
            let now = self.clock.now_nanos();
            timing.epoch_cycle = timing.cycle_at(now);
            timing.epoch_nanos = now;
            timing.period_nanos = clock::duration_nanos(period);
        }
        tracing::info!(
            name = %self.name,
            period_ms = period.as_millis() as u64,
            "rate limiter refresh period changed"
        );
        Ok(())
    }

    fn acquire(&self, timeout: Duration, token: Option<&InterruptToken>) -> Result<(), Rejection> {
        let timeout_nanos = clock::duration_nanos(timeout);
        // only a caller that will be served within its timeout takes a permit
        let (wait, reserved) = self.update(|cell, timing, now| {
            let wait = timing.nanos_to_wait(cell.permits, now);
            if wait <= timeout_nanos {
                (cell.permits.saturating_sub(1), (wait, true))
            } else {
                (cell.permits, (wait, false))
            }
        });
        if reserved && wait == 0 {
            self.publish_success();
            return Ok(());
        }

        tracing::trace!(name = %self.name, wait_ms = wait / 1_000_000, reserved, "waiting for permit");
        let interrupted = self.block(wait.min(timeout_nanos), token);
        if reserved && !interrupted {
            self.publish_success();
            return Ok(());
        }

        if reserved {
            self.restore();
        }
        self.publish_failure();
        if interrupted {
            Err(Rejection::Interrupted {
                name: self.name.clone(),
            })
        } else {
            Err(self.not_permitted())
        }
    }

    /// Sleep `nanos`; returns true if `token` interrupted the wait
    fn block(&self, nanos: u64, token: Option<&InterruptToken>) -> bool {
        if nanos == 0 {
            return false;
        }
        self.waiting_threads.fetch_add(1, Ordering::AcqRel);
        let duration = Duration::from_nanos(nanos);
        let interrupted = match token {
            Some(token) => token.sleep(duration).is_err(),
            None => {
                std::thread::sleep(duration);
                false
            }
        };
        self.waiting_threads.fetch_sub(1, Ordering::AcqRel);
        interrupted
    }

    /// Hand back one reserved permit
    fn restore(&self) {
        self.update(|cell, timing, _| {
            let permits = cell.permits.saturating_add(1).min(timing.limit);
            (permits, ())
        });
    }

    /// CAS loop over the refreshed cell; `next` returns the new permit count
    ///
    /// The timing read lock is held across the loop so reconfiguration never
    /// lands between computing and publishing a new state.
    fn update<R>(&self, mut next: impl FnMut(Cell, &Timing, u64) -> (i32, R)) -> R {
        let guard = self.timing.read();
        let timing: &Timing = &guard;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let now = self.clock.now_nanos();
            let refreshed = Cell::unpack(current).refresh(timing, now);
            let (permits, out) = next(refreshed, timing, now);
            let packed = Cell {
                cycle: refreshed.cycle,
                permits,
            }
            .pack();
            match self
                .state
                .compare_exchange_weak(current, packed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return out,
                Err(actual) => current = actual,
            }
        }
    }

    fn not_permitted(&self) -> Rejection {
        Rejection::RequestNotPermitted {
            name: self.name.clone(),
        }
    }

    fn publish_success(&self) {
        self.events.publish_with(|| RateLimiterEvent::SuccessfulAcquire {
            name: self.name.clone(),
        });
    }

    fn publish_failure(&self) {
        self.events.publish_with(|| RateLimiterEvent::FailedAcquire {
            name: self.name.clone(),
        });
    }
}

/// Returns an async reservation whose wait was abandoned
struct PendingReservation<'a> {
    limiter: &'a AtomicRateLimiter,
    armed: bool,
}

impl Drop for PendingReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.limiter.restore();
        }
    }
}

impl fmt::Debug for AtomicRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicRateLimiter")
            .field("name", &self.name)
            .field("config", &self.config())
            .field("metrics", &self.metrics())
            .finish()
    }
}
