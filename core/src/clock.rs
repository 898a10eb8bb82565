//! Monotonic time sources
//!
//! Every primitive reads time through [`Clock`] so that tests can drive the
//! timeline by hand. The default clock is anchored at an [`Instant`], which
//! keeps NTP adjustments from moving windows or refill cycles.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic nanoseconds relative to an arbitrary origin
pub trait Clock: Send + Sync + Debug {
    /// Nanoseconds elapsed since the clock's origin
    fn now_nanos(&self) -> u64;

    /// Whole seconds elapsed since the clock's origin
    fn now_secs(&self) -> u64 {
        self.now_nanos() / 1_000_000_000
    }
}

/// Clock backed by [`Instant`]
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for deterministic tests
///
/// ```rust
/// use resilience_machines::clock::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// clock.advance(Duration::from_millis(500));
/// assert_eq!(clock.now_nanos(), 500_000_000);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, ready to hand to a primitive
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, at: Duration) {
        self.nanos.store(duration_nanos(at), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(duration_nanos(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Saturating conversion used wherever a [`Duration`] meets the nanosecond timeline
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub(crate) fn default_clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}
