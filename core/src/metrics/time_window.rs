//! Time-based sliding window: the aggregate of calls made in the last N seconds

use super::{MetricsWindow, Outcome, Snapshot, Totals};
use crate::clock::Clock;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch_second: u64,
    totals: Totals,
}

#[derive(Debug)]
struct Buckets {
    ring: Vec<Bucket>,
    head: usize,
    totals: Totals,
}

impl Buckets {
    /// Advance the head bucket to `now`, retiring every bucket that fell out
    fn move_to(&mut self, now: u64) {
        let head_second = self.ring[self.head].epoch_second;
        if now <= head_second {
            return;
        }
        let len = self.ring.len() as u64;
        let mut steps = (now - head_second).min(len);
        while steps > 0 {
            steps -= 1;
            self.head = (self.head + 1) % self.ring.len();
            let bucket = &mut self.ring[self.head];
            self.totals.remove(&bucket.totals);
            *bucket = Bucket {
                epoch_second: now - steps,
                totals: Totals::default(),
            };
        }
    }
}

/// One bucket per second over a window of `size` seconds
pub struct TimeWindow {
    buckets: Mutex<Buckets>,
    minimum_number_of_calls: u32,
    clock: Arc<dyn Clock>,
}

impl TimeWindow {
    pub fn new(size_in_seconds: u32, minimum_number_of_calls: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_secs();
        let size = size_in_seconds.max(1) as usize;
        Self {
            buckets: Mutex::new(Buckets {
                ring: vec![
                    Bucket {
                        epoch_second: now,
                        totals: Totals::default(),
                    };
                    size
                ],
                head: 0,
                totals: Totals::default(),
            }),
            minimum_number_of_calls,
            clock,
        }
    }
}

impl MetricsWindow for TimeWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let now = self.clock.now_secs();
        let mut buckets = self.buckets.lock();
        buckets.move_to(now);
        let head = buckets.head;
        buckets.ring[head].totals.add(duration, outcome);
        buckets.totals.add(duration, outcome);
        buckets.totals.snapshot(self.minimum_number_of_calls)
    }

    fn snapshot(&self) -> Snapshot {
        let now = self.clock.now_secs();
        let mut buckets = self.buckets.lock();
        buckets.move_to(now);
        buckets.totals.snapshot(self.minimum_number_of_calls)
    }

    fn reset(&self) {
        let now = self.clock.now_secs();
        let mut buckets = self.buckets.lock();
        buckets.ring.iter_mut().for_each(|bucket| {
            *bucket = Bucket {
                epoch_second: now,
                totals: Totals::default(),
            }
        });
        buckets.head = 0;
        buckets.totals = Totals::default();
    }
}

impl fmt::Debug for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.buckets.lock();
        f.debug_struct("TimeWindow")
            .field("size_in_seconds", &buckets.ring.len())
            .field("totals", &buckets.totals)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MS: Duration = Duration::from_millis(1);

    fn window(size: u32) -> (Arc<ManualClock>, TimeWindow) {
        let clock = ManualClock::shared();
        let window = TimeWindow::new(size, 1, clock.clone());
        (clock, window)
    }

    #[test]
    fn test_no_calls_reports_undefined_rates() {
        let (_clock, window) = window(5);
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls(), 0);
        assert_eq!(snapshot.failure_rate(), -1.0);
        assert_eq!(snapshot.slow_call_rate(), -1.0);
    }

    #[test]
    fn test_calls_within_window_accumulate() {
        let (clock, window) = window(5);

        window.record(MS, Outcome::Error);
        clock.advance(Duration::from_secs(1));
        window.record(MS, Outcome::Success);
        clock.advance(Duration::from_secs(3));
        let snapshot = window.record(MS, Outcome::SlowSuccess);

        assert_eq!(snapshot.total_number_of_calls(), 3);
        assert_eq!(snapshot.number_of_failed_calls(), 1);
        assert_eq!(snapshot.number_of_slow_calls(), 1);
    }

    #[test]
    fn test_expired_buckets_are_subtracted_once() {
        let (clock, window) = window(3);

        window.record(MS, Outcome::Error); // second 0
        clock.advance(Duration::from_secs(1));
        window.record(MS, Outcome::Success); // second 1
        clock.advance(Duration::from_secs(1));
        window.record(MS, Outcome::Success); // second 2
        assert_eq!(window.snapshot().total_number_of_calls(), 3);

        // second 3: the bucket for second 0 leaves the window
        clock.advance(Duration::from_secs(1));
        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls(), 2);
        assert_eq!(snapshot.number_of_failed_calls(), 0);

        // reading again at the same second must not subtract anything else
        assert_eq!(window.snapshot().total_number_of_calls(), 2);
    }

    #[test]
    fn test_long_idle_period_empties_window() {
        let (clock, window) = window(4);
        for _ in 0..10 {
            window.record(MS, Outcome::Error);
        }
        clock.advance(Duration::from_secs(60));

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls(), 0);
        assert_eq!(snapshot.failure_rate(), -1.0);

        let snapshot = window.record(MS, Outcome::Success);
        assert_eq!(snapshot.total_number_of_calls(), 1);
        assert_eq!(snapshot.failure_rate(), 0.0);
    }

    #[test]
    fn test_partial_move_keeps_recent_buckets() {
        let (clock, window) = window(5);
        window.record(MS, Outcome::Error); // second 0
        clock.advance(Duration::from_secs(2));
        window.record(MS, Outcome::Error); // second 2
        clock.advance(Duration::from_secs(4)); // second 6: seconds 0 and 1 are gone

        let snapshot = window.snapshot();
        assert_eq!(snapshot.total_number_of_calls(), 1);
        assert_eq!(snapshot.number_of_failed_calls(), 1);
    }

    #[test]
    fn test_reset_clears_all_buckets() {
        let (clock, window) = window(3);
        window.record(MS, Outcome::Error);
        clock.advance(Duration::from_secs(1));
        window.record(MS, Outcome::Error);

        window.reset();
        assert_eq!(window.snapshot().total_number_of_calls(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(window.record(MS, Outcome::Success).total_number_of_calls(), 1);
    }
}
