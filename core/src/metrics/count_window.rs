//! Count-based sliding window: the aggregate of the last N calls

use super::{MetricsWindow, Outcome, Snapshot, Totals};
use parking_lot::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Totals>>,
    head: usize,
    totals: Totals,
}

/// Ring buffer of call slots; recording into a full ring evicts the oldest call
#[derive(Debug)]
pub struct CountWindow {
    ring: Mutex<Ring>,
    minimum_number_of_calls: u32,
}

impl CountWindow {
    /// Window over the last `size` calls
    ///
    /// The minimum-calls floor is capped at `size`, otherwise a full window
    /// could never report a rate.
    pub fn new(size: u32, minimum_number_of_calls: u32) -> Self {
        let size = size.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; size as usize],
                head: 0,
                totals: Totals::default(),
            }),
            minimum_number_of_calls: minimum_number_of_calls.min(size),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }
}

impl MetricsWindow for CountWindow {
    fn record(&self, duration: Duration, outcome: Outcome) -> Snapshot {
        let mut ring = self.ring.lock();
        let Ring {
            slots,
            head,
            totals,
        } = &mut *ring;

        let mut measurement = Totals::default();
        measurement.add(duration, outcome);

        if let Some(evicted) = slots[*head].replace(measurement) {
            totals.remove(&evicted);
        }
        totals.add(duration, outcome);
        *head = (*head + 1) % slots.len();

        totals.snapshot(self.minimum_number_of_calls)
    }

    fn snapshot(&self) -> Snapshot {
        self.ring.lock().totals.snapshot(self.minimum_number_of_calls)
    }

    fn reset(&self) {
        let mut ring = self.ring.lock();
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.head = 0;
        ring.totals = Totals::default();
    }
}
