//! Arrival variance across related objects.
//!
//! Several objects share one presentation timestamp (simulcast layers of the
//! same frame, for example). The spread between the first and last arrival
//! of that set is a direct measure of cross-stream timing jitter.

use moq_playout_common::{MetricsHandle, Ticks};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default number of timestamps tracked before old ones are flushed.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Calculates the variance between a set of timestamped events and their
/// time of occurrence.
pub struct VarianceCalculator {
    // ---
    pending: Mutex<BTreeMap<Duration, Vec<Ticks>>>,
    expected_occurrences: usize,
    max_in_flight: usize,
    metrics: Option<MetricsHandle>,
}

impl VarianceCalculator {
    // ---
    /// `expected_occurrences` is the number of arrivals after which a set is
    /// complete; `max_in_flight` bounds how many incomplete sets are kept.
    pub fn new(
        expected_occurrences: usize,
        max_in_flight: usize,
        metrics: Option<MetricsHandle>,
    ) -> Self {
        // ---
        Self {
            pending: Mutex::new(BTreeMap::new()),
            expected_occurrences: expected_occurrences.max(1),
            max_in_flight: max_in_flight.max(1),
            metrics,
        }
    }

    /// Records an arrival of the object with presentation `timestamp`.
    ///
    /// Returns the spread in seconds once `expected_occurrences` arrivals for
    /// that timestamp have been seen.
    pub fn calculate_set_variance(&self, timestamp: Duration, now: Ticks) -> Option<f64> {
        // ---
        let (complete, flushed) = {
            let mut pending = self.pending.lock();

            // Sets that never completed are reported with what they have.
            let mut flushed = Vec::new();
            if pending.len() > self.max_in_flight {
                for _ in 0..=self.max_in_flight / 2 {
                    if let Some((_, times)) = pending.pop_first() {
                        flushed.push(times);
                    }
                }
            }

            let times = pending.entry(timestamp).or_default();
            times.push(now);
            let complete = if times.len() >= self.expected_occurrences {
                pending.remove(&timestamp)
            } else {
                None
            };
            (complete, flushed)
        };

        for times in &flushed {
            self.report(times, now);
        }
        complete.map(|times| self.report(&times, now))
    }

    /// Number of incomplete sets currently tracked.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn report(&self, times: &[Ticks], now: Ticks) -> f64 {
        // ---
        let (Some(oldest), Some(newest)) = (times.iter().min(), times.iter().max()) else {
            return 0.0;
        };
        let variance = newest.time_interval_since(*oldest);
        if let Some(metrics) = &self.metrics {
            metrics.gauge("variance_seconds", variance, now);
            metrics.gauge("variance_count", times.len() as f64, now);
        }
        variance
    }
}
