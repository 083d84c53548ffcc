//! Sliding time window of timestamped samples.

use moq_playout_common::Ticks;
use std::collections::VecDeque;
use std::time::Duration;

/// Container for a sliding window of values whose validity is determined by
/// age.
#[derive(Debug, Clone)]
pub struct SlidingTimeWindow<T> {
    // ---
    values: VecDeque<(Ticks, T)>,
    length: Duration,
}

impl<T: Copy> SlidingTimeWindow<T> {
    // ---
    /// Creates a window covering `length`, reserving room for `reserved`
    /// samples up front.
    pub fn new(length: Duration, reserved: usize) -> Self {
        // ---
        Self {
            values: VecDeque::with_capacity(reserved),
            length,
        }
    }

    /// Adds a value, dropping anything older than the window relative to
    /// `timestamp`.
    pub fn add(&mut self, timestamp: Ticks, value: T) {
        // ---
        let length = self.length.as_secs_f64();
        while let Some((oldest, _)) = self.values.front() {
            if timestamp.time_interval_since(*oldest) <= length {
                break;
            }
            self.values.pop_front();
        }
        self.values.push_back((timestamp, value));
    }

    /// All values no older than the window, as seen from `from`.
    pub fn get(&self, from: Ticks) -> Vec<T> {
        // ---
        let length = self.length.as_secs_f64();
        self.values
            .iter()
            .filter(|(timestamp, _)| from.time_interval_since(*timestamp) <= length)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn drops_expired_on_add() {
        // ---
        let t0 = Ticks::from_secs_f64(50.0);
        let mut window = SlidingTimeWindow::new(Duration::from_secs(1), 4);
        window.add(t0, 1);
        window.add(t0.adding_time_interval(0.5), 2);
        window.add(t0.adding_time_interval(1.2), 3);

        assert_eq!(window.len(), 2);
        assert_eq!(window.get(t0.adding_time_interval(1.2)), vec![2, 3]);
    }

    #[test]
    fn get_filters_by_query_time() {
        // ---
        let t0 = Ticks::from_secs_f64(50.0);
        let mut window = SlidingTimeWindow::new(Duration::from_secs(1), 4);
        window.add(t0, 1.0);
        window.add(t0.adding_time_interval(0.8), 2.0);

        assert_eq!(window.get(t0.adding_time_interval(1.5)), vec![2.0]);
        assert!(window.get(t0.adding_time_interval(5.0)).is_empty());
        // Expiry on read is a view, storage is only trimmed by add.
        assert_eq!(window.len(), 2);
    }
}
