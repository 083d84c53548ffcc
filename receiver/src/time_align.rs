//! Clock alignment between sender capture time and local playout time.
//!
//! Every stream carries presentation timestamps on the sender's capture
//! clock. The [`TimeAligner`] keeps a short window of observed
//! `arrival - capture` offsets and publishes the least-delayed one to each
//! attached stream's [`TimeDiff`], from which per-item playout deadlines are
//! derived.

use crate::jitter_buffer::{JitterBuffer, JitterItem};
use crate::window::SlidingTimeWindow;
use moq_playout_common::{Mailbox, Ticks};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Latest estimate of receiver time minus capture time, in seconds.
#[derive(Debug, Default)]
pub struct TimeDiff {
    diff: Mailbox<f64>,
}

impl TimeDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time_diff(&self, diff: f64) {
        self.diff.set(diff);
    }

    /// `None` until a first estimate has been published.
    pub fn time_diff(&self) -> Option<f64> {
        self.diff.get()
    }

    pub fn clear(&self) {
        self.diff.clear();
    }
}

/// A jitter buffer paired with the clock offset used to schedule it.
pub struct TimeAlignable<T> {
    jitter_buffer: Arc<JitterBuffer<T>>,
    time_diff: Arc<TimeDiff>,
}

impl<T: JitterItem> TimeAlignable<T> {
    // ---
    pub fn new(jitter_buffer: Arc<JitterBuffer<T>>) -> Self {
        Self {
            jitter_buffer,
            time_diff: Arc::new(TimeDiff::new()),
        }
    }

    pub fn jitter_buffer(&self) -> &Arc<JitterBuffer<T>> {
        &self.jitter_buffer
    }

    /// The slot a [`TimeAligner`] publishes into; see [`TimeAligner::attach`].
    pub fn time_diff(&self) -> &Arc<TimeDiff> {
        &self.time_diff
    }

    /// Seconds until the oldest buffered item is due.
    ///
    /// `None` when nothing is buffered or no clock estimate exists yet. This
    /// is distinct from a zero wait.
    pub fn calculate_wait_time(&self, from: Ticks) -> Option<f64> {
        let offset = self.time_diff.time_diff()?;
        self.jitter_buffer.calculate_wait_time(from, offset)
    }

    /// Seconds until `item` is due, whether or not it is buffered.
    pub fn calculate_wait_time_for(&self, item: &T, from: Ticks) -> Option<f64> {
        let offset = self.time_diff.time_diff()?;
        Some(
            self.jitter_buffer
                .calculate_wait_time_for(item.timestamp(), from, offset),
        )
    }
}

/// Time aligner configuration.
#[derive(Debug, Clone)]
pub struct TimeAlignerConfig {
    // ---
    /// How far back offset samples are considered.
    pub window_length: Duration,

    /// Samples reserved up front in the window.
    pub capacity: usize,

    /// Minimum spacing between unforced recomputations of the estimate.
    pub maintenance_interval: Duration,
}

impl Default for TimeAlignerConfig {
    fn default() -> Self {
        Self {
            window_length: Duration::from_secs(5),
            capacity: 150,
            maintenance_interval: Duration::from_millis(250),
        }
    }
}

struct AlignerState {
    window: SlidingTimeWindow<f64>,
    last_maintenance: Option<Ticks>,
}

/// Shared clock-offset estimator for a set of aligned streams.
///
/// Streams are attached explicitly by identifier and detached when torn
/// down. The estimate is the minimum offset in the window: a sample held up
/// in the network has a larger offset and so never drags the estimate.
pub struct TimeAligner {
    // ---
    config: TimeAlignerConfig,
    state: Mutex<AlignerState>,
    estimate: TimeDiff,
    alignables: Mutex<HashMap<String, Arc<TimeDiff>>>,
}

impl TimeAligner {
    // ---
    pub fn new(config: TimeAlignerConfig) -> Self {
        // ---
        let window = SlidingTimeWindow::new(config.window_length, config.capacity);
        Self {
            config,
            state: Mutex::new(AlignerState {
                window,
                last_maintenance: None,
            }),
            estimate: TimeDiff::new(),
            alignables: Mutex::new(HashMap::new()),
        }
    }

    /// Starts publishing to `time_diff`, seeding it with the current estimate.
    /// Replaces any slot already attached under `identifier`.
    pub fn attach(&self, identifier: impl Into<String>, time_diff: Arc<TimeDiff>) {
        // ---
        if let Some(estimate) = self.estimate.time_diff() {
            time_diff.set_time_diff(estimate);
        }
        self.alignables.lock().insert(identifier.into(), time_diff);
    }

    /// Returns whether anything was attached under `identifier`.
    pub fn detach(&self, identifier: &str) -> bool {
        self.alignables.lock().remove(identifier).is_some()
    }

    pub fn attached(&self) -> usize {
        self.alignables.lock().len()
    }

    /// Current estimate, if any samples remain in the window.
    pub fn estimate(&self) -> Option<f64> {
        self.estimate.time_diff()
    }

    /// Records that an object captured at `timestamp` seconds arrived at
    /// `when`.
    ///
    /// The estimate is recomputed and published immediately when `force` is
    /// set (first object of a stream) or when none exists yet. Otherwise it
    /// is refreshed at most once per maintenance interval.
    pub fn do_timestamp_time_diff(&self, timestamp: f64, when: Ticks, force: bool) {
        // ---
        let diff = when.as_secs_f64() - timestamp;
        let due = {
            let mut state = self.state.lock();
            state.window.add(when, diff);
            force
                || state.last_maintenance.map_or(true, |last| {
                    when.time_interval_since(last) >= self.config.maintenance_interval.as_secs_f64()
                })
        };
        trace!("time diff sample {diff:.6}s (force={force})");

        if due || self.estimate.time_diff().is_none() {
            self.maintain(when);
        }
    }

    /// Recomputes the estimate from the window as seen at `now` and publishes
    /// it to every attached stream.
    ///
    /// When the window has emptied the estimate is cleared; attached streams
    /// keep their last value.
    pub fn maintain(&self, now: Ticks) -> Option<f64> {
        // ---
        let estimate = {
            let mut state = self.state.lock();
            state.last_maintenance = Some(now);
            state.window.get(now).into_iter().reduce(f64::min)
        };

        let Some(estimate) = estimate else {
            if self.estimate.time_diff().is_some() {
                debug!("time diff window empty, clearing estimate");
            }
            self.estimate.clear();
            return None;
        };

        self.estimate.set_time_diff(estimate);
        for time_diff in self.alignables.lock().values() {
            time_diff.set_time_diff(estimate);
        }
        Some(estimate)
    }

    /// Runs [`maintain`](Self::maintain) every maintenance interval until the
    /// aligner is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        // ---
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.maintenance_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(aligner) = weak.upgrade() else {
                    break;
                };
                aligner.maintain(Ticks::now());
            }
            debug!("time aligner dropped, maintenance stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn base() -> Ticks {
        Ticks::from_secs_f64(100.0)
    }

    fn aligner() -> TimeAligner {
        TimeAligner::new(TimeAlignerConfig {
            window_length: Duration::from_secs(1),
            ..Default::default()
        })
    }

    #[test]
    fn time_diff_get_set() {
        // ---
        for value in [-100.0, -0.1, 0.1, 100.0, 0.0] {
            let diff = TimeDiff::new();
            diff.set_time_diff(value);
            assert_eq!(diff.time_diff(), Some(value));
        }
        let diff = TimeDiff::new();
        assert_eq!(diff.time_diff(), None);
        diff.set_time_diff(1.0);
        diff.clear();
        assert_eq!(diff.time_diff(), None);
    }

    #[test]
    fn first_sample_sets_estimate() {
        // ---
        let aligner = aligner();
        assert_eq!(aligner.estimate(), None);
        aligner.do_timestamp_time_diff(40.0, base(), false);
        let estimate = aligner.estimate().expect("estimate set");
        assert!((estimate - 60.0).abs() < 1e-6);
    }

    #[test]
    fn delayed_sample_does_not_move_estimate() {
        // ---
        let aligner = aligner();
        aligner.do_timestamp_time_diff(40.0, base(), true);
        // Captured 50ms later, arrived 100ms later.
        aligner.do_timestamp_time_diff(40.05, base().adding_time_interval(0.1), true);
        let estimate = aligner.estimate().expect("estimate set");
        assert!((estimate - 60.0).abs() < 1e-6);

        // A faster path lowers it.
        aligner.do_timestamp_time_diff(40.15, base().adding_time_interval(0.12), true);
        let estimate = aligner.estimate().expect("estimate set");
        assert!((estimate - 59.97).abs() < 1e-6);
    }

    #[test]
    fn unforced_updates_are_rate_limited() {
        // ---
        let aligner = aligner();
        aligner.do_timestamp_time_diff(40.0, base(), false);

        // Faster sample inside the interval is recorded but not yet published.
        aligner.do_timestamp_time_diff(40.1, base().adding_time_interval(0.05), false);
        assert!((aligner.estimate().expect("set") - 60.0).abs() < 1e-6);

        aligner.do_timestamp_time_diff(40.3, base().adding_time_interval(0.3), false);
        assert!((aligner.estimate().expect("set") - 59.95).abs() < 1e-6);
    }

    #[test]
    fn attach_seeds_and_publishes() {
        // ---
        let aligner = aligner();
        let early = Arc::new(TimeDiff::new());
        aligner.attach("early", early.clone());
        assert_eq!(early.time_diff(), None);

        aligner.do_timestamp_time_diff(40.0, base(), true);
        assert!((early.time_diff().expect("published") - 60.0).abs() < 1e-6);

        let late = Arc::new(TimeDiff::new());
        aligner.attach("late", late.clone());
        assert!((late.time_diff().expect("seeded") - 60.0).abs() < 1e-6);

        assert!(aligner.detach("early"));
        assert!(!aligner.detach("early"));
        aligner.do_timestamp_time_diff(41.0, base().adding_time_interval(0.5), true);
        assert!((early.time_diff().expect("kept") - 60.0).abs() < 1e-6);
        assert!((late.time_diff().expect("updated") - 59.5).abs() < 1e-6);
        assert_eq!(aligner.attached(), 1);
    }

    #[test]
    fn maintenance_expires_old_samples() {
        // ---
        let aligner = aligner();
        aligner.do_timestamp_time_diff(40.0, base(), true);
        assert!(aligner.maintain(base().adding_time_interval(0.5)).is_some());
        assert_eq!(aligner.maintain(base().adding_time_interval(2.0)), None);
        assert_eq!(aligner.estimate(), None);
    }

    #[tokio::test]
    async fn maintenance_task_stops_when_dropped() {
        // ---
        let aligner = Arc::new(TimeAligner::new(TimeAlignerConfig {
            maintenance_interval: Duration::from_millis(5),
            ..Default::default()
        }));
        let task = aligner.spawn_maintenance();
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(aligner);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task ends")
            .expect("task not panicked");
    }
}
