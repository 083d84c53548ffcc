//! One received video track: jitter buffering, pacing, and hand-off to the
//! next stage.
//!
//! A [`VideoStream`] is registered with the dequeue coordinator. Objects from
//! the transport go in through [`VideoStream::receive`]; the coordinator
//! calls back when the head object is due and the stream passes it to its
//! [`FrameSink`].

use crate::coordinator::DequeueSchedulable;
use crate::dequeuer::{IntervalDequeuer, PidDequeuer, VideoDequeuer};
use crate::jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterItem, ReadOutcome, WriteOutcome,
};
use crate::stats::StreamStats;
use crate::time_align::{TimeAlignable, TimeAligner};
use crate::variance::VarianceCalculator;
use anyhow::{Context, Result};
use moq_playout_common::{MetricsHandle, MetricsSink, Ticks};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Consumer of frames released by a [`VideoStream`].
pub trait FrameSink<T>: Send + Sync {
    fn on_frame(&self, item: T, at: Ticks) -> Result<()>;
}

impl<T, F> FrameSink<T> for F
where
    F: Fn(T, Ticks) -> Result<()> + Send + Sync,
{
    fn on_frame(&self, item: T, at: Ticks) -> Result<()> {
        self(item, at)
    }
}

/// How the next dequeue deadline is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PacingMode {
    /// From the head item's timestamp and the shared clock estimate.
    #[default]
    Aligned,
    /// PID controller holding the buffer at its target depth.
    Pid,
    /// Fixed cadence anchored at the first arrival.
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 0.1,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoStreamConfig {
    // ---
    pub jitter: JitterBufferConfig,

    /// Expected spacing between frames; also the poll interval while the
    /// buffer is priming.
    pub frame_duration: Duration,

    pub pacing: PacingMode,
    pub pid: PidGains,

    /// How often to log a stats summary.
    pub stats_interval: Duration,
}

impl Default for VideoStreamConfig {
    fn default() -> Self {
        Self {
            jitter: JitterBufferConfig::default(),
            frame_duration: Duration::from_micros(33_333),
            pacing: PacingMode::Aligned,
            pid: PidGains::default(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

enum Pacer {
    Aligned,
    Pid(PidDequeuer),
    /// Anchored on the first write after creation or a flush.
    Interval(Option<IntervalDequeuer>),
}

pub struct VideoStream<T> {
    // ---
    identifier: String,
    config: VideoStreamConfig,
    alignable: TimeAlignable<T>,
    aligner: Arc<TimeAligner>,
    sink: Arc<dyn FrameSink<T>>,
    stats: Mutex<StreamStats>,
    pacer: Mutex<Pacer>,
    variance: Option<Arc<VarianceCalculator>>,
    force_next_sample: AtomicBool,
}

impl<T: JitterItem + Send + 'static> VideoStream<T> {
    // ---
    /// Creates the stream and attaches it to `aligner`.
    pub fn new(
        identifier: impl Into<String>,
        config: VideoStreamConfig,
        aligner: Arc<TimeAligner>,
        sink: Arc<dyn FrameSink<T>>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Self {
        // ---
        let identifier = identifier.into();
        let handle = metrics.map(|sink| MetricsHandle::new(identifier.clone(), sink));

        let buffer = Arc::new(JitterBuffer::new(
            identifier.clone(),
            config.jitter.clone(),
            handle.clone(),
        ));
        let alignable = TimeAlignable::new(buffer);
        aligner.attach(identifier.clone(), Arc::clone(alignable.time_diff()));

        let pacer = match config.pacing {
            PacingMode::Aligned => Pacer::Aligned,
            PacingMode::Pid => Pacer::Pid(PidDequeuer::new(
                config.jitter.min_depth,
                config.frame_duration,
                config.pid.kp,
                config.pid.ki,
                config.pid.kd,
            )),
            PacingMode::Interval => Pacer::Interval(None),
        };
        let stats = StreamStats::new(identifier.clone(), config.stats_interval, handle);

        Self {
            identifier,
            config,
            alignable,
            aligner,
            sink,
            stats: Mutex::new(stats),
            pacer: Mutex::new(pacer),
            variance: None,
            force_next_sample: AtomicBool::new(true),
        }
    }

    /// Feeds arrivals into a calculator shared with the other renditions of
    /// the same source.
    pub fn with_variance(mut self, variance: Arc<VarianceCalculator>) -> Self {
        self.variance = Some(variance);
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn jitter_buffer(&self) -> &Arc<JitterBuffer<T>> {
        self.alignable.jitter_buffer()
    }

    /// Accepts an object from the transport.
    pub fn receive(&self, item: T, arrival: Ticks) -> WriteOutcome {
        // ---
        let sequence = item.sequence_number();
        let timestamp = item.timestamp();

        let force = self.force_next_sample.swap(false, Ordering::AcqRel);
        self.aligner
            .do_timestamp_time_diff(timestamp.as_secs_f64(), arrival, force);
        if let Some(variance) = &self.variance {
            variance.calculate_set_variance(timestamp, arrival);
        }

        let outcome = self.jitter_buffer().write(item, arrival);
        self.stats
            .lock()
            .record_write(sequence, timestamp, arrival, outcome);

        if outcome.accepted() {
            if let Pacer::Interval(dequeuer @ None) = &mut *self.pacer.lock() {
                *dequeuer = Some(IntervalDequeuer::new(
                    self.config.jitter.min_depth,
                    self.config.frame_duration,
                    arrival,
                ));
            }
        }
        outcome
    }

    /// Drops everything buffered, e.g. on a discontinuity. The next object
    /// re-seeds time alignment.
    pub fn flush(&self, now: Ticks) -> usize {
        // ---
        let dropped = self.jitter_buffer().flush(now);
        if let Pacer::Interval(dequeuer) = &mut *self.pacer.lock() {
            *dequeuer = None;
        }
        self.force_next_sample.store(true, Ordering::Release);
        dropped
    }

    /// Detaches from the aligner and logs final stats. The caller unregisters
    /// the stream from the coordinator.
    pub fn close(&self, now: Ticks) {
        // ---
        self.aligner.detach(&self.identifier);
        self.stats.lock().log(now);
        debug!("{} closed", self.identifier);
    }

    /// Seconds until the next frame is due under the configured pacing.
    pub fn wait_time(&self, from: Ticks) -> Option<f64> {
        // ---
        match &mut *self.pacer.lock() {
            Pacer::Aligned => self.alignable.calculate_wait_time(from),
            Pacer::Pid(pid) => {
                pid.current_depth = self.jitter_buffer().depth();
                Some(pid.calculate_wait_time(from))
            }
            Pacer::Interval(dequeuer) => dequeuer.as_mut().map(|d| d.calculate_wait_time(from)),
        }
    }

    pub fn stats<R>(&self, f: impl FnOnce(&StreamStats) -> R) -> R {
        f(&self.stats.lock())
    }
}

impl<T: JitterItem + Send + 'static> DequeueSchedulable for VideoStream<T> {
    fn dequeue_identifier(&self) -> &str {
        &self.identifier
    }

    fn calculate_next_deadline(&self, from: Ticks) -> Option<Ticks> {
        // ---
        let wait = if self.jitter_buffer().ready() {
            self.wait_time(from)
        } else {
            None
        };
        let wait = wait.unwrap_or_else(|| self.config.frame_duration.as_secs_f64());
        Some(from.adding_time_interval(wait.max(0.0)))
    }

    fn process_frame(&self, at: Ticks) -> Result<bool> {
        // ---
        let item = match self.jitter_buffer().try_read(at) {
            ReadOutcome::Item(item) => item,
            ReadOutcome::Underrun => {
                self.stats.lock().record_read(false, at);
                return Ok(false);
            }
            // Not playing yet, so nothing was expected.
            ReadOutcome::Priming | ReadOutcome::Paused => return Ok(false),
        };
        self.stats.lock().record_read(true, at);
        if let Pacer::Interval(Some(dequeuer)) = &mut *self.pacer.lock() {
            dequeuer.dequeued_count += 1;
        }
        self.sink
            .on_frame(item, at)
            .with_context(|| format!("{}: frame sink failed", self.identifier))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::time_align::TimeAlignerConfig;
    use anyhow::bail;
    use moq_playout_common::MemorySink;

    #[derive(Debug, Clone, PartialEq)]
    struct Frame {
        seq: u64,
        ts: Duration,
    }

    impl JitterItem for Frame {
        fn sequence_number(&self) -> u64 {
            self.seq
        }

        fn timestamp(&self) -> Duration {
            self.ts
        }

        fn duration(&self) -> Duration {
            Duration::from_millis(100)
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame {
            seq,
            ts: Duration::from_millis(5_000 + seq * 100),
        }
    }

    fn base() -> Ticks {
        Ticks::from_secs_f64(50.0)
    }

    type Played = Arc<Mutex<Vec<u64>>>;

    fn stream(pacing: PacingMode) -> (VideoStream<Frame>, Played, Arc<TimeAligner>) {
        // ---
        let played: Played = Arc::default();
        let sink_played = Arc::clone(&played);
        let sink = move |frame: Frame, _at: Ticks| -> Result<()> {
            sink_played.lock().push(frame.seq);
            Ok(())
        };
        let aligner = Arc::new(TimeAligner::new(TimeAlignerConfig::default()));
        let config = VideoStreamConfig {
            pacing,
            frame_duration: Duration::from_millis(100),
            ..Default::default()
        };
        let stream = VideoStream::new("cam/hd", config, Arc::clone(&aligner), Arc::new(sink), None);
        (stream, played, aligner)
    }

    #[test]
    fn priming_polls_at_frame_duration() {
        // ---
        let (stream, played, _) = stream(PacingMode::Aligned);
        stream.receive(frame(0), base());

        let deadline = stream.calculate_next_deadline(base()).expect("always scheduled");
        assert!((deadline.time_interval_since(base()) - 0.1).abs() < 1e-6);
        assert!(!stream.process_frame(deadline).expect("no error"));
        assert!(played.lock().is_empty());
    }

    #[test]
    fn priming_polls_are_not_underruns() {
        // ---
        let (stream, _, _) = stream(PacingMode::Aligned);
        stream.receive(frame(0), base());
        for i in 0..5 {
            let at = base().adding_time_interval(i as f64 * 0.1);
            assert!(!stream.process_frame(at).expect("no error"));
        }
        assert_eq!(stream.stats(|s| s.underruns), 0);
        assert_eq!(stream.jitter_buffer().status().underruns, 0);

        // Prime, drain, then poll an empty playing buffer once.
        stream.receive(frame(1), base());
        let at = base().adding_time_interval(1.0);
        assert!(stream.process_frame(at).expect("no error"));
        assert!(stream.process_frame(at).expect("no error"));
        assert!(!stream.process_frame(at).expect("no error"));
        assert_eq!(stream.stats(|s| s.underruns), 1);
        assert_eq!(stream.jitter_buffer().status().underruns, 1);
        assert_eq!(stream.stats(|s| s.objects_played), 2);
    }

    #[test]
    fn aligned_deadline_follows_clock_estimate() {
        // ---
        let (stream, played, aligner) = stream(PacingMode::Aligned);
        stream.receive(frame(0), base());
        stream.receive(frame(1), base().adding_time_interval(0.1));
        assert_eq!(aligner.attached(), 1);

        // Head captured at 5.0s arrived at 50.0s: due 200ms after arrival.
        let from = base().adding_time_interval(0.1);
        let deadline = stream.calculate_next_deadline(from).expect("scheduled");
        assert!((deadline.time_interval_since(base()) - 0.2).abs() < 1e-6);

        assert!(stream.process_frame(deadline).expect("no error"));
        assert_eq!(*played.lock(), vec![0]);

        // Next head is one frame later.
        let deadline = stream.calculate_next_deadline(deadline).expect("scheduled");
        assert!((deadline.time_interval_since(base()) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn overdue_frame_is_due_immediately() {
        // ---
        let (stream, _, _) = stream(PacingMode::Aligned);
        stream.receive(frame(0), base());
        stream.receive(frame(1), base());
        let late = base().adding_time_interval(1.0);
        assert_eq!(stream.calculate_next_deadline(late), Some(late));
    }

    #[test]
    fn interval_pacing_counts_dequeues() {
        // ---
        let (stream, _, _) = stream(PacingMode::Interval);
        assert_eq!(stream.wait_time(base()), None);

        stream.receive(frame(0), base());
        stream.receive(frame(1), base());
        assert!((stream.wait_time(base()).expect("anchored") - 0.2).abs() < 1e-6);

        let at = base().adding_time_interval(0.2);
        assert!(stream.process_frame(at).expect("no error"));
        assert!((stream.wait_time(at).expect("anchored") - 0.1).abs() < 1e-6);

        stream.flush(at);
        assert_eq!(stream.wait_time(at), None);
    }

    #[test]
    fn pid_pacing_tracks_depth() {
        // ---
        let (stream, _, _) = stream(PacingMode::Pid);
        stream.receive(frame(0), base());
        stream.receive(frame(1), base());
        stream.receive(frame(2), base());
        // 300ms buffered against a 200ms target: dequeue faster than 100ms.
        assert!(stream.wait_time(base()).expect("pid") < 0.1);
    }

    #[test]
    fn late_object_is_counted() {
        // ---
        let sink = Arc::new(MemorySink::new());
        let aligner = Arc::new(TimeAligner::new(TimeAlignerConfig::default()));
        let stream = VideoStream::new(
            "cam/sd",
            VideoStreamConfig {
                jitter: JitterBufferConfig {
                    min_depth: Duration::ZERO,
                    ..Default::default()
                },
                ..Default::default()
            },
            aligner,
            Arc::new(|_: Frame, _: Ticks| -> Result<()> { Ok(()) }),
            Some(sink.clone() as Arc<dyn MetricsSink>),
        );
        stream.receive(frame(1), base());
        assert!(stream.process_frame(base()).expect("no error"));
        assert_eq!(stream.receive(frame(0), base()), WriteOutcome::Late);

        assert_eq!(stream.stats(|s| s.objects_late), 1);
        assert_eq!(sink.counter_total("cam/sd", "late_writes"), 1);
        assert_eq!(sink.counter_total("cam/sd", "reads"), 1);
    }

    #[test]
    fn sink_error_propagates_with_context() {
        // ---
        let aligner = Arc::new(TimeAligner::new(TimeAlignerConfig::default()));
        let stream = VideoStream::new(
            "cam/broken",
            VideoStreamConfig {
                jitter: JitterBufferConfig {
                    min_depth: Duration::ZERO,
                    ..Default::default()
                },
                ..Default::default()
            },
            Arc::clone(&aligner),
            Arc::new(|_: Frame, _: Ticks| -> Result<()> { bail!("decoder gone") }),
            None,
        );
        stream.receive(frame(0), base());
        let err = stream.process_frame(base()).expect_err("sink fails");
        assert!(format!("{err:#}").contains("cam/broken"));

        stream.close(base());
        assert_eq!(aligner.attached(), 0);
    }
}
