//! Deterministic simulcast playout simulation.
//!
//! Generates N renditions of one video source with configurable loss and
//! arrival jitter, then drives them through the full receive pipeline
//! ([`VideoStream`] per rendition, one [`SimulreceiveSet`], one
//! [`VideoDequeueCoordinator`]) on a virtual clock. Nothing sleeps; the
//! coordinator is serviced at each deadline directly.

use crate::coordinator::{CoordinatorConfig, DequeueSchedulable, VideoDequeueCoordinator};
use crate::jitter_buffer::JitterItem;
use crate::simulreceive::{
    Resolution, SimulreceiveConfig, SimulreceiveItem, SimulreceiveSet, SimulreceiveSink,
};
use crate::stream::{VideoStream, VideoStreamConfig};
use crate::time_align::{TimeAligner, TimeAlignerConfig};
use crate::variance::{VarianceCalculator, DEFAULT_MAX_IN_FLIGHT};
use anyhow::{ensure, Result};
use moq_playout_common::{MetricsHandle, MetricsSink, Ticks};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Network and source settings for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulcastConfig {
    // ---
    /// One entry per rendition, highest quality first.
    pub renditions: Vec<Resolution>,

    pub fps: u32,

    /// Media duration to generate.
    pub duration: Duration,

    /// Object loss rate (0.0 to 1.0), applied per rendition.
    pub loss_rate: f64,

    /// Fixed one-way delay.
    pub base_delay: Duration,

    /// Extra random delay, uniform in `0..=jitter`.
    pub jitter: Duration,

    /// Random seed for deterministic runs.
    pub seed: Option<u64>,

    /// Capture time of the first frame on the sender's clock.
    pub first_timestamp: Duration,
}

impl Default for SimulcastConfig {
    fn default() -> Self {
        // ---
        Self {
            renditions: vec![
                Resolution::new(1920, 1080),
                Resolution::new(1280, 720),
                Resolution::new(640, 360),
            ],
            fps: 30,
            duration: Duration::from_secs(5),
            loss_rate: 0.0,
            base_delay: Duration::from_millis(40),
            jitter: Duration::ZERO,
            seed: None,
            first_timestamp: Duration::from_secs(1_000),
        }
    }
}

impl SimulcastConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }

    pub fn track_name(&self, index: usize) -> String {
        let resolution = self.renditions.get(index).copied().unwrap_or_default();
        format!("video/{}p", resolution.height)
    }
}

/// A simulated encoded video object.
#[derive(Debug, Clone, PartialEq)]
pub struct SimFrame {
    pub rendition: usize,
    pub sequence: u64,
    pub timestamp: Duration,
    pub duration: Duration,
}

impl JitterItem for SimFrame {
    fn sequence_number(&self) -> u64 {
        self.sequence
    }

    fn timestamp(&self) -> Duration {
        self.timestamp
    }

    fn duration(&self) -> Duration {
        self.duration
    }
}

/// A frame and the virtual time it reaches the receiver.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub at: Ticks,
    pub frame: SimFrame,
}

/// Applies loss and jitter to the simulcast source.
pub struct NetworkSimulator {
    // ---
    config: SimulcastConfig,
    rng: StdRng,
    pub objects_sent: u64,
    pub objects_lost: u64,
}

impl NetworkSimulator {
    // ---
    pub fn new(config: SimulcastConfig) -> Self {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng,
            objects_sent: 0,
            objects_lost: 0,
        }
    }

    /// Generates every arrival for the configured duration, with the first
    /// frame captured at `start`, sorted by arrival time.
    pub fn arrivals(&mut self, start: Ticks) -> Vec<Arrival> {
        // ---
        let frame_duration = self.config.frame_duration();
        let frames = (self.config.duration.as_secs_f64() * self.config.fps as f64).round() as u64;
        let mut arrivals = Vec::new();

        for sequence in 0..frames {
            let offset = frame_duration * sequence as u32;
            for rendition in 0..self.config.renditions.len() {
                self.objects_sent += 1;
                if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate.min(1.0)) {
                    self.objects_lost += 1;
                    continue;
                }
                let jitter = if self.config.jitter.is_zero() {
                    Duration::ZERO
                } else {
                    self.rng.gen_range(Duration::ZERO..=self.config.jitter)
                };
                arrivals.push(Arrival {
                    at: start + offset + self.config.base_delay + jitter,
                    frame: SimFrame {
                        rendition,
                        sequence,
                        timestamp: self.config.first_timestamp + offset,
                        duration: frame_duration,
                    },
                });
            }
        }
        arrivals.sort_by_key(|a| a.at);
        arrivals
    }
}

/// Summary of a simulation run.
#[derive(Debug, Clone, Default)]
pub struct SimulationReport {
    // ---
    pub objects_sent: u64,
    pub objects_lost: u64,

    /// Display count per rendition, in rendition order.
    pub displayed: Vec<(String, u64)>,

    /// Timestamps of displayed frames, in display order.
    pub display_timestamps: Vec<Duration>,

    pub late_objects: u64,
    pub underruns: u64,
    pub coordinator_passes: u64,
}

impl SimulationReport {
    pub fn total_displayed(&self) -> u64 {
        self.displayed.iter().map(|(_, n)| n).sum()
    }
}

#[derive(Default)]
struct DisplayLog {
    shown: Mutex<Vec<(String, Duration)>>,
}

impl SimulreceiveSink<SimFrame> for DisplayLog {
    fn display(&self, item: &SimulreceiveItem<SimFrame>, _at: Ticks) {
        self.shown.lock().push((item.track.clone(), item.timestamp));
    }
}

/// Runs the receive pipeline over a simulated simulcast source.
pub fn run_simulation(
    sim: SimulcastConfig,
    stream_config: VideoStreamConfig,
    simulreceive: SimulreceiveConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
) -> Result<SimulationReport> {
    // ---
    ensure!(!sim.renditions.is_empty(), "at least one rendition is required");
    ensure!(sim.fps > 0, "fps must be positive");

    let start = Ticks::from_secs_f64(1.0);
    let end = start + sim.duration + sim.base_delay + sim.jitter + Duration::from_secs(1);
    let tracks: Vec<String> = (0..sim.renditions.len()).map(|i| sim.track_name(i)).collect();

    let mut network = NetworkSimulator::new(sim.clone());
    let arrivals = network.arrivals(start);
    info!(
        "simulating {} renditions at {}fps for {:?}: {} objects, {} lost",
        tracks.len(),
        sim.fps,
        sim.duration,
        network.objects_sent,
        network.objects_lost
    );

    let aligner = Arc::new(TimeAligner::new(TimeAlignerConfig::default()));
    let handle = |source: &str| {
        metrics
            .clone()
            .map(|sink| MetricsHandle::new(source.to_owned(), sink))
    };
    let coordinator = VideoDequeueCoordinator::new(CoordinatorConfig::default(), handle("coordinator"));
    let variance = Arc::new(VarianceCalculator::new(
        tracks.len(),
        DEFAULT_MAX_IN_FLIGHT,
        handle("simulcast"),
    ));

    let log = Arc::new(DisplayLog::default());
    let set = Arc::new(SimulreceiveSet::new(
        "participant",
        SimulreceiveConfig {
            poll_interval: sim.frame_duration() / 2,
            ..simulreceive
        },
        log.clone(),
        handle("participant"),
    ));

    let mut streams = Vec::with_capacity(tracks.len());
    for (index, track) in tracks.iter().enumerate() {
        set.add_track(track.clone());
        let resolution = sim.renditions[index];
        let sink_set = Arc::clone(&set);
        let sink_track = track.clone();
        let last_played: Mutex<Option<u64>> = Mutex::new(None);

        // Stands in for the decoder: anything after a gap decodes with
        // artifacts until the next frame in sequence.
        let decode = move |frame: SimFrame, _at: Ticks| -> Result<()> {
            let discontinuous = {
                let mut last = last_played.lock();
                let gap = last.is_some_and(|l| frame.sequence != l + 1);
                *last = Some(frame.sequence);
                gap
            };
            sink_set.offer(SimulreceiveItem {
                track: sink_track.clone(),
                timestamp: frame.timestamp,
                image: frame,
                discontinuous,
                resolution,
            });
            Ok(())
        };

        let stream = Arc::new(
            VideoStream::new(
                track.clone(),
                VideoStreamConfig {
                    frame_duration: sim.frame_duration(),
                    ..stream_config.clone()
                },
                Arc::clone(&aligner),
                Arc::new(decode),
                metrics.clone(),
            )
            .with_variance(Arc::clone(&variance)),
        );
        coordinator.register_from(Arc::clone(&stream) as Arc<dyn DequeueSchedulable>, start);
        streams.push(stream);
    }
    coordinator.register_from(Arc::clone(&set) as Arc<dyn DequeueSchedulable>, start);

    let mut report = SimulationReport {
        objects_sent: network.objects_sent,
        objects_lost: network.objects_lost,
        ..Default::default()
    };

    let mut pending = arrivals.into_iter().peekable();
    loop {
        let wakeup = coordinator.next_wakeup();
        let next_arrival = pending.peek().map(|a| a.at);
        match (next_arrival, wakeup) {
            (Some(at), Some(deadline)) if at <= deadline => {}
            (Some(_), None) => {}
            (_, Some(deadline)) if deadline <= end => {
                coordinator.service(deadline);
                report.coordinator_passes += 1;
                continue;
            }
            _ => break,
        }
        if let Some(arrival) = pending.next() {
            streams[arrival.frame.rendition].receive(arrival.frame, arrival.at);
        }
    }

    for stream in &streams {
        stream.close(end);
        coordinator.unregister(stream.identifier());
        stream.stats(|s| {
            report.late_objects += s.objects_late;
            report.underruns += s.underruns;
        });
    }
    coordinator.unregister(set.identifier());

    let shown = log.shown.lock();
    report.displayed = tracks
        .iter()
        .map(|track| {
            let count = shown.iter().filter(|(t, _)| t == track).count() as u64;
            (track.clone(), count)
        })
        .collect();
    report.display_timestamps = shown.iter().map(|(_, ts)| *ts).collect();
    debug!("simulation finished after {} coordinator passes", report.coordinator_passes);
    Ok(report)
}
