//! Statistics tracking for a received stream.
//!
//! Tracks write/read outcomes of the jitter buffer together with RFC 3550
//! interarrival jitter, for observability and quality monitoring.

use crate::jitter_buffer::WriteOutcome;
use moq_playout_common::{MetricsHandle, Ticks};
use std::time::Duration;
use tracing::info;

/// Smoothing factor applied on top of the RFC 3550 estimator.
const SMOOTHING_ALPHA: f64 = 0.1;

/// Interarrival jitter as defined by RFC 3550 §6.4.1.
///
/// `J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16`, where `D` is the change in
/// transit time (arrival minus capture) between consecutive objects.
#[derive(Debug, Clone, Default)]
pub struct Rfc3550Jitter {
    // ---
    transit: Option<f64>,

    /// Current jitter estimate in seconds.
    pub jitter: f64,

    /// Exponentially smoothed jitter in seconds.
    pub smoothed: f64,
}

impl Rfc3550Jitter {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one object captured at `timestamp` (sender seconds) that
    /// arrived at `arrival`.
    pub fn record(&mut self, timestamp: f64, arrival: Ticks) {
        // ---
        let transit = arrival.as_secs_f64() - timestamp;
        if let Some(previous) = self.transit.replace(transit) {
            let d = (transit - previous).abs();
            self.jitter += (d - self.jitter) / 16.0;
            self.smoothed = SMOOTHING_ALPHA * self.jitter + (1.0 - SMOOTHING_ALPHA) * self.smoothed;
        }
    }
}

/// Per-stream reception statistics.
///
/// Designed to be logged periodically; counters also feed the metrics sink
/// when one is configured.
#[derive(Debug, Clone)]
pub struct StreamStats {
    // ---
    /// Objects accepted into the jitter buffer
    pub objects_received: u64,

    /// Objects missing, detected via sequence gaps
    pub objects_lost: u64,

    /// Objects that arrived behind an already newer sequence
    pub objects_reordered: u64,

    /// Objects rejected as older than already played out media
    pub objects_late: u64,

    /// Objects evicted because the buffer was over capacity
    pub objects_evicted: u64,

    /// Objects released for rendering
    pub objects_played: u64,

    /// Reads that found nothing to play
    pub underruns: u64,

    /// Interarrival jitter
    pub jitter: Rfc3550Jitter,

    identifier: String,
    highest_sequence: Option<u64>,
    start_time: Option<Ticks>,
    last_log_time: Option<Ticks>,
    log_interval: Duration,
    metrics: Option<MetricsHandle>,
}

impl StreamStats {
    // ---
    /// Creates a new stats tracker that logs every `log_interval`.
    pub fn new(
        identifier: impl Into<String>,
        log_interval: Duration,
        metrics: Option<MetricsHandle>,
    ) -> Self {
        // ---
        Self {
            objects_received: 0,
            objects_lost: 0,
            objects_reordered: 0,
            objects_late: 0,
            objects_evicted: 0,
            objects_played: 0,
            underruns: 0,
            jitter: Rfc3550Jitter::new(),
            identifier: identifier.into(),
            highest_sequence: None,
            start_time: None,
            last_log_time: None,
            log_interval,
            metrics,
        }
    }

    /// Records the outcome of writing one object into the jitter buffer.
    pub fn record_write(
        &mut self,
        sequence: u64,
        timestamp: Duration,
        arrival: Ticks,
        outcome: WriteOutcome,
    ) {
        // ---
        self.start_time.get_or_insert(arrival);
        self.jitter.record(timestamp.as_secs_f64(), arrival);

        match outcome {
            WriteOutcome::Late => {
                self.objects_late += 1;
                self.maybe_log(arrival);
                return;
            }
            WriteOutcome::Overflow => {
                self.objects_evicted += 1;
                self.maybe_log(arrival);
                return;
            }
            WriteOutcome::Buffered { evicted } => {
                self.objects_received += 1;
                self.objects_evicted += evicted as u64;
            }
        }

        // Gaps count as loss until the missing objects show up late.
        match self.highest_sequence {
            Some(highest) if sequence > highest => {
                self.objects_lost += sequence - highest - 1;
                self.highest_sequence = Some(sequence);
            }
            Some(_) => {
                self.objects_reordered += 1;
                self.objects_lost = self.objects_lost.saturating_sub(1);
            }
            None => self.highest_sequence = Some(sequence),
        }

        if let Some(metrics) = &self.metrics {
            metrics.gauge("jitter", self.jitter.jitter, arrival);
            metrics.gauge("jitter_smoothed", self.jitter.smoothed, arrival);
        }
        self.maybe_log(arrival);
    }

    /// Records a read attempt.
    pub fn record_read(&mut self, played: bool, now: Ticks) {
        // ---
        if played {
            self.objects_played += 1;
        } else {
            self.underruns += 1;
        }
        self.maybe_log(now);
    }

    /// Calculates current loss percentage.
    pub fn loss_percentage(&self) -> f64 {
        // ---
        let total = self.objects_received + self.objects_lost;
        if total == 0 {
            0.0
        } else {
            (self.objects_lost as f64 / total as f64) * 100.0
        }
    }

    /// Seconds since the first recorded object.
    pub fn runtime(&self, now: Ticks) -> f64 {
        self.start_time
            .map_or(0.0, |start| now.time_interval_since(start).max(0.0))
    }

    fn maybe_log(&mut self, now: Ticks) {
        // ---
        let due = match self.last_log_time {
            Some(last) => now.time_interval_since(last) >= self.log_interval.as_secs_f64(),
            None => {
                self.last_log_time = Some(now);
                false
            }
        };
        if due {
            self.log(now);
            self.last_log_time = Some(now);
        }
    }

    /// Force log current statistics.
    pub fn log(&self, now: Ticks) {
        // ---
        info!(
            "{} stats over {:.1}s: {} received, {:.2}% loss, {} reordered, {} late, {} evicted, {} played, {} underruns, jitter {:.2}ms",
            self.identifier,
            self.runtime(now),
            self.objects_received,
            self.loss_percentage(),
            self.objects_reordered,
            self.objects_late,
            self.objects_evicted,
            self.objects_played,
            self.underruns,
            self.jitter.jitter * 1000.0
        );
    }
}
