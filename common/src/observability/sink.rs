//! The narrow metrics boundary used by playout components.
//!
//! Components never perform metrics I/O themselves. They record named
//! counters and gauges against an injected [`MetricsSink`]; what happens to
//! those values (Prometheus, in-memory capture, nothing) is the sink's
//! business.

use crate::clock::Ticks;
use parking_lot::Mutex;
use std::sync::Arc;

/// A single named observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Metric {
    /// Monotonic event count to add.
    Counter(&'static str, u64),

    /// Point-in-time value.
    Gauge(&'static str, f64),
}

impl Metric {
    pub fn field(&self) -> &'static str {
        match self {
            Metric::Counter(field, _) | Metric::Gauge(field, _) => field,
        }
    }
}

/// Destination for component metrics.
pub trait MetricsSink: Send + Sync {
    /// Records `metric` for the component identified by `source`.
    fn record(&self, source: &str, metric: Metric, timestamp: Ticks);
}

/// A sink bound to one source label.
///
/// Components hold an `Option<MetricsHandle>` so that metrics stay entirely
/// off the hot path when no sink is configured.
#[derive(Clone)]
pub struct MetricsHandle {
    // ---
    source: String,
    sink: Arc<dyn MetricsSink>,
}

impl MetricsHandle {
    // ---
    pub fn new(source: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            source: source.into(),
            sink,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn counter(&self, field: &'static str, count: u64, timestamp: Ticks) {
        self.sink
            .record(&self.source, Metric::Counter(field, count), timestamp);
    }

    pub fn gauge(&self, field: &'static str, value: f64, timestamp: Ticks) {
        self.sink
            .record(&self.source, Metric::Gauge(field, value), timestamp);
    }

    /// Counts against another source on the same sink, e.g. one track of a
    /// component that owns several.
    pub fn counter_for(&self, source: &str, field: &'static str, count: u64, timestamp: Ticks) {
        self.sink
            .record(source, Metric::Counter(field, count), timestamp);
    }
}

impl std::fmt::Debug for MetricsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHandle")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// One captured observation.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub source: String,
    pub metric: Metric,
    pub timestamp: Ticks,
}

/// Sink that keeps every record in memory, for tests and offline summaries.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<MetricRecord>>,
}

impl MemorySink {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }

    /// Sum of all counter increments recorded for `source`/`field`.
    pub fn counter_total(&self, source: &str, field: &str) -> u64 {
        // ---
        self.records
            .lock()
            .iter()
            .filter(|r| r.source == source)
            .filter_map(|r| match r.metric {
                Metric::Counter(f, n) if f == field => Some(n),
                _ => None,
            })
            .sum()
    }

    /// Most recent gauge value recorded for `source`/`field`.
    pub fn last_gauge(&self, source: &str, field: &str) -> Option<f64> {
        // ---
        self.records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.source == source)
            .find_map(|r| match r.metric {
                Metric::Gauge(f, v) if f == field => Some(v),
                _ => None,
            })
    }
}

impl MetricsSink for MemorySink {
    fn record(&self, source: &str, metric: Metric, timestamp: Ticks) {
        self.records.lock().push(MetricRecord {
            source: source.to_string(),
            metric,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn handle_tags_source() {
        // ---
        let sink = Arc::new(MemorySink::new());
        let handle = MetricsHandle::new("video/1", sink.clone());
        handle.counter("reads", 2, Ticks::ZERO);
        handle.counter("reads", 3, Ticks::ZERO);
        handle.gauge("depth_seconds", 0.2, Ticks::ZERO);
        handle.gauge("depth_seconds", 0.1, Ticks::ZERO);

        assert_eq!(sink.counter_total("video/1", "reads"), 5);
        assert_eq!(sink.counter_total("video/2", "reads"), 0);
        assert_eq!(sink.last_gauge("video/1", "depth_seconds"), Some(0.1));
        assert_eq!(sink.records().len(), 4);

        handle.counter_for("video/2", "reads", 1, Ticks::ZERO);
        assert_eq!(sink.counter_total("video/2", "reads"), 1);
        assert_eq!(sink.counter_total("video/1", "reads"), 5);
    }
}
