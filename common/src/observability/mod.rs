//! Observability utilities (metrics + tracing).

mod metrics;
mod sink;
mod tracing;

pub use metrics::{MetricsContext, MetricsServerConfig};
pub use sink::{MemorySink, Metric, MetricRecord, MetricsHandle, MetricsSink};
pub use tracing::init_tracing;
