//! Shared building blocks for the MoQ playout core.
//!
//! Provides the monotonic tick clock, the single-slot [`Mailbox`] used for
//! cross-component hand-off, and the metrics/tracing plumbing shared by the
//! sender and receiver crates.

pub mod cli;
pub mod clock;
pub mod mailbox;
pub mod observability;

pub use cli::ColorWhen;
pub use clock::Ticks;
pub use mailbox::Mailbox;
pub use observability::{
    init_tracing, MemorySink, Metric, MetricRecord, MetricsContext, MetricsHandle,
    MetricsServerConfig, MetricsSink,
};
