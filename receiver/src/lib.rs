//! MoQ receive-side playout core.
//!
//! Buffers, reorders and paces received video objects, aligns their capture
//! clock with local time, schedules every stream's dequeues from one shared
//! coordinator, and chooses which simulcast rendition to display.

pub mod coordinator;
pub mod dequeuer;
pub mod jitter_buffer;
pub mod sim;
pub mod simulreceive;
pub mod stats;
pub mod stream;
pub mod time_align;
pub mod variance;
pub mod window;

pub use coordinator::{CoordinatorConfig, DequeueSchedulable, VideoDequeueCoordinator};
pub use dequeuer::{IntervalDequeuer, PidDequeuer, VideoDequeuer};
pub use jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterBufferStatus, JitterItem, ReadOutcome, WriteOutcome,
};
pub use simulreceive::{
    make_simulreceive_decision, Resolution, SimulreceiveChoiceReport, SimulreceiveConfig,
    SimulreceiveDecision, SimulreceiveItem, SimulreceiveMode, SimulreceiveOutcome,
    SimulreceiveReason, SimulreceiveSet, SimulreceiveSink,
};
pub use stats::{Rfc3550Jitter, StreamStats};
pub use stream::{FrameSink, PacingMode, PidGains, VideoStream, VideoStreamConfig};
pub use time_align::{TimeAlignable, TimeAligner, TimeAlignerConfig, TimeDiff};
pub use variance::VarianceCalculator;
pub use window::SlidingTimeWindow;
