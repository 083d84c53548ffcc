//! Jitter buffer for media object reordering and delay compensation.
//!
//! Buffers timestamped objects for one subscribed stream, releases them in
//! presentation order once a minimum depth has accumulated, and refuses late
//! arrivals that would reorder media already handed to the renderer.

use moq_playout_common::{MetricsHandle, Ticks};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// Anything the jitter buffer can hold.
///
/// Timestamps are presentation times on the sender's media timeline.
pub trait JitterItem {
    fn sequence_number(&self) -> u64;

    fn timestamp(&self) -> Duration;

    /// Media duration covered by this item; sums to the buffer depth.
    fn duration(&self) -> Duration;
}

/// Jitter buffer configuration.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    /// Media that must be buffered before the first release. Also the initial
    /// base target depth used for playout deadlines.
    pub min_depth: Duration,

    /// Maximum items held; the oldest are evicted beyond this.
    pub capacity: usize,

    /// Sort on insert. Disable only when the source guarantees arrival order.
    pub sort: bool,

    /// Release items as soon as primed. When false, nothing is released until
    /// [`JitterBuffer::start_playing`] is called.
    pub playing_from_start: bool,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        // ---
        Self {
            min_depth: Duration::from_millis(200),
            capacity: 150, // 5s of 30fps video
            sort: true,
            playing_from_start: true,
        }
    }
}

/// Result of a write.
///
/// No variant is an error: all are expected under network jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Item was buffered; `evicted` older items were dropped to make room.
    Buffered { evicted: usize },

    /// Item is older than media already played out and was discarded.
    Late,

    /// Buffer is full and the item is older than everything in it, so it
    /// would have been the one evicted. Discarded without touching the
    /// buffer.
    Overflow,
}

impl WriteOutcome {
    /// Whether the item is now held by the buffer.
    pub fn accepted(self) -> bool {
        matches!(self, WriteOutcome::Buffered { .. })
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    /// The oldest buffered item.
    Item(T),

    /// Not yet deep enough to start playout.
    Priming,

    /// Created paused and [`JitterBuffer::start_playing`] not yet called.
    Paused,

    /// Playing but empty.
    Underrun,
}

impl<T> ReadOutcome<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            ReadOutcome::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn is_underrun(&self) -> bool {
        matches!(self, ReadOutcome::Underrun)
    }
}

/// Jitter buffer status for observability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JitterBufferStatus {
    pub buffered_items: usize,
    pub depth: Duration,
    pub is_primed: bool,
    pub writes: u64,
    pub reads: u64,
    pub underruns: u64,
    pub late_writes: u64,
    pub evicted: u64,
    pub flushed: u64,
}

struct BufferState<T> {
    // ---
    items: VecDeque<T>,
    depth: Duration,
    primed: bool,
    playing: bool,
    last_read_timestamp: Option<Duration>,
    base_target_depth: Duration,
    target_adjustment: Duration,
    status: JitterBufferStatus,
}

/// Jitter buffer for timestamp reordering and playout smoothing.
///
/// # Design
///
/// - **Priming**: nothing is released until `min_depth` worth of media is
///   buffered; once primed the buffer keeps releasing until flushed.
/// - **Timestamp ordering**: items are sorted by presentation timestamp (ties
///   keep arrival order), or appended when sorting is disabled.
/// - **Late rejection**: after the first release, an item strictly older than
///   the last released one is refused rather than played out of order.
/// - **Bounded**: writes never block; over capacity the oldest buffered items
///   are evicted.
/// - **Thread-safe**: one mutex per buffer, so producers and the dequeue
///   scheduler can share it behind an `Arc`.
///
/// # Example
///
/// ```
/// use receiver::jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterItem};
/// use moq_playout_common::Ticks;
/// use std::time::Duration;
///
/// struct Frame(u64);
///
/// impl JitterItem for Frame {
///     fn sequence_number(&self) -> u64 { self.0 }
///     fn timestamp(&self) -> Duration { Duration::from_millis(self.0 * 100) }
///     fn duration(&self) -> Duration { Duration::from_millis(100) }
/// }
///
/// let config = JitterBufferConfig { min_depth: Duration::from_millis(200), ..Default::default() };
/// let buffer = JitterBuffer::new("video/hd", config, None);
/// let now = Ticks::now();
///
/// // Arrives out of order; not yet deep enough to play.
/// buffer.write(Frame(1), now);
/// assert!(buffer.read(now).is_none());
///
/// buffer.write(Frame(0), now);
/// assert_eq!(buffer.read(now).map(|f| f.0), Some(0));
/// assert_eq!(buffer.read(now).map(|f| f.0), Some(1));
/// ```
pub struct JitterBuffer<T> {
    // ---
    identifier: String,
    config: JitterBufferConfig,
    state: Mutex<BufferState<T>>,
    metrics: Option<MetricsHandle>,
}

impl<T: JitterItem> JitterBuffer<T> {
    // ---
    /// Creates a new jitter buffer with the given configuration.
    pub fn new(
        identifier: impl Into<String>,
        config: JitterBufferConfig,
        metrics: Option<MetricsHandle>,
    ) -> Self {
        // ---
        let state = BufferState {
            items: VecDeque::with_capacity(config.capacity.min(1024)),
            depth: Duration::ZERO,
            primed: false,
            playing: config.playing_from_start,
            last_read_timestamp: None,
            base_target_depth: config.min_depth,
            target_adjustment: Duration::ZERO,
            status: JitterBufferStatus::default(),
        };
        Self {
            identifier: identifier.into(),
            config,
            state: Mutex::new(state),
            metrics,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Inserts an item in timestamp order.
    ///
    /// Returns [`WriteOutcome::Late`] without touching the buffer if playout
    /// has already moved past this item's timestamp, and
    /// [`WriteOutcome::Overflow`] if it would be evicted by its own insert.
    pub fn write(&self, item: T, from: Ticks) -> WriteOutcome {
        // ---
        let timestamp = item.timestamp();
        let outcome = {
            let mut state = self.state.lock();

            if state
                .last_read_timestamp
                .is_some_and(|last| timestamp < last)
            {
                state.status.late_writes += 1;
                WriteOutcome::Late
            } else if state.items.len() >= self.config.capacity
                && insert_position(&state.items, timestamp, self.config.sort) == 0
            {
                state.status.evicted += 1;
                WriteOutcome::Overflow
            } else {
                state.depth += item.duration();
                let position = insert_position(&state.items, timestamp, self.config.sort);
                state.items.insert(position, item);

                let mut evicted = 0;
                while state.items.len() > self.config.capacity {
                    let Some(oldest) = state.items.pop_front() else {
                        break;
                    };
                    state.depth = state.depth.saturating_sub(oldest.duration());
                    evicted += 1;
                }
                state.status.writes += 1;
                state.status.evicted += evicted as u64;
                WriteOutcome::Buffered { evicted }
            }
        };

        match outcome {
            WriteOutcome::Late => {
                debug!(
                    "{}: refused write older than last read (ts={:?})",
                    self.identifier, timestamp
                );
                self.count("late_writes", 1, from);
            }
            WriteOutcome::Overflow => {
                warn!(
                    "{}: buffer full, dropped write older than all buffered (ts={:?})",
                    self.identifier, timestamp
                );
                self.count("evicted", 1, from);
            }
            WriteOutcome::Buffered { evicted } => {
                if evicted > 0 {
                    warn!("{}: buffer over capacity, evicted {evicted} oldest", self.identifier);
                    self.count("evicted", evicted as u64, from);
                }
                self.count("writes", 1, from);
            }
        }
        outcome
    }

    /// Attempts to take the oldest item from the buffer.
    ///
    /// Returns `None` while paused, while still priming, or when empty
    /// (counted as an underrun). `from` is only used for metrics.
    pub fn read(&self, from: Ticks) -> Option<T> {
        self.try_read(from).into_item()
    }

    /// As [`read`](Self::read), saying why nothing was released.
    pub fn try_read(&self, from: Ticks) -> ReadOutcome<T> {
        // ---
        let (item, depth) = {
            let mut state = self.state.lock();
            if !state.playing {
                return ReadOutcome::Paused;
            }
            if !state.primed {
                if state.items.is_empty() || state.depth < self.config.min_depth {
                    return ReadOutcome::Priming;
                }
                state.primed = true;
                debug!("{}: primed at depth {:?}, starting playout", self.identifier, state.depth);
            }

            let depth = state.depth;
            let item = state.items.pop_front();
            match &item {
                Some(item) => {
                    state.depth = state.depth.saturating_sub(item.duration());
                    state.last_read_timestamp = Some(item.timestamp());
                    state.status.reads += 1;
                }
                None => state.status.underruns += 1,
            }
            (item, depth)
        };

        if let Some(metrics) = &self.metrics {
            metrics.gauge("depth_seconds", depth.as_secs_f64(), from);
            metrics.counter(if item.is_some() { "reads" } else { "underruns" }, 1, from);
        }
        match item {
            Some(item) => ReadOutcome::Item(item),
            None => ReadOutcome::Underrun,
        }
    }

    /// Empties the buffer and returns to priming, e.g. on a stream
    /// discontinuity or codec switch. Returns the number of items dropped.
    pub fn flush(&self, from: Ticks) -> usize {
        // ---
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.depth = Duration::ZERO;
            state.primed = false;
            state.last_read_timestamp = None;
            state.status.flushed += dropped as u64;
            dropped
        };
        debug!("{}: flushed {dropped} items", self.identifier);
        self.count("flushed", dropped as u64, from);
        dropped
    }

    /// Allows items to be released. Only meaningful when the buffer was
    /// created with `playing_from_start == false`.
    pub fn start_playing(&self) {
        self.state.lock().playing = true;
    }

    /// Whether a read right now would release an item.
    pub fn ready(&self) -> bool {
        // ---
        let state = self.state.lock();
        state.playing
            && !state.items.is_empty()
            && (state.primed || state.depth >= self.config.min_depth)
    }

    pub fn is_primed(&self) -> bool {
        self.state.lock().primed
    }

    /// Sum of the durations of all buffered items.
    pub fn depth(&self) -> Duration {
        self.state.lock().depth
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Runs `f` on the head item without removing it.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.state.lock().items.front().map(f)
    }

    /// Sets the depth the buffer aims to maintain. Adjustments are applied on
    /// top of this and should return to zero.
    pub fn set_base_target_depth(&self, depth: Duration) {
        self.state.lock().base_target_depth = depth;
    }

    pub fn base_target_depth(&self) -> Duration {
        self.state.lock().base_target_depth
    }

    /// Temporarily raises the target depth (e.g. ahead of a predicted spike).
    pub fn set_target_adjustment(&self, adjustment: Duration) {
        self.state.lock().target_adjustment = adjustment;
    }

    /// Base target depth plus any adjustment.
    pub fn current_target_depth(&self) -> Duration {
        // ---
        let state = self.state.lock();
        state.base_target_depth + state.target_adjustment
    }

    /// Receiver-timeline seconds at which an item with `timestamp` should
    /// ideally be played, given the sender-to-receiver clock `offset`.
    pub fn playout_time(&self, timestamp: Duration, offset: f64) -> f64 {
        timestamp.as_secs_f64() + offset + self.current_target_depth().as_secs_f64()
    }

    /// Seconds from `from` until an item with `timestamp` is due. Negative
    /// when it is already late.
    pub fn calculate_wait_time_for(&self, timestamp: Duration, from: Ticks, offset: f64) -> f64 {
        // ---
        let wait = self.playout_time(timestamp, offset) - from.as_secs_f64();
        if let Some(metrics) = &self.metrics {
            metrics.gauge("wait_time_seconds", wait, from);
        }
        wait
    }

    /// Seconds from `from` until the head item is due, or `None` when the
    /// buffer is empty.
    pub fn calculate_wait_time(&self, from: Ticks, offset: f64) -> Option<f64> {
        // ---
        let head = self.peek_with(|item| item.timestamp())?;
        Some(self.calculate_wait_time_for(head, from, offset))
    }

    /// Returns current buffer status for debugging.
    pub fn status(&self) -> JitterBufferStatus {
        // ---
        let state = self.state.lock();
        JitterBufferStatus {
            buffered_items: state.items.len(),
            depth: state.depth,
            is_primed: state.primed,
            ..state.status.clone()
        }
    }

    fn count(&self, field: &'static str, n: u64, at: Ticks) {
        if let Some(metrics) = &self.metrics {
            metrics.counter(field, n, at);
        }
    }
}

/// Where an item with `timestamp` goes to keep timestamp order; equal
/// timestamps keep arrival order.
fn insert_position<T: JitterItem>(items: &VecDeque<T>, timestamp: Duration, sort: bool) -> usize {
    // ---
    let in_order = items
        .back()
        .map_or(true, |last| last.timestamp() <= timestamp);
    if !sort || in_order {
        return items.len();
    }
    items.partition_point(|existing| existing.timestamp() <= timestamp)
}
