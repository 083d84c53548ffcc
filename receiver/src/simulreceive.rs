//! Simulreceive: choosing one of several simultaneously received renditions
//! of the same source to display.
//!
//! Each rendition (simulcast layer) decodes into its own single-slot
//! [`Mailbox`]. On every render pass the [`SimulreceiveSet`] gathers the
//! latest decoded image from each slot and [`make_simulreceive_decision`]
//! picks the one to show.

use crate::coordinator::DequeueSchedulable;
use anyhow::Result;
use moq_playout_common::{Mailbox, MetricsHandle, Ticks};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Decoded image dimensions. Orders by width, then height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 16:9 rendition of the given height, width saturating at `u32::MAX`.
    pub fn widescreen(height: u32) -> Self {
        let width = u64::from(height) * 16 / 9;
        Self::new(u32::try_from(width).unwrap_or(u32::MAX), height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A decoded candidate image from one rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulreceiveItem<I> {
    // ---
    pub track: String,
    pub image: I,
    pub timestamp: Duration,

    /// Decoded after a gap (dropped or corrupt reference), so may show
    /// artifacts.
    pub discontinuous: bool,
    pub resolution: Resolution,
}

impl<I> SimulreceiveItem<I> {
    pub fn pristine(&self) -> bool {
        !self.discontinuous
    }
}

/// Why a candidate was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulreceiveReason {
    OnlyChoice,
    HighestRes { pristine: bool },
}

impl SimulreceiveReason {
    /// Metric field counting selections made for this reason.
    pub fn metric_field(self) -> &'static str {
        match self {
            SimulreceiveReason::OnlyChoice => "simulreceive_only_choice",
            SimulreceiveReason::HighestRes { pristine: true } => "simulreceive_highest_pristine",
            SimulreceiveReason::HighestRes { pristine: false } => {
                "simulreceive_highest_discontinuous"
            }
        }
    }
}

impl fmt::Display for SimulreceiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulreceiveReason::OnlyChoice => f.write_str("Only choice"),
            SimulreceiveReason::HighestRes { pristine: true } => f.write_str("Highest Pristine"),
            SimulreceiveReason::HighestRes { pristine: false } => {
                f.write_str("Highest Discontinuous")
            }
        }
    }
}

/// Index of the selected candidate in the filtered choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulreceiveDecision {
    pub index: usize,
    pub reason: SimulreceiveReason,
}

/// Picks the candidate to display.
///
/// `choices` is narrowed in place to the candidates sharing the oldest
/// timestamp; the returned index refers to the narrowed list. Among those,
/// the highest-resolution pristine candidate wins, else the
/// highest-resolution discontinuous one. Equal resolutions keep the first in
/// input order. Returns `None` for no candidates.
pub fn make_simulreceive_decision<I>(
    choices: &mut Vec<SimulreceiveItem<I>>,
) -> Option<SimulreceiveDecision> {
    // ---
    let oldest = choices.iter().map(|c| c.timestamp).min()?;
    choices.retain(|c| c.timestamp == oldest);

    if choices.len() == 1 {
        return Some(SimulreceiveDecision {
            index: 0,
            reason: SimulreceiveReason::OnlyChoice,
        });
    }

    let highest = |pristine_only: bool| {
        choices
            .iter()
            .enumerate()
            .filter(|(_, c)| !pristine_only || c.pristine())
            .fold(None::<(usize, Resolution)>, |best, (index, c)| match best {
                Some((_, resolution)) if c.resolution <= resolution => best,
                _ => Some((index, c.resolution)),
            })
            .map(|(index, _)| index)
    };

    if let Some(index) = highest(true) {
        return Some(SimulreceiveDecision {
            index,
            reason: SimulreceiveReason::HighestRes { pristine: true },
        });
    }
    highest(false).map(|index| SimulreceiveDecision {
        index,
        reason: SimulreceiveReason::HighestRes { pristine: false },
    })
}

/// What the set does with its decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SimulreceiveMode {
    /// Decide and report only.
    None,
    /// Highlight the selected rendition without displaying it.
    VisualizeOnly,
    /// Display the selected image.
    #[default]
    Enable,
}

#[derive(Debug, Clone)]
pub struct SimulreceiveConfig {
    // ---
    pub mode: SimulreceiveMode,

    /// Consecutive decisions that would lower quality before the lower
    /// quality is actually displayed.
    pub quality_miss_threshold: u32,

    /// Render pass cadence when registered with a coordinator.
    pub poll_interval: Duration,
}

impl Default for SimulreceiveConfig {
    fn default() -> Self {
        Self {
            mode: SimulreceiveMode::Enable,
            quality_miss_threshold: 3,
            poll_interval: Duration::from_micros(33_333),
        }
    }
}

/// Per-candidate record of a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulreceiveChoiceReport {
    pub track: String,
    pub selected: bool,
    /// Set only for the selected candidate.
    pub reason: Option<SimulreceiveReason>,
    pub displayed: bool,
}

/// Result of one render pass that reached a decision.
#[derive(Debug, Clone)]
pub struct SimulreceiveOutcome<I> {
    pub selected: SimulreceiveItem<I>,
    pub reason: SimulreceiveReason,
    /// False when a step down in quality was held back.
    pub displayed: bool,
    pub reports: Vec<SimulreceiveChoiceReport>,
}

/// Receives what the set decides to show.
pub trait SimulreceiveSink<I>: Send + Sync {
    fn display(&self, item: &SimulreceiveItem<I>, at: Ticks);

    /// The highlighted rendition changed ([`SimulreceiveMode::VisualizeOnly`]).
    fn highlight(&self, _track: &str) {}
}

struct Displayed {
    timestamp: Duration,
    resolution: Resolution,
    discontinuous: bool,
}

#[derive(Default)]
struct RenderState {
    last: Option<Displayed>,
    quality_misses: u32,
    last_highlight: Option<String>,
}

type Slot<I> = Arc<Mailbox<SimulreceiveItem<I>>>;

/// The renditions of one source, and the render-side selection state.
pub struct SimulreceiveSet<I> {
    // ---
    identifier: String,
    config: SimulreceiveConfig,
    tracks: Mutex<Vec<(String, Slot<I>)>>,
    state: Mutex<RenderState>,
    sink: Arc<dyn SimulreceiveSink<I>>,
    metrics: Option<MetricsHandle>,
}

impl<I: Clone + Send + 'static> SimulreceiveSet<I> {
    // ---
    pub fn new(
        identifier: impl Into<String>,
        config: SimulreceiveConfig,
        sink: Arc<dyn SimulreceiveSink<I>>,
        metrics: Option<MetricsHandle>,
    ) -> Self {
        // ---
        Self {
            identifier: identifier.into(),
            config,
            tracks: Mutex::new(Vec::new()),
            state: Mutex::new(RenderState::default()),
            sink,
            metrics,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Adds a rendition. Insertion order breaks resolution ties.
    /// Returns false if already present.
    pub fn add_track(&self, track: impl Into<String>) -> bool {
        // ---
        let track = track.into();
        let mut tracks = self.tracks.lock();
        if tracks.iter().any(|(name, _)| *name == track) {
            return false;
        }
        tracks.push((track, Arc::new(Mailbox::new())));
        true
    }

    pub fn remove_track(&self, track: &str) -> bool {
        // ---
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|(name, _)| name != track);
        tracks.len() != before
    }

    pub fn tracks(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Stores the latest decoded image for `item.track`, replacing any not
    /// yet rendered. Returns false for an unknown track.
    pub fn offer(&self, item: SimulreceiveItem<I>) -> bool {
        // ---
        let slot = self
            .tracks
            .lock()
            .iter()
            .find(|(name, _)| *name == item.track)
            .map(|(_, slot)| Arc::clone(slot));
        match slot {
            Some(slot) => {
                slot.set(item);
                true
            }
            None => false,
        }
    }

    /// Runs one decision over the currently decoded images.
    ///
    /// Images not newer than the last displayed one are discarded. All
    /// shortlisted images are consumed whether or not they are displayed.
    pub fn render(&self, at: Ticks) -> Option<SimulreceiveOutcome<I>> {
        // ---
        let slots: Vec<(String, Slot<I>)> = self.tracks.lock().clone();
        let last_timestamp = self.state.lock().last.as_ref().map(|l| l.timestamp);

        let mut choices = Vec::with_capacity(slots.len());
        for (track, slot) in &slots {
            slot.update(|slot| match slot.take() {
                Some(item) if last_timestamp.is_some_and(|last| item.timestamp <= last) => {
                    trace!("{}: discarding stale image from {track}", self.identifier);
                }
                Some(item) => {
                    choices.push(item.clone());
                    *slot = Some(item);
                }
                None => {}
            });
        }

        let decision = make_simulreceive_decision(&mut choices)?;

        for choice in &choices {
            if let Some((_, slot)) = slots.iter().find(|(name, _)| *name == choice.track) {
                slot.update(|slot| {
                    if slot.as_ref().is_some_and(|s| s.timestamp == choice.timestamp) {
                        *slot = None;
                    }
                });
            }
        }

        let selected = choices[decision.index].clone();
        let (displayed, highlight) = {
            let mut state = self.state.lock();
            let step_down = state.last.as_ref().is_some_and(|last| {
                selected.resolution < last.resolution
                    || (selected.discontinuous && !last.discontinuous)
            });
            if step_down {
                state.quality_misses += 1;
            }
            let held_back = step_down && state.quality_misses < self.config.quality_miss_threshold;

            let mut highlight = false;
            if !held_back {
                state.quality_misses = 0;
                state.last = Some(Displayed {
                    timestamp: selected.timestamp,
                    resolution: selected.resolution,
                    discontinuous: selected.discontinuous,
                });
                if state.last_highlight.as_deref() != Some(selected.track.as_str()) {
                    state.last_highlight = Some(selected.track.clone());
                    highlight = true;
                }
            }
            (!held_back, highlight)
        };

        let reports: Vec<SimulreceiveChoiceReport> = choices
            .iter()
            .enumerate()
            .map(|(index, choice)| {
                let selected = index == decision.index;
                SimulreceiveChoiceReport {
                    track: choice.track.clone(),
                    selected,
                    reason: selected.then_some(decision.reason),
                    displayed: selected && displayed,
                }
            })
            .collect();

        debug!(
            "{}: {} {} at {:?} ({}, displayed={displayed})",
            self.identifier, selected.track, selected.resolution, selected.timestamp, decision.reason
        );

        if displayed {
            match self.config.mode {
                SimulreceiveMode::Enable => self.sink.display(&selected, at),
                SimulreceiveMode::VisualizeOnly if highlight => self.sink.highlight(&selected.track),
                _ => {}
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.counter("simulreceive_selected", 1, at);
            if displayed {
                metrics.counter("simulreceive_displayed", 1, at);
            }
            // Per track, so the reasoning for every candidate is visible.
            for report in &reports {
                let field = report
                    .reason
                    .map_or("simulreceive_choice_skipped", SimulreceiveReason::metric_field);
                metrics.counter_for(&report.track, field, 1, at);
                if report.displayed {
                    metrics.counter_for(&report.track, "simulreceive_choice_displayed", 1, at);
                }
            }
        }

        Some(SimulreceiveOutcome {
            selected,
            reason: decision.reason,
            displayed,
            reports,
        })
    }
}

impl<I: Clone + Send + 'static> DequeueSchedulable for SimulreceiveSet<I> {
    fn dequeue_identifier(&self) -> &str {
        &self.identifier
    }

    fn calculate_next_deadline(&self, from: Ticks) -> Option<Ticks> {
        // ---
        if self.tracks.lock().is_empty() {
            return None;
        }
        Some(from + self.config.poll_interval)
    }

    fn process_frame(&self, at: Ticks) -> Result<bool> {
        Ok(self.render(at).is_some_and(|outcome| outcome.displayed))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use moq_playout_common::MemorySink;

    const HIGH: Resolution = Resolution::new(1920, 1280);
    const MEDIUM: Resolution = Resolution::new(1280, 960);

    #[test]
    fn widescreen_width_does_not_overflow() {
        // ---
        assert_eq!(Resolution::widescreen(1080), Resolution::new(1920, 1080));
        assert_eq!(Resolution::widescreen(360), Resolution::new(640, 360));
        assert_eq!(Resolution::widescreen(u32::MAX).width, u32::MAX);
    }

    fn item(track: &str, ts: u64, res: Resolution, discontinuous: bool) -> SimulreceiveItem<u32> {
        SimulreceiveItem {
            track: track.into(),
            image: ts as u32,
            timestamp: Duration::from_millis(ts),
            discontinuous,
            resolution: res,
        }
    }

    fn qualities(discontinuous: [bool; 3], ts: [u64; 3]) -> Vec<SimulreceiveItem<u32>> {
        vec![
            item("1", ts[0], HIGH, discontinuous[0]),
            item("2", ts[1], MEDIUM, discontinuous[1]),
            item("3", ts[2], MEDIUM, discontinuous[2]),
        ]
    }

    fn decide(mut choices: Vec<SimulreceiveItem<u32>>) -> Option<(String, SimulreceiveReason)> {
        let decision = make_simulreceive_decision(&mut choices)?;
        Some((choices[decision.index].track.clone(), decision.reason))
    }

    #[test]
    fn nothing_gives_nothing() {
        assert_eq!(decide(Vec::new()), None);
    }

    #[test]
    fn one_returns_itself() {
        // ---
        let choices = vec![item("1", 1, HIGH, true)];
        assert_eq!(
            decide(choices),
            Some(("1".into(), SimulreceiveReason::OnlyChoice))
        );
    }

    #[test]
    fn only_oldest_considered() {
        // ---
        let mut choices = qualities([false; 3], [2, 1, 1]);
        let decision = make_simulreceive_decision(&mut choices).expect("decision");
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[decision.index].track, "2");
        assert_eq!(decision.reason, SimulreceiveReason::HighestRes { pristine: true });
    }

    #[test]
    fn highest_resolution_when_all_pristine() {
        // ---
        assert_eq!(
            decide(qualities([false; 3], [1; 3])),
            Some(("1".into(), SimulreceiveReason::HighestRes { pristine: true }))
        );
    }

    #[test]
    fn lower_pristine_when_higher_is_not() {
        // ---
        assert_eq!(
            decide(qualities([true, false, false], [1; 3])),
            Some(("2".into(), SimulreceiveReason::HighestRes { pristine: true }))
        );
    }

    #[test]
    fn all_discontinuous_takes_highest() {
        // ---
        assert_eq!(
            decide(qualities([true; 3], [1; 3])),
            Some(("1".into(), SimulreceiveReason::HighestRes { pristine: false }))
        );
    }

    #[test]
    fn taller_wins_at_equal_width() {
        // ---
        let choices = vec![
            item("short", 1, Resolution::new(1280, 720), false),
            item("tall", 1, Resolution::new(1280, 960), false),
        ];
        assert_eq!(decide(choices).map(|(t, _)| t), Some("tall".into()));
    }

    #[test]
    fn reason_labels() {
        assert_eq!(SimulreceiveReason::OnlyChoice.to_string(), "Only choice");
        assert_eq!(
            SimulreceiveReason::HighestRes { pristine: true }.to_string(),
            "Highest Pristine"
        );
        assert_eq!(
            SimulreceiveReason::HighestRes { pristine: false }.to_string(),
            "Highest Discontinuous"
        );
    }

    #[derive(Default)]
    struct Recorder {
        shown: Mutex<Vec<(String, u32)>>,
        highlights: Mutex<Vec<String>>,
    }

    impl SimulreceiveSink<u32> for Recorder {
        fn display(&self, item: &SimulreceiveItem<u32>, _at: Ticks) {
            self.shown.lock().push((item.track.clone(), item.image));
        }

        fn highlight(&self, track: &str) {
            self.highlights.lock().push(track.into());
        }
    }

    fn set(mode: SimulreceiveMode, threshold: u32) -> (SimulreceiveSet<u32>, Arc<Recorder>) {
        // ---
        let recorder = Arc::new(Recorder::default());
        let set = SimulreceiveSet::new(
            "participant",
            SimulreceiveConfig {
                mode,
                quality_miss_threshold: threshold,
                ..Default::default()
            },
            recorder.clone(),
            None,
        );
        assert!(set.add_track("hd"));
        assert!(set.add_track("sd"));
        assert!(!set.add_track("hd"));
        (set, recorder)
    }

    #[test]
    fn render_consumes_shortlist_and_reports() {
        // ---
        let (set, recorder) = set(SimulreceiveMode::Enable, 3);
        assert!(set.offer(item("hd", 10, HIGH, false)));
        assert!(set.offer(item("sd", 10, MEDIUM, false)));
        assert!(!set.offer(item("other", 10, MEDIUM, false)));

        let outcome = set.render(Ticks::ZERO).expect("decision");
        assert_eq!(outcome.selected.track, "hd");
        assert!(outcome.displayed);
        assert_eq!(
            outcome.reports,
            vec![
                SimulreceiveChoiceReport {
                    track: "hd".into(),
                    selected: true,
                    reason: Some(SimulreceiveReason::HighestRes { pristine: true }),
                    displayed: true,
                },
                SimulreceiveChoiceReport {
                    track: "sd".into(),
                    selected: false,
                    reason: None,
                    displayed: false,
                },
            ]
        );
        assert_eq!(*recorder.shown.lock(), vec![("hd".to_string(), 10)]);

        // Both slots were consumed.
        assert!(set.render(Ticks::ZERO).is_none());
    }

    #[test]
    fn newer_layer_waits_for_older() {
        // ---
        let (set, _) = set(SimulreceiveMode::Enable, 3);
        set.offer(item("hd", 20, HIGH, false));
        set.offer(item("sd", 10, MEDIUM, false));

        let first = set.render(Ticks::ZERO).expect("decision");
        assert_eq!(first.selected.track, "sd");
        assert_eq!(first.reason, SimulreceiveReason::OnlyChoice);

        // The newer HD image is still pending.
        let second = set.render(Ticks::ZERO).expect("decision");
        assert_eq!(second.selected.track, "hd");
    }

    #[test]
    fn stale_images_are_discarded() {
        // ---
        let (set, _) = set(SimulreceiveMode::Enable, 3);
        set.offer(item("hd", 20, HIGH, false));
        set.render(Ticks::ZERO).expect("decision");

        set.offer(item("sd", 20, MEDIUM, false));
        assert!(set.render(Ticks::ZERO).is_none());
        set.offer(item("sd", 15, MEDIUM, false));
        assert!(set.render(Ticks::ZERO).is_none());
    }

    #[test]
    fn step_down_needs_consecutive_misses() {
        // ---
        let (set, recorder) = set(SimulreceiveMode::Enable, 3);
        set.offer(item("hd", 0, HIGH, false));
        assert!(set.render(Ticks::ZERO).expect("decision").displayed);

        // HD stops arriving: two held back, the third displays.
        for ts in [1, 2] {
            set.offer(item("sd", ts, MEDIUM, false));
            let outcome = set.render(Ticks::ZERO).expect("decision");
            assert!(!outcome.displayed);
            assert!(!outcome.reports[0].displayed);
        }
        set.offer(item("sd", 3, MEDIUM, false));
        assert!(set.render(Ticks::ZERO).expect("decision").displayed);

        // Once lower, staying lower is not a step down.
        set.offer(item("sd", 4, MEDIUM, false));
        assert!(set.render(Ticks::ZERO).expect("decision").displayed);

        let shown: Vec<u32> = recorder.shown.lock().iter().map(|(_, ts)| *ts).collect();
        assert_eq!(shown, vec![0, 3, 4]);
    }

    #[test]
    fn discontinuous_counts_as_step_down() {
        // ---
        let (set, _) = set(SimulreceiveMode::Enable, 2);
        set.offer(item("hd", 0, HIGH, false));
        set.render(Ticks::ZERO);

        set.offer(item("hd", 1, HIGH, true));
        assert!(!set.render(Ticks::ZERO).expect("decision").displayed);
        set.offer(item("hd", 2, HIGH, true));
        assert!(set.render(Ticks::ZERO).expect("decision").displayed);
    }

    #[test]
    fn visualize_only_highlights_changes() {
        // ---
        let (set, recorder) = set(SimulreceiveMode::VisualizeOnly, 1);
        set.offer(item("hd", 0, HIGH, false));
        set.render(Ticks::ZERO);
        set.offer(item("hd", 1, HIGH, false));
        set.render(Ticks::ZERO);
        set.offer(item("sd", 2, MEDIUM, false));
        set.render(Ticks::ZERO);

        assert!(recorder.shown.lock().is_empty());
        assert_eq!(*recorder.highlights.lock(), vec!["hd".to_string(), "sd".to_string()]);
    }

    #[test]
    fn decisions_reach_metrics_sink() {
        // ---
        let sink = Arc::new(MemorySink::new());
        let set: SimulreceiveSet<u32> = SimulreceiveSet::new(
            "participant",
            SimulreceiveConfig::default(),
            Arc::new(Recorder::default()),
            Some(MetricsHandle::new("participant", sink.clone())),
        );
        set.add_track("hd");
        set.add_track("sd");

        set.offer(item("hd", 10, HIGH, false));
        set.offer(item("sd", 10, MEDIUM, false));
        assert!(set.process_frame(Ticks::ZERO).expect("no error"));

        assert_eq!(sink.counter_total("hd", "simulreceive_highest_pristine"), 1);
        assert_eq!(sink.counter_total("hd", "simulreceive_choice_displayed"), 1);
        assert_eq!(sink.counter_total("sd", "simulreceive_choice_skipped"), 1);
        assert_eq!(sink.counter_total("sd", "simulreceive_choice_displayed"), 0);

        // Lone newer image, then a held-back step down.
        set.offer(item("sd", 20, MEDIUM, true));
        assert!(!set.process_frame(Ticks::ZERO).expect("no error"));
        assert_eq!(sink.counter_total("sd", "simulreceive_only_choice"), 1);
        assert_eq!(sink.counter_total("sd", "simulreceive_choice_displayed"), 0);
        assert_eq!(sink.counter_total("participant", "simulreceive_selected"), 2);
        assert_eq!(sink.counter_total("participant", "simulreceive_displayed"), 1);

        set.offer(item("hd", 30, HIGH, true));
        set.offer(item("sd", 30, MEDIUM, true));
        set.process_frame(Ticks::ZERO).expect("no error");
        assert_eq!(sink.counter_total("hd", "simulreceive_highest_discontinuous"), 1);
    }

    #[test]
    fn schedulable_idles_without_tracks() {
        // ---
        let (set, _) = set(SimulreceiveMode::None, 3);
        let from = Ticks::from_secs_f64(1.0);
        assert_eq!(
            set.calculate_next_deadline(from),
            Some(from + Duration::from_micros(33_333))
        );
        assert!(!set.process_frame(from).expect("no error"));

        assert!(set.remove_track("hd"));
        assert!(set.remove_track("sd"));
        assert!(!set.remove_track("sd"));
        assert_eq!(set.calculate_next_deadline(from), None);
    }
}
