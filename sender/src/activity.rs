//! Audio activity state machine.
//!
//! Turns a stream of boolean VAD samples into extension header values with
//! hysteresis:
//!
//! ```text
//!  idle ──voice──▶ speaking ──silence──▶ ending ──silence ≥ 500ms──▶ idle
//!                    ▲  │ voice ≥ 300ms      │
//!                    │  └─ continuousSpeech  │
//!                    └──────── voice ────────┘
//! ```
//!
//! The machine is a pure function of (state, input, now); it does no I/O and
//! is media-agnostic. Callers decide what to do with subgroups.

use anyhow::{anyhow, Error};
use moq_playout_common::Ticks;
use std::time::Duration;

/// Interval between `ContinuousSpeech` heartbeats while talking.
pub const CONTINUOUS_INTERVAL: Duration = Duration::from_millis(300);

/// How long `SpeechEnd` keeps being repeated after speech stops.
pub const END_REPEAT_DURATION: Duration = Duration::from_millis(500);

/// Values carried by the audio activity indicator extension header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AudioActivityValue {
    SpeechEnd = 0,
    SpeechStart = 1,
    ContinuousSpeech = 2,
}

impl AudioActivityValue {
    // ---
    /// Single-byte wire value.
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for AudioActivityValue {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        // ---
        match value {
            0 => Ok(Self::SpeechEnd),
            1 => Ok(Self::SpeechStart),
            2 => Ok(Self::ContinuousSpeech),
            other => Err(anyhow!("unknown audio activity value: {other}")),
        }
    }
}

/// Action returned by the state machine for each VAD sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioActivityAction {
    /// Attach the extension with this value to the current object.
    SendExtension(AudioActivityValue),

    /// Publish normally, no extension needed.
    None,

    /// No speech activity to report.
    Silent,
}

impl AudioActivityAction {
    pub fn extension(self) -> Option<AudioActivityValue> {
        match self {
            AudioActivityAction::SendExtension(value) => Some(value),
            AudioActivityAction::None | AudioActivityAction::Silent => None,
        }
    }
}

/// Internal state, exposed so tests and callers can inject a starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Idle,
    Speaking {
        since: Ticks,
        last_continuous: Ticks,
    },
    EndingSpeech {
        since: Ticks,
    },
}

/// Converts raw VAD booleans into timed activity indicator signals.
///
/// One instance per microphone track; not shared between threads.
#[derive(Debug, Default)]
pub struct AudioActivityStateMachine {
    state: ActivityState,
}

impl AudioActivityStateMachine {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the machine in an arbitrary state.
    pub fn with_state(state: ActivityState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    /// Process a VAD sample and return the action to take.
    pub fn update(&mut self, voice_active: bool, now: Ticks) -> AudioActivityAction {
        // ---
        let (next, action) = transition(self.state, voice_active, now);
        self.state = next;
        action
    }
}

fn transition(
    state: ActivityState,
    voice_active: bool,
    now: Ticks,
) -> (ActivityState, AudioActivityAction) {
    // ---
    use AudioActivityAction::{SendExtension, Silent};
    use AudioActivityValue::{ContinuousSpeech, SpeechEnd, SpeechStart};

    let speaking_from_now = ActivityState::Speaking {
        since: now,
        last_continuous: now,
    };

    match state {
        ActivityState::Idle if voice_active => (speaking_from_now, SendExtension(SpeechStart)),
        ActivityState::Idle => (ActivityState::Idle, Silent),

        ActivityState::Speaking {
            since,
            last_continuous,
        } => {
            if !voice_active {
                return (ActivityState::EndingSpeech { since: now }, SendExtension(SpeechEnd));
            }
            if elapsed(now, last_continuous) >= CONTINUOUS_INTERVAL {
                let refreshed = ActivityState::Speaking {
                    since,
                    last_continuous: now,
                };
                (refreshed, SendExtension(ContinuousSpeech))
            } else {
                (state, AudioActivityAction::None)
            }
        }

        ActivityState::EndingSpeech { .. } if voice_active => {
            (speaking_from_now, SendExtension(SpeechStart))
        }
        ActivityState::EndingSpeech { since } => {
            if elapsed(now, since) >= END_REPEAT_DURATION {
                (ActivityState::Idle, Silent)
            } else {
                // Repeated so a lost end signal is survivable.
                (state, SendExtension(SpeechEnd))
            }
        }
    }
}

fn elapsed(now: Ticks, since: Ticks) -> Duration {
    Duration::from_nanos(now.as_nanos().saturating_sub(since.as_nanos()))
}
