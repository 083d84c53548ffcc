//! Glue between the state machine and the audio/video publications.
//!
//! [`ActivitySignaler`] sits on the microphone track: every VAD sample goes in,
//! the extension (if any) for the current audio object comes out, and the same
//! value is posted for the video track. [`VideoActivityStamper`] sits on the
//! video track and picks up the latest posted value for its next object.

use crate::activity::{AudioActivityAction, AudioActivityStateMachine, AudioActivityValue};
use crate::shared::SharedVoiceActivityState;
use moq_playout_common::Ticks;
use std::sync::Arc;
use tracing::debug;

/// Audio-side producer.
pub struct ActivitySignaler {
    // ---
    machine: AudioActivityStateMachine,
    shared: Option<Arc<SharedVoiceActivityState>>,
}

impl ActivitySignaler {
    // ---
    /// `shared` is the mailbox of a companion video publication, if one exists.
    pub fn new(shared: Option<Arc<SharedVoiceActivityState>>) -> Self {
        Self {
            machine: AudioActivityStateMachine::new(),
            shared,
        }
    }

    /// Runs one VAD sample through the state machine.
    ///
    /// Returns the extension value to attach to the audio object being
    /// published now.
    pub fn on_voice_sample(&mut self, voice_active: bool, now: Ticks) -> Option<AudioActivityValue> {
        // ---
        let before = std::mem::discriminant(&self.machine.state());
        let action = self.machine.update(voice_active, now);
        if before != std::mem::discriminant(&self.machine.state()) {
            debug!(state = ?self.machine.state(), ?action, "voice activity transition");
        }
        if let AudioActivityAction::SendExtension(value) = action {
            if let Some(shared) = &self.shared {
                shared.post_activity(value);
            }
        }
        action.extension()
    }
}

/// Activity metadata for one outgoing video object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoObjectActivity {
    /// Extension value to attach, if one was pending.
    pub extension: Option<AudioActivityValue>,

    /// Start a new subgroup with this object, so the start of a speech burst
    /// is independently addressable.
    pub roll_subgroup: bool,
}

/// Video-side consumer.
pub struct VideoActivityStamper {
    shared: Arc<SharedVoiceActivityState>,
}

impl VideoActivityStamper {
    // ---
    pub fn new(shared: Arc<SharedVoiceActivityState>) -> Self {
        Self { shared }
    }

    /// Consumes the pending value for the next video object.
    pub fn next_object(&self) -> VideoObjectActivity {
        // ---
        let extension = self.shared.consume_activity();
        VideoObjectActivity {
            extension,
            roll_subgroup: extension == Some(AudioActivityValue::SpeechStart),
        }
    }
}
