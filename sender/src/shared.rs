//! Voice activity hand-off between the audio and video publications.

use crate::activity::AudioActivityValue;
use moq_playout_common::Mailbox;

/// Most-recent-wins mailbox for the latest voice activity value.
///
/// The audio publication posts every value its state machine emits; the video
/// publication consumes whatever is pending when it publishes its next object.
#[derive(Debug, Default)]
pub struct SharedVoiceActivityState {
    pending: Mailbox<AudioActivityValue>,
}

impl SharedVoiceActivityState {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_activity(&self, value: AudioActivityValue) {
        self.pending.set(value);
    }

    /// Returns `None` if nothing was posted since the last consume.
    pub fn consume_activity(&self) -> Option<AudioActivityValue> {
        self.pending.take()
    }
}
