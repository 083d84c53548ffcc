//! Publication-side voice activity signalling.
//!
//! Converts raw voice-activity-detector output from the microphone track into
//! the timed speech start / continuous / end extension values attached to
//! published media objects, and hands the latest value to the companion video
//! publication without coupling the two.

pub mod activity;
pub mod publication;
pub mod shared;

pub use activity::{
    ActivityState, AudioActivityAction, AudioActivityStateMachine, AudioActivityValue,
    CONTINUOUS_INTERVAL, END_REPEAT_DURATION,
};
pub use publication::{ActivitySignaler, VideoActivityStamper, VideoObjectActivity};
pub use shared::SharedVoiceActivityState;
