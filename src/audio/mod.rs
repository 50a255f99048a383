//! Audio capture and feedback
//!
//! Recording uses cpal, which works with PipeWire, PulseAudio, ALSA and
//! CoreAudio. Feedback cues play through rodio.

pub mod cpal_capture;
pub mod feedback;
pub mod silence;

pub use cpal_capture::{CpalCapture, TARGET_SAMPLE_RATE};
pub use feedback::{AudioFeedback, Cue};
pub use silence::SilenceDetector;
