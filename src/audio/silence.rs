//! End-of-speech detection
//!
//! Tracks RMS energy over 20ms frames. Once speech has been heard, a run of
//! quiet frames at least as long as the silence threshold ends the
//! utterance.

use super::cpal_capture::TARGET_SAMPLE_RATE;
use std::time::Duration;

const FRAME_MS: usize = 20;
const FRAME_SIZE: usize = TARGET_SAMPLE_RATE as usize * FRAME_MS / 1000;

/// Frames at or above this RMS count as speech
pub const DEFAULT_SPEECH_RMS: f32 = 0.01;

pub struct SilenceDetector {
    speech_rms: f32,
    silence_needed: usize,
    trailing_silence: usize,
    heard_speech: bool,
    pending: Vec<f32>,
}

impl SilenceDetector {
    pub fn new(silence_threshold: Duration) -> Self {
        Self::with_energy(silence_threshold, DEFAULT_SPEECH_RMS)
    }

    pub fn with_energy(silence_threshold: Duration, speech_rms: f32) -> Self {
        Self {
            speech_rms,
            silence_needed: (silence_threshold.as_secs_f64() * TARGET_SAMPLE_RATE as f64) as usize,
            trailing_silence: 0,
            heard_speech: false,
            pending: Vec::with_capacity(FRAME_SIZE),
        }
    }

    /// Feed 16 kHz mono samples
    pub fn feed(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        let whole = self.pending.len() / FRAME_SIZE * FRAME_SIZE;
        for frame in self.pending[..whole].chunks(FRAME_SIZE) {
            if calculate_rms(frame) >= self.speech_rms {
                self.heard_speech = true;
                self.trailing_silence = 0;
            } else {
                self.trailing_silence += frame.len();
            }
        }
        self.pending.drain(..whole);
    }

    pub fn heard_speech(&self) -> bool {
        self.heard_speech
    }

    /// Speech was heard and has been followed by enough silence
    pub fn speech_ended(&self) -> bool {
        self.heard_speech && self.trailing_silence >= self.silence_needed
    }
}

/// RMS energy of a sample slice
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(secs: f32) -> Vec<f32> {
        (0..(secs * 16000.0) as usize)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
            .collect()
    }

    fn silence(secs: f32) -> Vec<f32> {
        vec![0.0; (secs * 16000.0) as usize]
    }

    #[test]
    fn test_rms() {
        assert_eq!(calculate_rms(&[]), 0.0);
        assert_eq!(calculate_rms(&silence(0.1)), 0.0);
        assert!(calculate_rms(&tone(0.1)) > 0.3);
    }

    #[test]
    fn test_silence_before_speech_does_not_end() {
        let mut detector = SilenceDetector::new(Duration::from_millis(500));
        detector.feed(&silence(2.0));
        assert!(!detector.heard_speech());
        assert!(!detector.speech_ended());
    }

    #[test]
    fn test_trailing_silence_ends_speech() {
        let mut detector = SilenceDetector::new(Duration::from_millis(500));
        detector.feed(&tone(0.5));
        assert!(detector.heard_speech());

        detector.feed(&silence(0.3));
        assert!(!detector.speech_ended());

        detector.feed(&silence(0.3));
        assert!(detector.speech_ended());
    }

    #[test]
    fn test_speech_resets_silence() {
        let mut detector = SilenceDetector::new(Duration::from_millis(500));
        detector.feed(&tone(0.2));
        detector.feed(&silence(0.4));
        detector.feed(&tone(0.2));
        detector.feed(&silence(0.4));
        assert!(!detector.speech_ended());
    }

    #[test]
    fn test_partial_frames_accumulate() {
        let mut detector = SilenceDetector::new(Duration::from_millis(100));
        let speech = tone(0.1);
        for chunk in speech.chunks(7) {
            detector.feed(chunk);
        }
        assert!(detector.heard_speech());
    }
}
