//! Audio cues for dictation start and stop
//!
//! rodio's `OutputStream` can't leave the thread that opened it, so a
//! dedicated player thread owns it and receives cues over a channel.
//! Without an audio output device the thread exits and cues are dropped.

use crate::config::AudioFeedbackConfig;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;

const SAMPLE_RATE: u32 = 44100;

/// Sound cue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Dictation started listening
    ListenStart,
    /// Dictation finished
    ListenStop,
    /// Dictation failed
    Error,
}

/// Audio feedback player
pub struct AudioFeedback {
    cues: Option<Mutex<Sender<Cue>>>,
}

/// WAV data for each cue
struct SoundTheme {
    start: Vec<u8>,
    stop: Vec<u8>,
    error: Vec<u8>,
}

impl AudioFeedback {
    /// Start the player thread, or a silent player when feedback is off
    pub fn new(config: &AudioFeedbackConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }

        let (tx, rx) = mpsc::channel::<Cue>();
        let config = config.clone();
        let spawned = thread::Builder::new()
            .name("audio-feedback".to_string())
            .spawn(move || run_player(config, rx));

        match spawned {
            Ok(_) => Self {
                cues: Some(Mutex::new(tx)),
            },
            Err(e) => {
                tracing::warn!("Audio feedback unavailable: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self { cues: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.cues.is_some()
    }

    /// Queue a cue; never blocks
    pub fn play(&self, cue: Cue) {
        if let Some(cues) = &self.cues {
            let sender = cues.lock().unwrap_or_else(|p| p.into_inner());
            if sender.send(cue).is_err() {
                tracing::trace!("Audio feedback player is gone, dropping {:?}", cue);
            }
        }
    }
}

fn run_player(config: AudioFeedbackConfig, cues: Receiver<Cue>) {
    let theme = match load_theme(&config.theme) {
        Ok(theme) => theme,
        Err(e) => {
            tracing::warn!("{}, using default sounds", e);
            default_theme()
        }
    };

    let (_stream, handle) = match OutputStream::try_default() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("Failed to open audio output, feedback disabled: {}", e);
            return;
        }
    };

    for cue in cues {
        let data = match cue {
            Cue::ListenStart => &theme.start,
            Cue::ListenStop => &theme.stop,
            Cue::Error => &theme.error,
        };
        if data.is_empty() {
            continue;
        }

        let played = Decoder::new(Cursor::new(data.clone()))
            .map_err(|e| format!("Failed to decode audio: {}", e))
            .and_then(|source| {
                let sink = Sink::try_new(&handle)
                    .map_err(|e| format!("Failed to create audio sink: {}", e))?;
                sink.append(source.amplify(config.volume));
                sink.detach();
                Ok(())
            });
        if let Err(e) = played {
            tracing::warn!("Failed to play feedback sound: {}", e);
        }
    }
}

/// Load a sound theme by name or directory path
fn load_theme(theme_name: &str) -> Result<SoundTheme, String> {
    match theme_name {
        "default" => Ok(default_theme()),
        "subtle" => Ok(subtle_theme()),
        "mechanical" => Ok(mechanical_theme()),
        path => {
            let dir = PathBuf::from(path);
            if !dir.is_dir() {
                return Err(format!("Theme directory not found: {}", path));
            }
            let read = |name: &str| std::fs::read(dir.join(name)).unwrap_or_default();
            Ok(SoundTheme {
                start: read("start.wav"),
                stop: read("stop.wav"),
                error: read("error.wav"),
            })
        }
    }
}

/// One tone segment, or a noise click when `frequency` is zero
#[derive(Clone, Copy)]
struct Segment {
    frequency: f32,
    duration_ms: u32,
}

const fn tone(frequency: f32, duration_ms: u32) -> Segment {
    Segment {
        frequency,
        duration_ms,
    }
}

const fn click(duration_ms: u32) -> Segment {
    Segment {
        frequency: 0.0,
        duration_ms,
    }
}

/// Render segments back to back with a linear fade at both ends
fn render(segments: &[Segment], fade_ms: u32) -> Vec<u8> {
    let mut samples: Vec<i16> = Vec::new();
    for segment in segments {
        let count = (SAMPLE_RATE * segment.duration_ms / 1000) as usize;
        for i in 0..count {
            let value = if segment.frequency > 0.0 {
                let t = (samples.len() + i) as f32 / SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * segment.frequency * t).sin() * 16000.0
            } else {
                let decay = (-5.0 * i as f32 / count as f32).exp();
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                sign * decay * 12000.0
            };
            samples.push(value as i16);
        }
    }

    let fade = ((SAMPLE_RATE * fade_ms / 1000) as usize).min(samples.len() / 2);
    let len = samples.len();
    for i in 0..fade {
        let gain = i as f32 / fade as f32;
        samples[i] = (samples[i] as f32 * gain) as i16;
        samples[len - 1 - i] = (samples[len - 1 - i] as f32 * gain) as i16;
    }

    encode_wav(&samples, SAMPLE_RATE)
}

/// 16-bit mono PCM WAV
fn encode_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut wav = Vec::with_capacity(44 + data_len as usize);

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// Rising chirp to start, falling to stop
fn default_theme() -> SoundTheme {
    SoundTheme {
        start: render(&[tone(440.0, 75), tone(880.0, 75)], 20),
        stop: render(&[tone(880.0, 75), tone(440.0, 75)], 20),
        error: render(&[tone(300.0, 100), tone(200.0, 100)], 30),
    }
}

fn subtle_theme() -> SoundTheme {
    SoundTheme {
        start: render(&[tone(1200.0, 50)], 10),
        stop: render(&[tone(800.0, 50)], 10),
        error: render(&[tone(400.0, 50), tone(300.0, 50)], 15),
    }
}

fn mechanical_theme() -> SoundTheme {
    SoundTheme {
        start: render(&[click(30)], 0),
        stop: render(&[click(20)], 0),
        error: render(&[tone(150.0, 150)], 20),
    }
}
