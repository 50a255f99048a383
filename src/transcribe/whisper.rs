//! Whisper-based speech recognition
//!
//! Uses whisper.cpp via the whisper-rs crate. Audio comes from the
//! microphone through [`CpalCapture`]; while the speaker talks the
//! buffer recorded so far is re-transcribed periodically to produce
//! interim text.

use super::{DeviceSpec, ListenOptions, RecognizerFactory, SpeechRecognizer};
use crate::audio::{CpalCapture, SilenceDetector, TARGET_SAMPLE_RATE};
use crate::config::{Config, SttConfig};
use crate::error::{AudioError, TranscribeError};
use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Minimum gap between interim transcriptions
const INTERIM_INTERVAL: Duration = Duration::from_millis(1200);

/// Poll interval while waiting for audio chunks
const CHUNK_POLL: Duration = Duration::from_millis(100);

/// Builds [`WhisperRecognizer`]s from the STT configuration
pub struct WhisperRecognizerFactory {
    config: SttConfig,
}

impl WhisperRecognizerFactory {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }
}

impl RecognizerFactory for WhisperRecognizerFactory {
    fn create(
        &self,
        model: &str,
        device: &DeviceSpec,
    ) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
        Ok(Arc::new(WhisperRecognizer::new(model, device, &self.config)?))
    }
}

/// Whisper model plus recording settings
pub struct WhisperRecognizer {
    /// Whisper context (holds the model)
    ctx: WhisperContext,
    model: String,
    language: String,
    threads: usize,
    silence_threshold: Duration,
    max_duration: Duration,
    audio_device: String,
}

impl WhisperRecognizer {
    pub fn new(model: &str, device: &DeviceSpec, config: &SttConfig) -> Result<Self, TranscribeError> {
        let model_path = resolve_model_path(model)?;

        tracing::info!("Loading whisper model from {:?} on {}", model_path, device.device);
        let start = Instant::now();

        let mut params = WhisperContextParameters::default();
        params.use_gpu(device.is_gpu());

        let ctx = WhisperContext::new_with_params(
            model_path
                .to_str()
                .ok_or_else(|| TranscribeError::ModelNotFound("Invalid path".to_string()))?,
            params,
        )
        .map_err(|e| TranscribeError::InitFailed(e.to_string()))?;

        tracing::info!("Model loaded in {:.2}s", start.elapsed().as_secs_f32());

        Ok(Self {
            ctx,
            model: model.to_string(),
            language: config.language.clone(),
            threads: config.threads.unwrap_or_else(|| num_cpus::get().min(4)),
            silence_threshold: config.silence_threshold(),
            max_duration: Duration::from_secs(u64::from(config.max_duration_secs)),
            audio_device: config.audio_device.clone(),
        })
    }

    /// Transcribe 16 kHz mono samples
    pub fn transcribe(&self, samples: &[f32], language: &str) -> Result<String, TranscribeError> {
        if samples.is_empty() {
            return Err(TranscribeError::Audio(AudioError::EmptyRecording));
        }

        let duration_secs = samples.len() as f32 / TARGET_SAMPLE_RATE as f32;
        tracing::debug!(
            "Transcribing {:.2}s of audio ({} samples)",
            duration_secs,
            samples.len()
        );

        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| TranscribeError::InferenceFailed(e.to_string()))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        if language == "auto" {
            params.set_language(None);
        } else {
            params.set_language(Some(language));
        }
        params.set_n_threads(self.threads as i32);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        params.set_suppress_blank(true);
        params.set_suppress_nst(true);
        if duration_secs < 30.0 {
            params.set_single_segment(true);
        }
        if let Some(audio_ctx) = calculate_audio_ctx(duration_secs) {
            params.set_audio_ctx(audio_ctx);
        }

        state
            .full(params, samples)
            .map_err(|e| TranscribeError::InferenceFailed(e.to_string()))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            text.push_str(
                segment
                    .to_str()
                    .map_err(|e| TranscribeError::InferenceFailed(e.to_string()))?,
            );
        }
        Ok(text.trim().to_string())
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn listen(
        &self,
        options: &ListenOptions,
        on_interim: &mut dyn FnMut(&str),
    ) -> Result<String, TranscribeError> {
        let language = options.language.as_deref().unwrap_or(&self.language);
        let max_duration = options.max_duration.unwrap_or(self.max_duration);

        let mut capture = CpalCapture::new(&self.audio_device);
        let chunks = capture.start()?;
        let mut detector = SilenceDetector::new(self.silence_threshold);
        let mut audio: Vec<f32> = Vec::new();
        let started = Instant::now();
        let mut last_interim = Instant::now();
        let mut last_interim_len = 0;

        tracing::debug!(
            "Listening (max {:?}, silence threshold {:?})",
            max_duration,
            self.silence_threshold
        );

        loop {
            match chunks.recv_timeout(CHUNK_POLL) {
                Ok(chunk) => {
                    detector.feed(&chunk);
                    audio.extend_from_slice(&chunk);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Audio stream closed while listening");
                    break;
                }
            }

            if detector.speech_ended() {
                tracing::debug!("End of speech after {:.2?}", started.elapsed());
                break;
            }
            if started.elapsed() >= max_duration {
                tracing::debug!("Reached maximum recording length {:?}", max_duration);
                break;
            }

            if detector.heard_speech()
                && last_interim.elapsed() >= INTERIM_INTERVAL
                && audio.len() > last_interim_len
            {
                match self.transcribe(&audio, language) {
                    Ok(text) if !text.is_empty() => on_interim(&text),
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Interim transcription failed: {}", e),
                }
                last_interim = Instant::now();
                last_interim_len = audio.len();
            }
        }
        capture.stop();

        if audio.is_empty() {
            return Err(TranscribeError::Audio(AudioError::EmptyRecording));
        }
        if !detector.heard_speech() {
            tracing::debug!("No speech detected");
            return Ok(String::new());
        }

        let start = Instant::now();
        let text = self.transcribe(&audio, language)?;
        tracing::info!(
            "Transcription completed in {:.2}s: {:?}",
            start.elapsed().as_secs_f32(),
            if text.chars().count() > 50 {
                format!("{}...", text.chars().take(50).collect::<String>())
            } else {
                text.clone()
            }
        );
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn release(&self) {
        tracing::debug!("Releasing whisper model '{}'", self.model);
    }
}

/// Resolve model name to file path
fn resolve_model_path(model: &str) -> Result<PathBuf, TranscribeError> {
    let path = PathBuf::from(model);
    if path.is_absolute() && path.exists() {
        return Ok(path);
    }

    let filename = get_model_filename(model).ok_or_else(|| {
        TranscribeError::ModelNotFound(format!(
            "Unknown model: '{}'. Valid models: tiny, base, small, medium, large-v3, large-v3-turbo",
            model
        ))
    })?;

    let candidates = [
        Config::models_dir().join(&filename),
        PathBuf::from(&filename),
        PathBuf::from("models").join(&filename),
    ];
    if let Some(found) = candidates.iter().find(|p| p.exists()) {
        return Ok(found.clone());
    }

    Err(TranscribeError::ModelNotFound(format!(
        "Model '{}' not found. Looked in:\n{}\n\nDownload from: {}",
        model,
        candidates
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n"),
        get_model_url(&filename)
    )))
}

/// ggml file name for a model name
pub fn get_model_filename(model: &str) -> Option<String> {
    let filename = match model {
        "tiny" | "tiny.en" | "base" | "base.en" | "small" | "small.en" | "medium"
        | "medium.en" | "large-v2" | "large-v3" | "large-v3-turbo" => format!("ggml-{}.bin", model),
        "large" | "large-v1" => "ggml-large-v1.bin".to_string(),
        other if other.ends_with(".bin") => other.to_string(),
        _ => return None,
    };
    Some(filename)
}

fn get_model_url(filename: &str) -> String {
    format!(
        "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
        filename
    )
}

/// Calculate audio_ctx parameter for short clips (≤22.5s).
/// Formula: duration_seconds * 50 + 64
fn calculate_audio_ctx(duration_secs: f32) -> Option<i32> {
    if duration_secs <= 22.5 {
        Some((duration_secs * 50.0) as i32 + 64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_filenames() {
        assert_eq!(get_model_filename("base.en").as_deref(), Some("ggml-base.en.bin"));
        assert_eq!(get_model_filename("large").as_deref(), Some("ggml-large-v1.bin"));
        assert_eq!(get_model_filename("custom.bin").as_deref(), Some("custom.bin"));
        assert!(get_model_filename("gigantic").is_none());
    }

    #[test]
    fn test_unknown_model_is_not_found() {
        assert!(matches!(
            resolve_model_path("gigantic"),
            Err(TranscribeError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_audio_ctx() {
        assert_eq!(calculate_audio_ctx(2.0), Some(164));
        assert_eq!(calculate_audio_ctx(30.0), None);
    }
}
