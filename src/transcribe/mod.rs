//! Speech-to-text
//!
//! A [`SpeechRecognizer`] records from the microphone until the speaker
//! goes quiet, reporting interim hypotheses along the way and returning
//! the final text. A [`RecognizerFactory`] builds recognizers for a model
//! name; the model cache and the one-off path both go through it.
//!
//! The shipped backend ([`whisper`]) runs whisper.cpp on audio captured
//! with cpal.

pub mod handler;
pub mod whisper;

use crate::config::SttConfig;
use crate::error::TranscribeError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Per-call recording options
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    /// Overrides the configured language
    pub language: Option<String>,
    /// Overrides the configured maximum recording length
    pub max_duration: Option<Duration>,
}

/// A loaded speech-recognition model able to record and transcribe
pub trait SpeechRecognizer: Send + Sync {
    /// Record until trailing silence (or the duration cap), calling
    /// `on_interim` with each provisional transcript. Returns the final
    /// transcript.
    fn listen(
        &self,
        options: &ListenOptions,
        on_interim: &mut dyn FnMut(&str),
    ) -> Result<String, TranscribeError>;

    fn model_name(&self) -> &str;

    /// Free model resources ahead of drop
    fn release(&self) {}
}

/// Compute placement of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSpec {
    pub device: String,
    pub compute_type: String,
}

impl DeviceSpec {
    pub fn cpu() -> Self {
        Self {
            device: "cpu".to_string(),
            compute_type: "int8".to_string(),
        }
    }

    /// Best device this build can use
    pub fn detect() -> Self {
        let gpu = if cfg!(any(feature = "gpu-cuda", feature = "gpu-hipblas")) {
            Some("cuda")
        } else if cfg!(feature = "gpu-vulkan") {
            Some("vulkan")
        } else if cfg!(feature = "gpu-metal") {
            Some("metal")
        } else {
            None
        };

        match gpu {
            Some(device) => Self {
                device: device.to_string(),
                compute_type: "float16".to_string(),
            },
            None => Self::cpu(),
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.device != "cpu"
    }
}

/// Builds recognizers for model names
pub trait RecognizerFactory: Send + Sync {
    fn create(
        &self,
        model: &str,
        device: &DeviceSpec,
    ) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError>;

    /// Device a model should be loaded on
    fn device_for(&self, _model: &str) -> DeviceSpec {
        DeviceSpec::detect()
    }
}

/// Approximate resident memory of a loaded model, in megabytes
pub fn estimate_memory_mb(model: &str, device: &DeviceSpec) -> u64 {
    let name = model.to_lowercase();
    let base = if name.contains("large-v3-turbo") {
        809
    } else if name.contains("large") {
        1550
    } else if name.contains("medium") {
        769
    } else if name.contains("small") {
        244
    } else if name.contains("base") {
        74
    } else if name.contains("tiny") {
        39
    } else {
        244
    };

    if device.is_gpu() {
        base * 6 / 5
    } else {
        base
    }
}

/// Approximate resident memory of a loaded model, in bytes
pub fn estimate_memory_bytes(model: &str, device: &DeviceSpec) -> u64 {
    estimate_memory_mb(model, device) * 1024 * 1024
}

/// Recognizer factory for the configured backend
pub fn create_factory(config: &SttConfig) -> Arc<dyn RecognizerFactory> {
    tracing::debug!(
        "Creating whisper recognizer factory: language={}, silence_threshold={}s",
        config.language,
        config.silence_threshold_secs
    );
    Arc::new(whisper::WhisperRecognizerFactory::new(config.clone()))
}
