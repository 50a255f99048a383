//! Transcription entry point used by tools and the hotkey
//!
//! In server mode recognizers come from the shared model cache, and a
//! model the cache cannot produce is built for the one call only. Without
//! a cache a recognizer is built directly and kept for later calls.

use super::{ListenOptions, RecognizerFactory, SpeechRecognizer};
use crate::config::{OutputMode, SttConfig};
use crate::error::TranscribeError;
use crate::model_manager::ModelCacheManager;
use crate::output::{OutputResult, TextDeliveryEngine};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionStatus {
    Success,
    /// Text was recognized but could not be delivered
    PartialSuccess,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    pub status: TranscriptionStatus,
    /// Final transcript, or the last interim one when recording failed
    pub text: String,
    pub duration_secs: f64,
    pub language: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputResult>,
}

impl TranscriptionResult {
    pub fn is_success(&self) -> bool {
        self.status != TranscriptionStatus::Error
    }
}

pub struct TranscriptionHandler {
    config: SttConfig,
    factory: Arc<dyn RecognizerFactory>,
    cache: Option<Arc<ModelCacheManager>>,
    local: Mutex<Option<Arc<dyn SpeechRecognizer>>>,
}

impl TranscriptionHandler {
    pub fn new(
        config: SttConfig,
        factory: Arc<dyn RecognizerFactory>,
        cache: Option<Arc<ModelCacheManager>>,
    ) -> Self {
        Self {
            config,
            factory,
            cache,
            local: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn uses_server(&self) -> bool {
        self.cache.is_some()
    }

    /// Recognizer for the configured model
    pub fn recognizer(&self) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
        if !self.config.enabled {
            return Err(TranscribeError::Unavailable(
                "speech-to-text is disabled in the config".to_string(),
            ));
        }

        if let Some(cache) = &self.cache {
            if let Some(recognizer) = cache.get_model_recorder(&self.config.model) {
                return Ok(recognizer);
            }
            // Server mode keeps no private copy; the cache owns long-lived models
            tracing::warn!(
                "Model server could not provide '{}', loading it for this call only",
                self.config.model
            );
            return self.create();
        }

        let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(recognizer) = local.as_ref() {
            return Ok(Arc::clone(recognizer));
        }
        let recognizer = self.create()?;
        *local = Some(Arc::clone(&recognizer));
        Ok(recognizer)
    }

    fn create(&self) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
        let device = self.factory.device_for(&self.config.model);
        self.factory.create(&self.config.model, &device)
    }

    /// Load the model now so the first dictation starts quickly
    ///
    /// In server mode the model is loaded into the cache, which must be
    /// running.
    pub fn preload(&self) -> Result<(), TranscribeError> {
        if !self.config.enabled {
            return Err(TranscribeError::Unavailable(
                "speech-to-text is disabled in the config".to_string(),
            ));
        }

        let start = Instant::now();
        match &self.cache {
            Some(cache) => {
                cache
                    .preload_model(&self.config.model)
                    .map_err(|e| TranscribeError::Unavailable(e.to_string()))?;
            }
            None => {
                self.recognizer()?;
            }
        }
        tracing::debug!("STT model '{}' ready in {:.2?}", self.config.model, start.elapsed());
        Ok(())
    }

    fn language(&self, options: &ListenOptions) -> String {
        options
            .language
            .clone()
            .unwrap_or_else(|| self.config.language.clone())
    }

    fn result(
        &self,
        options: &ListenOptions,
        started: Instant,
        status: TranscriptionStatus,
        text: String,
    ) -> TranscriptionResult {
        TranscriptionResult {
            status,
            text,
            duration_secs: started.elapsed().as_secs_f64(),
            language: self.language(options),
            model: self.config.model.clone(),
            warning: None,
            error: None,
            output: None,
        }
    }

    /// Record one utterance and return its transcript
    pub fn transcribe_once(&self, options: &ListenOptions) -> TranscriptionResult {
        let started = Instant::now();
        let mut last_interim = String::new();

        let outcome = self
            .recognizer()
            .and_then(|r| r.listen(options, &mut |text: &str| last_interim = text.to_string()));

        match outcome {
            Ok(text) => self.result(options, started, TranscriptionStatus::Success, text),
            Err(e) => {
                tracing::error!("Transcription failed: {}", e);
                TranscriptionResult {
                    error: Some(e.to_string()),
                    ..self.result(options, started, TranscriptionStatus::Error, last_interim)
                }
            }
        }
    }

    /// Record one utterance, delivering text while the speaker talks
    ///
    /// In typing mode interim hypotheses are typed (debounced) inside a
    /// delivery session and the final transcript is forced through. Other
    /// modes deliver only the final transcript.
    pub fn transcribe_with_realtime_output(
        &self,
        engine: &TextDeliveryEngine,
        options: &ListenOptions,
        mode: OutputMode,
    ) -> TranscriptionResult {
        let started = Instant::now();
        let recognizer = match self.recognizer() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Speech recognition unavailable: {}", e);
                return TranscriptionResult {
                    error: Some(e.to_string()),
                    ..self.result(options, started, TranscriptionStatus::Error, String::new())
                };
            }
        };

        let live = mode == OutputMode::Typing;
        if live {
            engine.start_session();
        }

        let mut last_interim = String::new();
        let outcome = recognizer.listen(options, &mut |text: &str| {
            last_interim = text.to_string();
            if live {
                let result = engine.output_text(text, OutputMode::Typing, false);
                if !result.success {
                    tracing::debug!("Interim output failed: {:?}", result.error);
                }
            }
        });

        let mut result = match outcome {
            Ok(text) => {
                let output = engine.output_text(&text, mode, live);
                let mut result = self.result(options, started, TranscriptionStatus::Success, text);
                if !output.success {
                    result.status = TranscriptionStatus::PartialSuccess;
                    result.warning = Some(format!(
                        "Transcription succeeded but output failed: {}",
                        output.error.as_deref().unwrap_or("unknown error")
                    ));
                }
                result.output = Some(output);
                result
            }
            Err(e) => {
                tracing::error!("Transcription failed: {}", e);
                TranscriptionResult {
                    error: Some(e.to_string()),
                    ..self.result(options, started, TranscriptionStatus::Error, last_interim)
                }
            }
        };

        if live {
            let ended = engine.end_session_delayed();
            if let Some(e) = ended.error {
                tracing::warn!("Clipboard restore failed: {}", e);
            }
        }
        result.duration_secs = started.elapsed().as_secs_f64();
        result
    }

    /// Drop the directly loaded recognizer, if any
    pub fn release(&self) {
        let recognizer = self.local.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(recognizer) = recognizer {
            recognizer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::error::OutputError;
    use crate::model_manager::ModelCacheSettings;
    use crate::output::KeyboardBackend;
    use crate::transcribe::DeviceSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRecognizer {
        interim: Vec<&'static str>,
        final_text: Result<&'static str, &'static str>,
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn listen(
            &self,
            _options: &ListenOptions,
            on_interim: &mut dyn FnMut(&str),
        ) -> Result<String, TranscribeError> {
            for text in &self.interim {
                on_interim(text);
            }
            self.final_text
                .map(String::from)
                .map_err(|e| TranscribeError::InferenceFailed(e.to_string()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct ScriptedFactory {
        creates: AtomicUsize,
        final_text: Result<&'static str, &'static str>,
    }

    impl ScriptedFactory {
        fn new(final_text: Result<&'static str, &'static str>) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
                final_text,
            })
        }
    }

    impl RecognizerFactory for ScriptedFactory {
        fn create(
            &self,
            _model: &str,
            _device: &DeviceSpec,
        ) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(ScriptedRecognizer {
                interim: vec!["hello", "hello wor"],
                final_text: self.final_text,
            }))
        }

        fn device_for(&self, _model: &str) -> DeviceSpec {
            DeviceSpec::cpu()
        }
    }

    #[derive(Default)]
    struct Typed(Mutex<Vec<String>>);

    impl KeyboardBackend for Typed {
        fn type_text(&self, text: &str) -> Result<(), OutputError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn backspace(&self, count: usize) -> Result<(), OutputError> {
            self.0.lock().unwrap().push(format!("<{}", count));
            Ok(())
        }

        fn paste_shortcut(&self) -> Result<(), OutputError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "typed"
        }
    }

    fn engine(keyboard: Option<Arc<Typed>>) -> TextDeliveryEngine {
        let config = OutputConfig {
            debounce_delay_ms: 0,
            session_end_delay_ms: 0,
            ..OutputConfig::default()
        };
        TextDeliveryEngine::new(
            config,
            keyboard.map(|k| k as Arc<dyn KeyboardBackend>),
            None,
        )
    }

    #[test]
    fn test_transcribe_once_reuses_local_recognizer() {
        let factory = ScriptedFactory::new(Ok("hello world"));
        let handler = TranscriptionHandler::new(SttConfig::default(), factory.clone(), None);

        let first = handler.transcribe_once(&ListenOptions::default());
        assert_eq!(first.status, TranscriptionStatus::Success);
        assert_eq!(first.text, "hello world");
        assert_eq!(first.language, "en");
        handler.transcribe_once(&ListenOptions::default());
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_keeps_interim_text() {
        let factory = ScriptedFactory::new(Err("device lost"));
        let handler = TranscriptionHandler::new(SttConfig::default(), factory, None);
        let result = handler.transcribe_once(&ListenOptions {
            language: Some("de".into()),
            ..Default::default()
        });
        assert_eq!(result.status, TranscriptionStatus::Error);
        assert_eq!(result.text, "hello wor");
        assert_eq!(result.language, "de");
        assert!(result.error.unwrap().contains("device lost"));
    }

    #[test]
    fn test_disabled_stt() {
        let config = SttConfig {
            enabled: false,
            ..SttConfig::default()
        };
        let handler = TranscriptionHandler::new(config, ScriptedFactory::new(Ok("x")), None);
        assert!(handler.preload().is_err());
    }

    #[test]
    fn test_server_mode_goes_through_cache() {
        let factory = ScriptedFactory::new(Ok("cached"));
        let cache = Arc::new(ModelCacheManager::new(
            ModelCacheSettings::from_config(&SttConfig::default()),
            factory.clone(),
        ));
        cache.start();
        let handler = TranscriptionHandler::new(SttConfig::default(), factory.clone(), Some(cache.clone()));

        handler.preload().unwrap();
        handler.transcribe_once(&ListenOptions::default());
        assert!(handler.uses_server());
        assert!(cache.is_loaded("base"));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);
        cache.stop();
    }

    #[test]
    fn test_server_mode_does_not_keep_fallback_recognizer() {
        let factory = ScriptedFactory::new(Ok("direct"));
        let cache = Arc::new(ModelCacheManager::new(
            ModelCacheSettings::from_config(&SttConfig::default()),
            factory.clone(),
        ));
        let handler = TranscriptionHandler::new(SttConfig::default(), factory.clone(), Some(cache.clone()));

        // Cache not running yet
        assert!(handler.preload().is_err());
        assert_eq!(handler.transcribe_once(&ListenOptions::default()).text, "direct");
        assert!(handler.local.lock().unwrap().is_none());

        cache.launch();
        handler.preload().unwrap();
        handler.transcribe_once(&ListenOptions::default());
        assert!(cache.is_loaded("base"));
        assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
        cache.stop();
    }

    #[test]
    fn test_realtime_typing_reconciles_interim_text() {
        let keyboard = Arc::new(Typed::default());
        let engine = engine(Some(keyboard.clone()));
        let handler =
            TranscriptionHandler::new(SttConfig::default(), ScriptedFactory::new(Ok("hello world")), None);

        let result =
            handler.transcribe_with_realtime_output(&engine, &ListenOptions::default(), OutputMode::Typing);
        assert_eq!(result.status, TranscriptionStatus::Success);
        assert_eq!(
            *keyboard.0.lock().unwrap(),
            vec!["hello", " wor", "ld"]
        );
        assert!(!engine.is_session_active());
    }

    #[test]
    fn test_output_failure_is_partial_success() {
        let engine = engine(None);
        let handler =
            TranscriptionHandler::new(SttConfig::default(), ScriptedFactory::new(Ok("hello world")), None);
        let result =
            handler.transcribe_with_realtime_output(&engine, &ListenOptions::default(), OutputMode::Typing);
        assert_eq!(result.status, TranscriptionStatus::PartialSuccess);
        assert_eq!(result.text, "hello world");
        assert!(result.warning.as_ref().unwrap().contains("output failed"));
        assert!(result.is_success());
    }

    #[test]
    fn test_return_mode_has_no_side_effects() {
        let keyboard = Arc::new(Typed::default());
        let engine = engine(Some(keyboard.clone()));
        let handler =
            TranscriptionHandler::new(SttConfig::default(), ScriptedFactory::new(Ok("hello world")), None);
        let result =
            handler.transcribe_with_realtime_output(&engine, &ListenOptions::default(), OutputMode::Return);
        assert_eq!(result.status, TranscriptionStatus::Success);
        assert!(keyboard.0.lock().unwrap().is_empty());
    }
}
