//! Process context
//!
//! One [`VoiceContext`] owns every long-lived manager of a running server.
//! The daemon creates it with [`create`] and tears it down with
//! [`shutdown`]; tests build their own with [`VoiceContext::new`] and
//! injected backends.
//!
//! Managers that are slow to build (TTS, STT, hotkey) are built lazily.
//! Background loading builds them early; a getter that finds its
//! component still loading waits briefly for it, then builds on demand.

use crate::audio::{AudioFeedback, Cue};
use crate::config::{Config, OutputMode};
use crate::error::HotkeyError;
use crate::hotkey::{listener, HotkeyManager, KeySource, PressHandler};
use crate::loading::{ComponentLoadingCoordinator, ComponentType, Loader, CONSUMER_WAIT};
use crate::model_manager::{ModelCacheManager, ModelCacheSettings, StartReport};
use crate::output::{ClipboardBackend, KeyboardBackend, TextDeliveryEngine};
use crate::transcribe::handler::TranscriptionHandler;
use crate::transcribe::{self, ListenOptions, RecognizerFactory};
use crate::tts::{TtsEngine, TtsManager};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// External collaborators of a context
pub struct Backends {
    pub recognizers: Arc<dyn RecognizerFactory>,
    pub keyboard: Option<Arc<dyn KeyboardBackend>>,
    pub clipboard: Option<Arc<dyn ClipboardBackend>>,
    pub key_source: Arc<dyn KeySource>,
    /// Engines in fallback order; `None` detects the command engines
    pub tts_engines: Option<Vec<Arc<dyn TtsEngine>>>,
}

impl Backends {
    /// Backends found on this system
    pub fn detect(config: &Config) -> Self {
        Self {
            recognizers: transcribe::create_factory(&config.stt),
            keyboard: config
                .output
                .typing_enabled
                .then(|| crate::output::detect_keyboard(config.output.type_delay_ms))
                .flatten(),
            clipboard: config
                .output
                .clipboard_enabled
                .then(crate::output::detect_clipboard)
                .flatten(),
            key_source: listener::global(),
            tts_engines: None,
        }
    }
}

pub struct VoiceContext {
    config: Config,
    loading: ComponentLoadingCoordinator,
    model_cache: Option<Arc<ModelCacheManager>>,
    recognizers: Arc<dyn RecognizerFactory>,
    key_source: Arc<dyn KeySource>,
    tts_engines: Mutex<Option<Vec<Arc<dyn TtsEngine>>>>,
    tts: OnceLock<Arc<TtsManager>>,
    transcription: OnceLock<Arc<TranscriptionHandler>>,
    hotkey: OnceLock<Arc<HotkeyManager>>,
    delivery: Arc<TextDeliveryEngine>,
    feedback: AudioFeedback,
    this: Weak<VoiceContext>,
}

impl VoiceContext {
    pub fn new(config: Config, backends: Backends) -> Arc<Self> {
        let model_cache = (config.stt.enabled && config.stt.server_mode).then(|| {
            Arc::new(ModelCacheManager::new(
                ModelCacheSettings::from_config(&config.stt),
                Arc::clone(&backends.recognizers),
            ))
        });
        let delivery = Arc::new(TextDeliveryEngine::new(
            config.output.clone(),
            backends.keyboard,
            backends.clipboard,
        ));
        let feedback = AudioFeedback::new(&config.audio.feedback);

        Arc::new_cyclic(|this| Self {
            loading: ComponentLoadingCoordinator::new(),
            model_cache,
            recognizers: backends.recognizers,
            key_source: backends.key_source,
            tts_engines: Mutex::new(backends.tts_engines),
            tts: OnceLock::new(),
            transcription: OnceLock::new(),
            hotkey: OnceLock::new(),
            delivery,
            feedback,
            this: this.clone(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn loading(&self) -> &ComponentLoadingCoordinator {
        &self.loading
    }

    /// Shared model cache, present in server mode
    pub fn model_cache(&self) -> Option<&Arc<ModelCacheManager>> {
        self.model_cache.as_ref()
    }

    pub fn delivery(&self) -> &Arc<TextDeliveryEngine> {
        &self.delivery
    }

    pub fn feedback(&self) -> &AudioFeedback {
        &self.feedback
    }

    /// Open the model cache for requests and start its idle sweep.
    /// Loads nothing.
    pub fn launch_model_server(&self) -> bool {
        self.model_cache
            .as_ref()
            .map(|cache| cache.launch())
            .unwrap_or(false)
    }

    /// Load the configured preload models into the running cache
    pub fn preload_models(&self) -> Option<StartReport> {
        let cache = self.model_cache.as_ref()?;
        let report = cache.preload_configured();
        for (model, error) in &report.failed {
            tracing::warn!("Preloading model '{}' failed: {}", model, error);
        }
        Some(report)
    }

    /// Kick off background initialization of every enabled component
    pub fn start_background_loading(&self) -> bool {
        // The STT loader goes through the cache, so it must accept requests first
        self.launch_model_server();

        let mut loaders: Vec<(ComponentType, Loader)> = Vec::new();

        if self.config.tts.preload {
            let ctx = self.this.clone();
            loaders.push((
                ComponentType::Tts,
                Box::new(move || -> anyhow::Result<bool> {
                    Ok(upgrade(&ctx)?.build_tts().is_available())
                }),
            ));
        }
        if self.config.stt.enabled {
            let ctx = self.this.clone();
            loaders.push((
                ComponentType::Stt,
                Box::new(move || -> anyhow::Result<bool> {
                    upgrade(&ctx)?.build_transcription().preload()?;
                    Ok(true)
                }),
            ));
        }
        if self.config.hotkey.enabled {
            let ctx = self.this.clone();
            loaders.push((
                ComponentType::Hotkey,
                Box::new(move || -> anyhow::Result<bool> {
                    upgrade(&ctx)?.start_hotkey()?;
                    Ok(true)
                }),
            ));
        }

        self.loading.start_background_loading(loaders)
    }

    fn build_tts(&self) -> Arc<TtsManager> {
        Arc::clone(self.tts.get_or_init(|| {
            let engines = self
                .tts_engines
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();
            let manager = match engines {
                Some(engines) => TtsManager::with_engines(self.config.tts.clone(), engines),
                None => TtsManager::new(self.config.tts.clone()),
            };
            Arc::new(manager)
        }))
    }

    fn build_transcription(&self) -> Arc<TranscriptionHandler> {
        Arc::clone(self.transcription.get_or_init(|| {
            Arc::new(TranscriptionHandler::new(
                self.config.stt.clone(),
                Arc::clone(&self.recognizers),
                self.model_cache.clone(),
            ))
        }))
    }

    fn build_hotkey(&self) -> Arc<HotkeyManager> {
        Arc::clone(self.hotkey.get_or_init(|| {
            Arc::new(HotkeyManager::with_source(
                self.config.hotkey.clone(),
                self.config.lock_dir(),
                self.config.stt.silence_threshold(),
                Arc::clone(&self.key_source),
            ))
        }))
    }

    pub fn tts(&self) -> Arc<TtsManager> {
        self.loading.settle(ComponentType::Tts, CONSUMER_WAIT);
        self.build_tts()
    }

    pub fn transcription(&self) -> Arc<TranscriptionHandler> {
        self.loading.settle(ComponentType::Stt, CONSUMER_WAIT);
        self.build_transcription()
    }

    pub fn hotkey_manager(&self) -> Arc<HotkeyManager> {
        self.loading.settle(ComponentType::Hotkey, CONSUMER_WAIT);
        self.build_hotkey()
    }

    /// Begin monitoring the configured hotkey with dictation as the handler
    pub fn start_hotkey(&self) -> Result<(), HotkeyError> {
        let ctx = self.this.clone();
        let handler: PressHandler = Arc::new(move || {
            if let Some(ctx) = ctx.upgrade() {
                ctx.handle_hotkey_press();
            }
        });
        self.build_hotkey().start_monitoring(None, handler)
    }

    /// Dictation triggered by the hotkey
    pub fn handle_hotkey_press(&self) {
        let mode = self.config.hotkey.output_mode;
        tracing::info!("Hotkey activated, starting dictation ({})", mode);

        if mode != OutputMode::Typing {
            let reply = crate::tools::listen(self, None, None, mode);
            tracing::info!(
                "Hotkey dictation finished: {:?}, {} characters",
                reply.status,
                reply.transcription.chars().count()
            );
            return;
        }

        let handler = self.transcription();
        self.delivery.reset();
        self.feedback.play(Cue::ListenStart);

        let options = ListenOptions {
            language: Some(self.config.stt.language.clone()),
            max_duration: None,
        };
        let result = handler.transcribe_with_realtime_output(&self.delivery, &options, mode);

        if result.is_success() {
            self.feedback.play(Cue::ListenStop);
            tracing::info!(
                "Hotkey dictation finished: {} characters in {:.1}s",
                result.text.chars().count(),
                result.duration_secs
            );
        } else {
            self.feedback.play(Cue::Error);
            tracing::warn!("Hotkey dictation failed: {}", result.error.unwrap_or_default());
        }
    }

    /// Stop background work and release every resource. Safe to repeat.
    pub fn shutdown(&self) {
        self.loading.shutdown();
        if let Some(hotkey) = self.hotkey.get() {
            hotkey.stop_monitoring();
        }
        if let Some(tts) = self.tts.get() {
            tts.stop();
        }
        if let Some(handler) = self.transcription.get() {
            handler.release();
        }
        if let Some(cache) = &self.model_cache {
            cache.stop();
        }
        if self.delivery.is_session_active() {
            self.delivery.end_session();
        }
        tracing::debug!("Voice context shut down");
    }
}

fn upgrade(ctx: &Weak<VoiceContext>) -> anyhow::Result<Arc<VoiceContext>> {
    ctx.upgrade()
        .ok_or_else(|| anyhow::anyhow!("voice context was dropped"))
}

static CURRENT: Mutex<Option<Arc<VoiceContext>>> = Mutex::new(None);

fn current_slot() -> std::sync::MutexGuard<'static, Option<Arc<VoiceContext>>> {
    CURRENT.lock().unwrap_or_else(|p| p.into_inner())
}

/// Install a new process context, shutting down any previous one
pub fn create(config: Config) -> Arc<VoiceContext> {
    let backends = Backends::detect(&config);
    let ctx = VoiceContext::new(config, backends);
    let previous = current_slot().replace(Arc::clone(&ctx));
    if let Some(previous) = previous {
        tracing::debug!("Replacing existing voice context");
        previous.shutdown();
    }
    ctx
}

/// The process context, creating it from `config` if there is none
pub fn get_or_create(config: impl FnOnce() -> Config) -> Arc<VoiceContext> {
    let mut slot = current_slot();
    if let Some(ctx) = slot.as_ref() {
        return Arc::clone(ctx);
    }
    let config = config();
    let backends = Backends::detect(&config);
    let ctx = VoiceContext::new(config, backends);
    *slot = Some(Arc::clone(&ctx));
    ctx
}

pub fn current() -> Option<Arc<VoiceContext>> {
    current_slot().clone()
}

/// Shut down and remove the process context
pub fn shutdown() {
    let ctx = current_slot().take();
    if let Some(ctx) = ctx {
        ctx.shutdown();
    }
}
