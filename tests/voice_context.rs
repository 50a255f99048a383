//! End-to-end tests of the voice tools on a context with scripted backends
//!
//! Nothing here touches real audio, keyboards or speech engines: the
//! recognizer replays a fixed utterance, the keyboard edits an in-memory
//! "screen", and hotkey presses come from a manual key source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use voice_mcp::config::{Config, OutputMode};
use voice_mcp::context::{Backends, VoiceContext};
use voice_mcp::error::{OutputError, TranscribeError, TtsError, VoiceError};
use voice_mcp::hotkey::{Hotkey, ManualKeySource};
use voice_mcp::loading::{ComponentStatus, ComponentType};
use voice_mcp::output::{ClipboardBackend, KeyboardBackend};
use voice_mcp::tools;
use voice_mcp::transcribe::handler::TranscriptionStatus;
use voice_mcp::transcribe::{DeviceSpec, ListenOptions, RecognizerFactory, SpeechRecognizer};
use voice_mcp::tts::{SpeakOptions, TtsEngine, Voice};

// ============================================================================
// Scripted backends
// ============================================================================

struct Utterance {
    interim: Vec<&'static str>,
    final_text: &'static str,
}

impl SpeechRecognizer for Utterance {
    fn listen(
        &self,
        _options: &ListenOptions,
        on_interim: &mut dyn FnMut(&str),
    ) -> Result<String, TranscribeError> {
        for text in &self.interim {
            on_interim(text);
        }
        Ok(self.final_text.to_string())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Counts loads per model; each load takes a little while like a real one
#[derive(Default)]
struct UtteranceFactory {
    creates: Mutex<HashMap<String, usize>>,
}

impl UtteranceFactory {
    fn creates_of(&self, model: &str) -> usize {
        self.creates.lock().unwrap().get(model).copied().unwrap_or(0)
    }
}

impl RecognizerFactory for UtteranceFactory {
    fn create(
        &self,
        model: &str,
        _device: &DeviceSpec,
    ) -> Result<Arc<dyn SpeechRecognizer>, TranscribeError> {
        *self.creates.lock().unwrap().entry(model.to_string()).or_default() += 1;
        thread::sleep(Duration::from_millis(50));
        Ok(Arc::new(Utterance {
            interim: vec!["hello", "hello wor", "hello world"],
            final_text: "Hello world.",
        }))
    }

    fn device_for(&self, _model: &str) -> DeviceSpec {
        DeviceSpec::cpu()
    }
}

/// Keyboard that edits a text buffer the way a focused text field would
#[derive(Default)]
struct ScreenKeyboard {
    screen: Mutex<String>,
}

impl ScreenKeyboard {
    fn screen(&self) -> String {
        self.screen.lock().unwrap().clone()
    }
}

impl KeyboardBackend for ScreenKeyboard {
    fn type_text(&self, text: &str) -> Result<(), OutputError> {
        self.screen.lock().unwrap().push_str(text);
        Ok(())
    }

    fn backspace(&self, count: usize) -> Result<(), OutputError> {
        let mut screen = self.screen.lock().unwrap();
        for _ in 0..count {
            screen.pop();
        }
        Ok(())
    }

    fn paste_shortcut(&self) -> Result<(), OutputError> {
        Err(OutputError::CtrlVFailed("no clipboard attached".to_string()))
    }

    fn name(&self) -> &'static str {
        "screen"
    }
}

#[derive(Default)]
struct MemoryClipboard {
    content: Mutex<String>,
}

impl ClipboardBackend for MemoryClipboard {
    fn read(&self) -> Result<String, OutputError> {
        Ok(self.content.lock().unwrap().clone())
    }

    fn write(&self, text: &str) -> Result<(), OutputError> {
        *self.content.lock().unwrap() = text.to_string();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Default)]
struct RecordingEngine {
    spoken: Mutex<Vec<(String, Option<String>, u32)>>,
}

impl TtsEngine for RecordingEngine {
    fn speak(&self, text: &str, options: &SpeakOptions) -> Result<(), TtsError> {
        self.spoken
            .lock()
            .unwrap()
            .push((text.to_string(), options.voice.clone(), options.rate));
        Ok(())
    }

    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            id: "en-us".to_string(),
            name: "English (America)".to_string(),
            language: Some("en-US".to_string()),
            gender: Some("male".to_string()),
        }]
    }

    fn is_available(&self) -> bool {
        true
    }

    fn stop(&self) {}

    fn name(&self) -> &str {
        "recording"
    }
}

struct Harness {
    ctx: Arc<VoiceContext>,
    keyboard: Arc<ScreenKeyboard>,
    clipboard: Arc<MemoryClipboard>,
    engine: Arc<RecordingEngine>,
    keys: Arc<ManualKeySource>,
    recognizers: Arc<UtteranceFactory>,
    _lock_dir: tempfile::TempDir,
}

fn harness(configure: impl FnOnce(&mut Config), with_clipboard: bool) -> Harness {
    let lock_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.audio.feedback.enabled = false;
    config.stt.preload_models.clear();
    config.hotkey.name = "f9".to_string();
    config.hotkey.lock_directory = Some(lock_dir.path().to_path_buf());
    config.output.session_end_delay_ms = 10;
    config.output.paste_settle_ms = 0;
    configure(&mut config);

    let keyboard = Arc::new(ScreenKeyboard::default());
    let clipboard = Arc::new(MemoryClipboard::default());
    let engine = Arc::new(RecordingEngine::default());
    let keys = Arc::new(ManualKeySource::new());
    let recognizers = Arc::new(UtteranceFactory::default());

    let backends = Backends {
        recognizers: recognizers.clone(),
        keyboard: Some(keyboard.clone() as Arc<dyn KeyboardBackend>),
        clipboard: with_clipboard.then(|| clipboard.clone() as Arc<dyn ClipboardBackend>),
        key_source: keys.clone(),
        tts_engines: Some(vec![engine.clone() as Arc<dyn TtsEngine>]),
    };

    Harness {
        ctx: VoiceContext::new(config, backends),
        keyboard,
        clipboard,
        engine,
        keys,
        recognizers,
        _lock_dir: lock_dir,
    }
}

// ============================================================================
// Tools
// ============================================================================

#[test]
fn speak_uses_call_overrides() {
    let h = harness(|_| {}, true);
    let message = tools::speak(&h.ctx, "  Good morning  ", Some("en-us"), Some(220), None).unwrap();
    assert_eq!(message, "Spoke 12 characters using recording");

    let spoken = h.engine.spoken.lock().unwrap().clone();
    assert_eq!(spoken, vec![("Good morning".to_string(), Some("en-us".to_string()), 220)]);
}

#[test]
fn speak_rejects_empty_text() {
    let h = harness(|_| {}, true);
    let err = tools::speak(&h.ctx, "   ", None, None, None).unwrap_err();
    assert!(matches!(err, VoiceError::Tts(TtsError::EmptyText)));
    assert!(h.engine.spoken.lock().unwrap().is_empty());
}

#[test]
fn voices_come_from_active_engine() {
    let h = harness(|_| {}, true);
    let voices = tools::voices(&h.ctx);
    assert_eq!(voices.len(), 1);
    assert_eq!(voices[0].id, "en-us");
}

#[test]
fn listen_return_mode_leaves_screen_alone() {
    let h = harness(|_| {}, true);
    let reply = tools::listen(&h.ctx, Some(Duration::from_secs(5)), Some("en"), OutputMode::Return);

    assert_eq!(reply.status, TranscriptionStatus::Success);
    assert_eq!(reply.transcription, "Hello world.");
    assert_eq!(reply.language, "en");
    assert!(h.keyboard.screen().is_empty());

    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["output_mode"], "return");
    assert!(json.get("warning").is_none());
}

#[test]
fn listen_clipboard_mode_copies_transcript() {
    let h = harness(|_| {}, true);
    let reply = tools::listen(&h.ctx, None, None, OutputMode::Clipboard);
    assert_eq!(reply.status, TranscriptionStatus::Success);
    assert_eq!(*h.clipboard.content.lock().unwrap(), "Hello world.");
}

#[test]
fn listen_output_failure_is_partial_success() {
    let h = harness(|_| {}, false);
    let reply = tools::listen(&h.ctx, None, None, OutputMode::Clipboard);
    assert_eq!(reply.status, TranscriptionStatus::PartialSuccess);
    assert_eq!(reply.transcription, "Hello world.");
    assert_eq!(
        reply.warning.as_deref(),
        Some("Transcription succeeded but output failed: Clipboard functionality not available")
    );
}

#[test]
fn listen_with_stt_disabled_fails() {
    let h = harness(|c| c.stt.enabled = false, true);
    let reply = tools::listen(&h.ctx, None, None, OutputMode::Typing);
    assert_eq!(reply.status, TranscriptionStatus::Error);
    assert!(reply.error.is_some());
    assert!(h.keyboard.screen().is_empty());
}

#[test]
fn stt_server_status_reports_cache() {
    let h = harness(|_| {}, true);
    let status = tools::stt_server_status(&h.ctx);
    assert!(status.server_mode);
    assert!(status.cache.is_some());

    let h = harness(|c| c.stt.server_mode = false, true);
    let status = tools::stt_server_status(&h.ctx);
    assert!(!status.server_mode);
    assert!(status.cache.is_none());
}

// ============================================================================
// Background loading and hotkey dictation
// ============================================================================

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn background_loading_readies_every_component() {
    let h = harness(|_| {}, true);
    assert!(h.ctx.start_background_loading());
    assert!(!h.ctx.start_background_loading());

    for component in ComponentType::ALL {
        assert!(
            h.ctx.loading().wait_for_ready(component, Duration::from_secs(5)),
            "{} did not load: {:?}",
            component,
            h.ctx.loading().get_error(component)
        );
    }

    let status = tools::loading_status(&h.ctx);
    assert!(status.started);
    assert!(status.components.iter().all(|c| c.status == ComponentStatus::Ready));
    assert_eq!(h.keys.subscriber_count(), 1);
    assert!(h.ctx.model_cache().unwrap().is_running());

    h.ctx.shutdown();
    assert_eq!(h.keys.subscriber_count(), 0);
    assert!(!h.ctx.loading().is_started());
}

#[test]
fn daemon_startup_loads_stt_model_once() {
    let h = harness(
        |c| {
            let model = c.stt.model.clone();
            c.stt.preload_models = vec![model];
        },
        true,
    );
    let model = h.ctx.config().stt.model.clone();

    // Same order as the daemon: open the cache, preload on another
    // thread, then start background loading without waiting
    assert!(h.ctx.launch_model_server());
    let preload = {
        let ctx = Arc::clone(&h.ctx);
        thread::spawn(move || ctx.preload_models())
    };
    assert!(h.ctx.start_background_loading());

    let report = preload.join().unwrap().unwrap();
    assert_eq!(report.preloaded, vec![model.clone()]);
    assert!(h.ctx.loading().wait_for_ready(ComponentType::Stt, Duration::from_secs(5)));
    assert_eq!(h.recognizers.creates_of(&model), 1);

    let reply = tools::listen(&h.ctx, None, None, OutputMode::Return);
    assert_eq!(reply.status, TranscriptionStatus::Success);
    assert_eq!(h.recognizers.creates_of(&model), 1);
    assert_eq!(h.ctx.model_cache().unwrap().loaded_model_names(), vec![model]);
    h.ctx.shutdown();
}

#[test]
fn disabled_components_are_not_loaded() {
    let h = harness(
        |c| {
            c.hotkey.enabled = false;
            c.tts.preload = false;
        },
        true,
    );
    assert!(h.ctx.start_background_loading());
    assert!(h.ctx.loading().wait_for_ready(ComponentType::Stt, Duration::from_secs(5)));
    assert_eq!(h.ctx.loading().get_status(ComponentType::Hotkey), ComponentStatus::NotStarted);
    assert_eq!(h.ctx.loading().get_status(ComponentType::Tts), ComponentStatus::NotStarted);

    let reply = tools::start_hotkey_monitoring(&h.ctx).unwrap();
    assert_eq!(reply, "Hotkey monitoring is disabled in configuration");
    h.ctx.shutdown();
}

#[test]
fn hotkey_press_types_dictation_live() {
    let h = harness(|_| {}, false);
    assert_eq!(tools::start_hotkey_monitoring(&h.ctx).unwrap(), "Hotkey monitoring started (f9)");

    let status = tools::hotkey_status(&h.ctx);
    assert!(status.status.monitoring);
    assert_eq!(status.configuration.output_mode, OutputMode::Typing);

    h.keys.tap(&Hotkey::parse("f9").unwrap());
    assert!(wait_until(Duration::from_secs(5), || h.keyboard.screen() == "Hello world."));
    assert!(wait_until(Duration::from_secs(5), || !h.ctx.delivery().is_session_active()));
    assert!(wait_until(Duration::from_secs(5), || !h.ctx.hotkey_manager().status().processing));
    // The claim outlives the dictation until its self-release timer
    assert!(h.ctx.hotkey_manager().status().lock_held);

    assert_eq!(tools::stop_hotkey_monitoring(&h.ctx), "Hotkey monitoring stopped");
    assert_eq!(tools::stop_hotkey_monitoring(&h.ctx), "Hotkey monitoring was not active");
    h.ctx.shutdown();
}

#[test]
fn hotkey_press_in_clipboard_mode_copies() {
    let h = harness(|c| c.hotkey.output_mode = OutputMode::Clipboard, true);
    tools::start_hotkey_monitoring(&h.ctx).unwrap();

    h.keys.tap(&Hotkey::parse("f9").unwrap());
    assert!(wait_until(Duration::from_secs(5), || {
        *h.clipboard.content.lock().unwrap() == "Hello world."
    }));
    assert!(h.keyboard.screen().is_empty());
    h.ctx.shutdown();
}
