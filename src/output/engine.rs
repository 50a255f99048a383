//! Incremental text delivery
//!
//! Reconciles each new transcript hypothesis against what was already
//! typed and replays only the difference. Multi-character insertions go
//! through the clipboard and a paste shortcut when a clipboard is
//! available, which is far faster than per-key typing and avoids keyboard
//! layout issues.
//!
//! A session brackets one dictation: the clipboard is snapshotted at the
//! start and put back at the end if delivery overwrote it.

use super::{get_text_diff, ClipboardBackend, KeyboardBackend, TextDiff};
use crate::config::{OutputConfig, OutputMode};
use crate::error::OutputError;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Wait after the paste shortcut so the target application reads the
/// clipboard before it is overwritten again
const POST_PASTE_DELAY: Duration = Duration::from_millis(50);

/// Outcome of one `output_text` call
#[derive(Debug, Clone, Serialize)]
pub struct OutputResult {
    pub success: bool,
    pub mode: OutputMode,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Edit replayed in typing mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<TextDiff>,
}

impl OutputResult {
    fn ok(mode: OutputMode, text: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            mode,
            text: text.to_string(),
            message: Some(message.into()),
            error: None,
            operation: None,
        }
    }

    fn failed(mode: OutputMode, text: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            mode,
            text: text.to_string(),
            message: None,
            error: Some(error.into()),
            operation: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStartResult {
    pub success: bool,
    pub clipboard_backed_up: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionEndResult {
    pub success: bool,
    pub clipboard_restored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct DeliveryState {
    last_emitted_text: String,
    last_update: Option<Instant>,
    session_active: bool,
    original_clipboard: Option<String>,
    clipboard_modified: bool,
}

impl DeliveryState {
    fn reset_typing(&mut self) {
        self.last_emitted_text.clear();
        self.last_update = None;
    }
}

pub struct TextDeliveryEngine {
    config: OutputConfig,
    keyboard: Option<Arc<dyn KeyboardBackend>>,
    clipboard: Option<Arc<dyn ClipboardBackend>>,
    state: Mutex<DeliveryState>,
}

impl TextDeliveryEngine {
    /// Create an engine with explicit backends. Backends disabled in the
    /// config are dropped.
    pub fn new(
        config: OutputConfig,
        keyboard: Option<Arc<dyn KeyboardBackend>>,
        clipboard: Option<Arc<dyn ClipboardBackend>>,
    ) -> Self {
        let keyboard = keyboard.filter(|_| config.typing_enabled);
        let clipboard = clipboard.filter(|_| config.clipboard_enabled);
        tracing::debug!(
            "Text delivery: keyboard={}, clipboard={}",
            keyboard.as_ref().map_or("none", |k| k.name()),
            clipboard.as_ref().map_or("none", |c| c.name()),
        );
        Self {
            config,
            keyboard,
            clipboard,
            state: Mutex::new(DeliveryState::default()),
        }
    }

    /// Create an engine using the tools found on this system
    pub fn detect(config: OutputConfig) -> Self {
        let keyboard = if config.typing_enabled {
            super::detect_keyboard(config.type_delay_ms)
        } else {
            None
        };
        let clipboard = if config.clipboard_enabled {
            super::detect_clipboard()
        } else {
            None
        };
        Self::new(config, keyboard, clipboard)
    }

    fn state(&self) -> MutexGuard<'_, DeliveryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn is_typing_available(&self) -> bool {
        self.keyboard.is_some()
    }

    pub fn is_clipboard_available(&self) -> bool {
        self.clipboard.is_some()
    }

    pub fn is_session_active(&self) -> bool {
        self.state().session_active
    }

    pub fn last_emitted_text(&self) -> String {
        self.state().last_emitted_text.clone()
    }

    /// Deliver `text` in the given mode
    ///
    /// Typing mode skips text identical to what is on screen and updates
    /// arriving within the debounce delay, unless `force_update` is set.
    pub fn output_text(&self, text: &str, mode: OutputMode, force_update: bool) -> OutputResult {
        let text = text.trim();
        if text.is_empty() {
            return OutputResult::ok(mode, text, "No text to output");
        }

        match mode {
            OutputMode::Typing => self.type_update(text, force_update),
            OutputMode::Clipboard => self.copy_to_clipboard(text),
            OutputMode::Return => OutputResult::ok(mode, text, "Text returned successfully"),
        }
    }

    fn type_update(&self, text: &str, force_update: bool) -> OutputResult {
        let mode = OutputMode::Typing;
        let Some(keyboard) = self.keyboard.as_deref() else {
            return OutputResult::failed(mode, text, "Typing functionality not available");
        };

        let mut state = self.state();
        if !force_update {
            if state.last_emitted_text == text {
                return OutputResult::ok(mode, text, "Text unchanged, skipping output");
            }
            let debounce = self.config.debounce_delay();
            if let Some(last) = state.last_update {
                if last.elapsed() < debounce {
                    return OutputResult::ok(mode, text, "Debounced, skipping output");
                }
            }
            // Forced updates leave the debounce clock alone
            state.last_update = Some(Instant::now());
        }

        let diff = get_text_diff(&state.last_emitted_text, text);
        tracing::debug!("{}", diff.describe());

        match self.replay(&mut state, keyboard, &diff) {
            Ok(()) => {
                state.last_emitted_text = text.to_string();
                OutputResult {
                    operation: Some(diff.clone()),
                    ..OutputResult::ok(mode, text, diff.describe())
                }
            }
            Err(e) => {
                tracing::warn!("Typing failed: {}", e);
                OutputResult {
                    operation: Some(diff),
                    ..OutputResult::failed(mode, text, e.to_string())
                }
            }
        }
    }

    fn replay(
        &self,
        state: &mut DeliveryState,
        keyboard: &dyn KeyboardBackend,
        diff: &TextDiff,
    ) -> Result<(), OutputError> {
        let deletes = diff.chars_to_delete();
        if deletes > 0 {
            keyboard.backspace(deletes)?;
        }

        let insert = diff.text_to_insert();
        if insert.is_empty() {
            return Ok(());
        }
        match self.clipboard.as_deref() {
            Some(clipboard) if insert.chars().count() > 1 => {
                self.paste(state, keyboard, clipboard, insert)
            }
            _ => keyboard.type_text(insert),
        }
    }

    /// Insert text with the paste shortcut. Inside a session the
    /// clipboard is restored by `end_session`, otherwise right away.
    fn paste(
        &self,
        state: &mut DeliveryState,
        keyboard: &dyn KeyboardBackend,
        clipboard: &dyn ClipboardBackend,
        text: &str,
    ) -> Result<(), OutputError> {
        let previous = if state.session_active {
            None
        } else {
            clipboard.read().ok()
        };

        if let Err(e) = clipboard.write(text) {
            tracing::debug!("Clipboard write failed ({}), typing instead", e);
            return keyboard.type_text(text);
        }
        if state.session_active {
            state.clipboard_modified = true;
        }

        std::thread::sleep(Duration::from_millis(self.config.paste_settle_ms));
        let pasted = keyboard.paste_shortcut();
        std::thread::sleep(POST_PASTE_DELAY);

        if let Some(previous) = previous {
            if let Err(e) = clipboard.write(&previous) {
                tracing::warn!("Failed to restore clipboard after paste: {}", e);
            }
        }
        pasted
    }

    fn copy_to_clipboard(&self, text: &str) -> OutputResult {
        let mode = OutputMode::Clipboard;
        let Some(clipboard) = self.clipboard.as_deref() else {
            return OutputResult::failed(mode, text, "Clipboard functionality not available");
        };

        match clipboard.write(text) {
            Ok(()) => OutputResult::ok(
                mode,
                text,
                format!("Text copied to clipboard ({} characters)", text.chars().count()),
            ),
            Err(e) => OutputResult::failed(mode, text, e.to_string()),
        }
    }

    /// Begin a dictation session, ending any session still active
    pub fn start_session(&self) -> SessionStartResult {
        let mut state = self.state();
        if state.session_active {
            tracing::debug!("Session already active, ending it first");
            self.finish_session(&mut state);
        }

        let snapshot = self.clipboard.as_deref().and_then(|c| match c.read() {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!("Could not back up clipboard: {}", e);
                None
            }
        });
        let clipboard_backed_up = snapshot.is_some();

        *state = DeliveryState {
            session_active: true,
            original_clipboard: snapshot,
            ..DeliveryState::default()
        };
        tracing::debug!("Text delivery session started (clipboard backed up: {})", clipboard_backed_up);

        SessionStartResult {
            success: true,
            clipboard_backed_up,
        }
    }

    /// End the session, restoring the clipboard if delivery changed it
    pub fn end_session(&self) -> SessionEndResult {
        let mut state = self.state();
        if !state.session_active {
            return SessionEndResult {
                success: true,
                clipboard_restored: false,
                message: Some("No active session".to_string()),
                error: None,
            };
        }
        self.finish_session(&mut state)
    }

    /// Wait out the configured grace period, then end the session
    ///
    /// Keystrokes and pastes sent just before may still be in flight in the
    /// compositor; restoring the clipboard under them would paste the old
    /// content.
    pub fn end_session_delayed(&self) -> SessionEndResult {
        std::thread::sleep(self.config.session_end_delay());
        self.end_session()
    }

    fn finish_session(&self, state: &mut DeliveryState) -> SessionEndResult {
        let mut result = SessionEndResult {
            success: true,
            clipboard_restored: false,
            message: Some("Session ended".to_string()),
            error: None,
        };

        if state.clipboard_modified && self.config.restore_clipboard {
            if let (Some(clipboard), Some(original)) =
                (self.clipboard.as_deref(), state.original_clipboard.as_deref())
            {
                match clipboard.write(original) {
                    Ok(()) => result.clipboard_restored = true,
                    Err(e) => {
                        tracing::warn!("Failed to restore clipboard: {}", e);
                        result.error = Some(e.to_string());
                    }
                }
            }
        }

        *state = DeliveryState::default();
        result
    }

    /// Forget what was typed so the next update starts fresh
    pub fn reset(&self) {
        self.state().reset_typing();
    }
}
