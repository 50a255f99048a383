//! Configuration loading and types for voice-mcp
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/voice-mcp/config.toml)
//! 3. Environment variables (VOICE_MCP_*)
//! 4. CLI arguments (highest priority)

use crate::error::VoiceError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# voice-mcp Configuration
#
# Location: ~/.config/voice-mcp/config.toml
# Every setting can also be overridden with a VOICE_MCP_* environment variable

# Log level when no -v/-q flag is given: error, warn, info, debug, trace
# log_level = "info"

[tts]
# Preferred engine: "espeak-ng", "spd-say" or "say". Other installed
# engines are used as fallbacks.
engine = "espeak-ng"

# Words per minute
rate = 200

# Volume level (0.0 to 1.0)
volume = 0.9

# Load the speech engine in the background at startup
# preload = true

[stt]
# Whisper model: tiny, base, small, medium, large-v3, large-v3-turbo
# (.en variants are English-only), or an absolute path to a ggml .bin file
model = "base"

# Language code, or "auto" for detection
language = "en"

# Seconds of trailing silence that end a dictation
silence_threshold_secs = 4.0

# Keep models loaded in a shared cache between requests
server_mode = true

# Models to load when the cache starts
preload_models = ["base"]

# Maximum number of models kept loaded at once
model_cache_size = 2

# Unload models idle for longer than this many seconds
model_timeout_secs = 300

[hotkey]
# Key or combination that starts a dictation: "menu", "f12", "ctrl+alt+s"
name = "menu"

# Where dictated text goes: "typing", "clipboard" or "return"
output_mode = "typing"

# Coordinate with other voice-mcp instances bound to the same hotkey
lock_enabled = true

[output]
typing_enabled = true
clipboard_enabled = true

# Minimum gap between interim typing updates
debounce_delay_ms = 100

# Put the user's clipboard back after a dictation
restore_clipboard = true

# [audio.feedback]
# Beep when dictation starts and stops
# enabled = true
#
# Sound theme: "default", "subtle", "mechanical", or path to custom theme directory
# theme = "default"
#
# Volume level (0.0 to 1.0)
# volume = 0.7
"#;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub tts: TtsConfig,

    #[serde(default)]
    pub stt: SttConfig,

    #[serde(default)]
    pub hotkey: HotkeyConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    /// Log level used when the CLI doesn't set one
    #[serde(default)]
    pub log_level: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TtsConfig {
    /// Preferred engine name
    #[serde(default = "default_tts_engine")]
    pub engine: String,

    /// Voice identifier passed to the engine
    #[serde(default)]
    pub voice: Option<String>,

    /// Speaking rate in words per minute
    #[serde(default = "default_tts_rate")]
    pub rate: u32,

    /// Volume level (0.0 to 1.0)
    #[serde(default = "default_tts_volume")]
    pub volume: f32,

    /// Initialize the engine in the background at startup
    #[serde(default = "default_true")]
    pub preload: bool,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SttConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model name or path to a ggml .bin file
    #[serde(default = "default_stt_model")]
    pub model: String,

    /// Language code (en, es, fr, auto, etc.)
    #[serde(default = "default_language")]
    pub language: String,

    /// Trailing silence that ends a recording
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold_secs: f32,

    /// Hard cap on a single recording
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u32,

    /// Audio input device name, or "default"
    #[serde(default = "default_device")]
    pub audio_device: String,

    /// Keep loaded models in the shared cache
    #[serde(default = "default_true")]
    pub server_mode: bool,

    /// Models loaded when the cache server starts
    #[serde(default = "default_preload_models")]
    pub preload_models: Vec<String>,

    /// Maximum number of loaded models
    #[serde(default = "default_cache_size")]
    pub model_cache_size: usize,

    /// Idle time after which a cached model is unloaded
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,

    /// Interval of the idle-model sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long a caller waits for another caller's in-flight load
    #[serde(default = "default_load_wait")]
    pub load_wait_timeout_secs: u64,

    /// Number of threads for inference (None = auto-detect)
    #[serde(default)]
    pub threads: Option<usize>,
}

/// Global hotkey configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotkeyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Key or `+`-joined combination, e.g. "menu", "ctrl+alt+s"
    #[serde(default = "default_hotkey_name")]
    pub name: String,

    /// Where text dictated through the hotkey goes
    #[serde(default)]
    pub output_mode: OutputMode,

    /// Use the cross-process exclusivity lock
    #[serde(default = "default_true")]
    pub lock_enabled: bool,

    /// Override for the lock directory
    #[serde(default)]
    pub lock_directory: Option<PathBuf>,

    /// Fall back to an in-process semaphore when file locking fails.
    /// This only guards against double-processing inside one process.
    #[serde(default = "default_true")]
    pub lock_fallback_semaphore: bool,
}

/// Text output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub typing_enabled: bool,

    #[serde(default = "default_true")]
    pub clipboard_enabled: bool,

    /// Interim typing updates closer together than this are dropped
    #[serde(default = "default_debounce_ms")]
    pub debounce_delay_ms: u64,

    /// Restore the pre-session clipboard when a session ends
    #[serde(default = "default_true")]
    pub restore_clipboard: bool,

    /// Grace period before a delayed session end touches the clipboard
    #[serde(default = "default_session_end_delay_ms")]
    pub session_end_delay_ms: u64,

    /// Pause between writing the clipboard and pressing Ctrl+V
    #[serde(default = "default_paste_settle_ms")]
    pub paste_settle_ms: u64,

    /// Delay between typed characters (ms), 0 for fastest
    #[serde(default)]
    pub type_delay_ms: u32,
}

/// Audio configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub feedback: AudioFeedbackConfig,
}

/// Audio feedback configuration for sound cues
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioFeedbackConfig {
    /// Enable audio feedback sounds
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sound theme: "default", "subtle", "mechanical", or path to custom theme directory
    #[serde(default = "default_sound_theme")]
    pub theme: String,

    /// Volume level (0.0 to 1.0)
    #[serde(default = "default_volume")]
    pub volume: f32,
}

/// Output mode selection
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Replay the text as keystrokes at the cursor
    #[default]
    Typing,
    /// Put the final text on the clipboard
    Clipboard,
    /// No side effect, the caller gets the text back
    Return,
}

impl FromStr for OutputMode {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "typing" | "type" => Ok(OutputMode::Typing),
            "clipboard" => Ok(OutputMode::Clipboard),
            "return" => Ok(OutputMode::Return),
            other => Err(VoiceError::Config(format!(
                "Unknown output mode '{}' (expected typing, clipboard or return)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Typing => write!(f, "typing"),
            OutputMode::Clipboard => write!(f, "clipboard"),
            OutputMode::Return => write!(f, "return"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tts_engine() -> String {
    "espeak-ng".to_string()
}

fn default_tts_rate() -> u32 {
    200
}

fn default_tts_volume() -> f32 {
    0.9
}

fn default_stt_model() -> String {
    "base".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_silence_threshold() -> f32 {
    4.0
}

fn default_max_duration() -> u32 {
    120
}

fn default_device() -> String {
    "default".to_string()
}

fn default_preload_models() -> Vec<String> {
    vec!["base".to_string()]
}

fn default_cache_size() -> usize {
    2
}

fn default_model_timeout() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_load_wait() -> u64 {
    300
}

fn default_hotkey_name() -> String {
    "menu".to_string()
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_session_end_delay_ms() -> u64 {
    150
}

fn default_paste_settle_ms() -> u64 {
    20
}

fn default_sound_theme() -> String {
    "default".to_string()
}

fn default_volume() -> f32 {
    0.7
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: default_tts_engine(),
            voice: None,
            rate: default_tts_rate(),
            volume: default_tts_volume(),
            preload: true,
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_stt_model(),
            language: default_language(),
            silence_threshold_secs: default_silence_threshold(),
            max_duration_secs: default_max_duration(),
            audio_device: default_device(),
            server_mode: true,
            preload_models: default_preload_models(),
            model_cache_size: default_cache_size(),
            model_timeout_secs: default_model_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            load_wait_timeout_secs: default_load_wait(),
            threads: None,
        }
    }
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_hotkey_name(),
            output_mode: OutputMode::Typing,
            lock_enabled: true,
            lock_directory: None,
            lock_fallback_semaphore: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            typing_enabled: true,
            clipboard_enabled: true,
            debounce_delay_ms: default_debounce_ms(),
            restore_clipboard: true,
            session_end_delay_ms: default_session_end_delay_ms(),
            paste_settle_ms: default_paste_settle_ms(),
            type_delay_ms: 0,
        }
    }
}

impl Default for AudioFeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            theme: default_sound_theme(),
            volume: default_volume(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tts: TtsConfig::default(),
            stt: SttConfig::default(),
            hotkey: HotkeyConfig::default(),
            output: OutputConfig::default(),
            audio: AudioConfig::default(),
            log_level: None,
        }
    }
}

/// Longest trailing silence a dictation may wait for
pub const MAX_SILENCE_THRESHOLD_SECS: f32 = 300.0;

impl SttConfig {
    /// Trailing silence that ends a dictation. Out-of-range values are
    /// clamped; NaN falls back to the default.
    pub fn silence_threshold(&self) -> Duration {
        let secs = self.silence_threshold_secs.clamp(0.0, MAX_SILENCE_THRESHOLD_SECS);
        Duration::try_from_secs_f32(secs)
            .unwrap_or_else(|_| Duration::from_secs_f32(default_silence_threshold()))
    }
}

impl OutputConfig {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn session_end_delay(&self) -> Duration {
        Duration::from_millis(self.session_end_delay_ms)
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "voice-mcp")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the runtime directory for ephemeral files (locks)
    pub fn runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir())
    }

    /// Directory holding per-hotkey lock files
    pub fn lock_dir(&self) -> PathBuf {
        self.hotkey
            .lock_directory
            .clone()
            .unwrap_or_else(|| Self::runtime_dir().join("voice-mcp-locks"))
    }

    /// Get the data directory path (for models)
    pub fn data_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "voice-mcp")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Get the models directory path
    pub fn models_dir() -> PathBuf {
        Self::data_dir().join("models")
    }

    /// Reject settings the coordinators cannot work with
    pub fn validate(&self) -> Result<(), VoiceError> {
        if self.stt.model_cache_size == 0 {
            return Err(VoiceError::Config(
                "stt.model_cache_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=MAX_SILENCE_THRESHOLD_SECS).contains(&self.stt.silence_threshold_secs) {
            return Err(VoiceError::Config(format!(
                "stt.silence_threshold_secs must be between 0 and {}, got {}",
                MAX_SILENCE_THRESHOLD_SECS, self.stt.silence_threshold_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.tts.volume) {
            return Err(VoiceError::Config(format!(
                "tts.volume must be between 0.0 and 1.0, got {}",
                self.tts.volume
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.feedback.volume) {
            return Err(VoiceError::Config(format!(
                "audio.feedback.volume must be between 0.0 and 1.0, got {}",
                self.audio.feedback.volume
            )));
        }
        if self.hotkey.enabled && self.hotkey.name.trim().is_empty() {
            return Err(VoiceError::Config(
                "hotkey.name must not be empty while the hotkey is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply VOICE_MCP_* overrides, reading variables through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), VoiceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(engine) = lookup("VOICE_MCP_TTS_ENGINE") {
            self.tts.engine = engine;
        }
        if let Some(voice) = lookup("VOICE_MCP_TTS_VOICE") {
            self.tts.voice = Some(voice);
        }
        if let Some(rate) = parse_var(&lookup, "VOICE_MCP_TTS_RATE")? {
            self.tts.rate = rate;
        }
        if let Some(volume) = parse_var(&lookup, "VOICE_MCP_TTS_VOLUME")? {
            self.tts.volume = volume;
        }
        if let Some(model) = lookup("VOICE_MCP_STT_MODEL") {
            self.stt.model = model;
        }
        if let Some(language) = lookup("VOICE_MCP_STT_LANGUAGE") {
            self.stt.language = language;
        }
        if let Some(threshold) = parse_var(&lookup, "VOICE_MCP_STT_SILENCE_THRESHOLD")? {
            self.stt.silence_threshold_secs = threshold;
        }
        if let Some(server_mode) = parse_bool_var(&lookup, "VOICE_MCP_STT_SERVER_MODE")? {
            self.stt.server_mode = server_mode;
        }
        if let Some(models) = lookup("VOICE_MCP_STT_PRELOAD_MODELS") {
            self.stt.preload_models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(size) = parse_var(&lookup, "VOICE_MCP_STT_MODEL_CACHE_SIZE")? {
            self.stt.model_cache_size = size;
        }
        if let Some(timeout) = parse_var(&lookup, "VOICE_MCP_STT_MODEL_TIMEOUT")? {
            self.stt.model_timeout_secs = timeout;
        }
        if let Some(enabled) = parse_bool_var(&lookup, "VOICE_MCP_ENABLE_HOTKEY")? {
            self.hotkey.enabled = enabled;
        }
        if let Some(name) = lookup("VOICE_MCP_HOTKEY_NAME") {
            self.hotkey.name = name;
        }
        if let Some(mode) = lookup("VOICE_MCP_HOTKEY_OUTPUT_MODE") {
            self.hotkey.output_mode = mode.parse()?;
        }
        if let Some(enabled) = parse_bool_var(&lookup, "VOICE_MCP_TYPING_ENABLED")? {
            self.output.typing_enabled = enabled;
        }
        if let Some(enabled) = parse_bool_var(&lookup, "VOICE_MCP_CLIPBOARD_ENABLED")? {
            self.output.clipboard_enabled = enabled;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, "VOICE_MCP_TYPING_DEBOUNCE_DELAY")? {
            self.output.debounce_delay_ms = (secs.max(0.0) * 1000.0).round() as u64;
        }
        if let Some(level) = lookup("VOICE_MCP_LOG_LEVEL") {
            self.log_level = Some(level.to_lowercase());
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, VoiceError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| VoiceError::Config(format!("Invalid {}='{}': {}", name, raw, e))),
        None => Ok(None),
    }
}

fn parse_bool_var<F>(lookup: &F, name: &str) -> Result<Option<bool>, VoiceError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(VoiceError::Config(format!(
                "Invalid {}='{}': expected true or false",
                name, raw
            ))),
        },
        None => Ok(None),
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, VoiceError> {
    // Start with defaults
    let mut config = Config::default();

    // Determine config file path
    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    // Load from file if it exists
    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| VoiceError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| VoiceError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    // Override from environment variables
    config.apply_env_overrides(|name| std::env::var(name).ok())?;

    config.validate()?;
    Ok(config)
}
