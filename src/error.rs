//! Error types for voice-mcp
//!
//! Uses thiserror for ergonomic error definitions with clear messages
//! that guide users toward fixing common issues.

use thiserror::Error;

/// Top-level error type for the voice-mcp application
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Hotkey error: {0}")]
    Hotkey(#[from] HotkeyError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Transcription error: {0}")]
    Transcribe(#[from] TranscribeError),

    #[error("Model cache error: {0}")]
    Model(#[from] ModelError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Text-to-speech error: {0}")]
    Tts(#[from] TtsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while setting up a cross-process lock
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Cannot create lock directory {0}: {1}")]
    Directory(String, std::io::Error),

    #[error("Cannot open lock file {0}: {1}")]
    Open(String, std::io::Error),

    #[error("File locking is not supported on this platform")]
    Unsupported,
}

/// Errors related to hotkey parsing and monitoring
#[derive(Error, Debug)]
pub enum HotkeyError {
    #[error("Unknown key name: '{0}'. Examples: menu, f12, pause, ctrl+alt+s")]
    UnknownKey(String),

    #[error("Empty hotkey name")]
    Empty,

    #[error("Hotkey monitoring is already active for '{0}'")]
    AlreadyMonitoring(String),

    #[error("Keyboard listener failed: {0}")]
    Listener(String),
}

/// Errors related to audio capture and playback
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio connection failed: {0}")]
    Connection(String),

    #[error("Audio device not found: '{0}'")]
    DeviceNotFound(String),

    #[error("No audio was captured. Check your microphone.")]
    EmptyRecording,

    #[error("Audio stream error: {0}")]
    StreamError(String),
}

/// Errors related to speech-to-text transcription
#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("Model not found: {0}\n  Download a ggml model into the models directory.")]
    ModelNotFound(String),

    #[error("Whisper initialization failed: {0}")]
    InitFailed(String),

    #[error("Transcription failed: {0}")]
    InferenceFailed(String),

    #[error("Audio capture failed: {0}")]
    Audio(#[from] AudioError),

    #[error("Speech-to-text is not available: {0}")]
    Unavailable(String),
}

/// Errors returned by the model cache server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Model server is not running")]
    NotRunning,

    #[error("Timed out waiting for model '{0}' to load")]
    Timeout(String),

    #[error("Failed to load model '{0}': {1}")]
    LoadFailed(String, String),
}

/// Errors related to text output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("ydotool daemon not running.\n  Start with: systemctl --user start ydotool\n  Enable at boot: systemctl --user enable ydotool")]
    YdotoolNotRunning,

    #[error("No keyboard injection tool found. Install wtype, ydotool or xdotool.")]
    NoKeyboardBackend,

    #[error("No clipboard tool found. Install wl-clipboard, xclip or use pbcopy.")]
    NoClipboardBackend,

    #[error("{0} not found in PATH. Install via your package manager.")]
    ToolNotFound(String),

    #[error("Text injection failed: {0}")]
    InjectionFailed(String),

    #[error("Clipboard access failed: {0}")]
    ClipboardFailed(String),

    #[error("Ctrl+V simulation failed: {0}")]
    CtrlVFailed(String),
}

/// Errors related to speech synthesis
#[derive(Error, Debug)]
pub enum TtsError {
    #[error("No text-to-speech engine available. Install espeak-ng or speech-dispatcher.")]
    NoEngine,

    #[error("Speech synthesis failed: {0}")]
    SpeakFailed(String),

    #[error("No text provided to speak")]
    EmptyText,
}

/// Result type alias using VoiceError
pub type Result<T> = std::result::Result<T, VoiceError>;
