//! Text output module
//!
//! Delivers transcribed text to the focused application by keyboard
//! simulation or the clipboard, and keeps live transcripts in sync with
//! what has already been typed.
//!
//! Keyboard backends, in order of preference:
//! 1. wtype - Wayland-native, no daemon needed
//! 2. ydotool - Works on X11/Wayland/TTY, requires daemon
//! 3. xdotool - X11 only
//!
//! Clipboard backends: wl-copy/wl-paste, xclip, pbcopy/pbpaste.

pub mod clipboard;
pub mod diff;
pub mod engine;
pub mod keyboard;

pub use diff::{get_text_diff, TextDiff};
pub use engine::{OutputResult, SessionEndResult, SessionStartResult, TextDeliveryEngine};

use crate::error::OutputError;
use std::sync::Arc;

/// Simulated keyboard input
pub trait KeyboardBackend: Send + Sync {
    /// Type text at the cursor
    fn type_text(&self, text: &str) -> Result<(), OutputError>;

    /// Press BackSpace `count` times
    fn backspace(&self, count: usize) -> Result<(), OutputError>;

    /// Press the platform paste shortcut
    fn paste_shortcut(&self) -> Result<(), OutputError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// System clipboard access
pub trait ClipboardBackend: Send + Sync {
    fn read(&self) -> Result<String, OutputError>;

    fn write(&self, text: &str) -> Result<(), OutputError>;

    fn name(&self) -> &'static str;
}

/// Display server the process is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    Wayland,
    X11,
    MacOs,
    Unknown,
}

impl DisplayServer {
    pub fn detect() -> Self {
        Self::from_env(|key| std::env::var_os(key).is_some())
    }

    fn from_env(has: impl Fn(&str) -> bool) -> Self {
        if cfg!(target_os = "macos") {
            DisplayServer::MacOs
        } else if has("WAYLAND_DISPLAY") {
            DisplayServer::Wayland
        } else if has("DISPLAY") {
            DisplayServer::X11
        } else {
            DisplayServer::Unknown
        }
    }
}

pub(crate) fn tool_in_path(tool: &str) -> bool {
    which::which(tool).is_ok()
}

/// Pick the best keyboard injection tool for this session
pub fn detect_keyboard(type_delay_ms: u32) -> Option<Arc<dyn KeyboardBackend>> {
    let display_server = DisplayServer::detect();
    let candidates: &[keyboard::KeyboardTool] = match display_server {
        DisplayServer::Wayland => &[
            keyboard::KeyboardTool::Wtype,
            keyboard::KeyboardTool::Ydotool,
        ],
        DisplayServer::X11 => &[
            keyboard::KeyboardTool::Xdotool,
            keyboard::KeyboardTool::Ydotool,
        ],
        DisplayServer::Unknown => &[keyboard::KeyboardTool::Ydotool],
        DisplayServer::MacOs => &[],
    };

    let found = candidates
        .iter()
        .copied()
        .find(|tool| tool_in_path(tool.binary()));
    match found {
        Some(tool) => {
            tracing::debug!("Using {} for keyboard output ({:?})", tool.binary(), display_server);
            Some(Arc::new(keyboard::CommandKeyboard::new(tool, type_delay_ms)))
        }
        None => {
            tracing::warn!("No keyboard injection tool found for {:?} session", display_server);
            None
        }
    }
}

/// Pick the clipboard tool for this session
pub fn detect_clipboard() -> Option<Arc<dyn ClipboardBackend>> {
    let display_server = DisplayServer::detect();
    let candidates: &[clipboard::ClipboardTool] = match display_server {
        DisplayServer::Wayland => &[
            clipboard::ClipboardTool::WlClipboard,
            clipboard::ClipboardTool::Xclip,
        ],
        DisplayServer::X11 => &[clipboard::ClipboardTool::Xclip],
        DisplayServer::MacOs => &[clipboard::ClipboardTool::Pbcopy],
        DisplayServer::Unknown => &[],
    };

    let found = candidates
        .iter()
        .copied()
        .find(|tool| tool.binaries().iter().all(|b| tool_in_path(b)));
    match found {
        Some(tool) => {
            tracing::debug!("Using {} for clipboard", tool.binaries()[0]);
            Some(Arc::new(clipboard::CommandClipboard::new(tool)))
        }
        None => {
            tracing::warn!("No clipboard tool found for {:?} session", display_server);
            None
        }
    }
}
