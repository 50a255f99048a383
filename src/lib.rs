//! voice-mcp: voice tools for assistant tool servers
//!
//! This library provides the core functionality for:
//! - Speaking text through the system speech engines (espeak-ng, spd-say, say)
//! - Capturing audio via cpal and transcribing it with whisper.cpp
//! - Keeping transcription models warm in a shared LRU cache
//! - Monitoring a global hotkey via rdev, with a cross-process lock so only
//!   one running instance answers each press
//! - Typing dictation incrementally as it is recognized, correcting earlier
//!   text with backspaces instead of retyping it
//!
//! # Architecture
//!
//! ```text
//!                            ┌─────────────────────────────────────┐
//!                            │       VoiceContext (context.rs)     │
//!                            └─────────────────────────────────────┘
//!                                            │
//!            ┌───────────────┬───────────────┼───────────────┬───────────────┐
//!            │               │               │               │               │
//!            ▼               ▼               ▼               ▼               ▼
//!     ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐
//!     │  Loading   │  │    TTS     │  │   Hotkey   │  │ Transcribe │  │   Model    │
//!     │coordinator │  │  manager   │  │  manager   │  │  handler   │  │   cache    │
//!     └────────────┘  └────────────┘  └────────────┘  └────────────┘  └────────────┘
//!                                            │               │               │
//!                                  press     │               │ recognizer    │
//!                                  + lock    ▼               ▼◀──────────────┘
//!                                     ┌─────────────┐ ┌──────────────┐
//!                                     │ Hotkey lock │ │   Whisper    │
//!                                     │flock / sem. │ │ (whisper-rs) │
//!                                     └─────────────┘ └──────────────┘
//!                                                            │
//!                                                            ▼ interim / final text
//!                                                     ┌──────────────┐
//!                                                     │ Text delivery│ diff → backspace + type
//!                                                     │    engine    │ or paste
//!                                                     └──────────────┘
//!                                                            │
//!                                                            ▼
//!                                                     ┌──────────────┐
//!                                                     │wtype/xdotool/│
//!                                                     │ydotool/clip  │
//!                                                     └──────────────┘
//! ```

pub mod audio;
pub mod cli;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod hotkey;
pub mod loading;
pub mod lock;
pub mod model_manager;
pub mod output;
pub mod tools;
pub mod transcribe;
pub mod tts;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use context::VoiceContext;
pub use daemon::Daemon;
pub use error::{Result, VoiceError};
