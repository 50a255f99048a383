// Command-line interface definitions for voice-mcp
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voice-mcp")]
#[command(author, version, about = "Voice tools for assistant tool servers")]
#[command(long_about = "
voice-mcp gives an assistant a voice: text-to-speech, speech-to-text, and
a global push-to-talk hotkey that types what you say into the focused window.

Several instances can run side by side. Only one of them answers a hotkey
press; the others see the shared lock and stand down.

SETUP:
  1. Install a speech engine: espeak-ng or speech-dispatcher (Linux), say (macOS)
  2. Install wtype (Wayland) or xdotool/ydotool (X11) for typing support
  3. Install wl-clipboard or xclip for clipboard support
  4. Place a whisper model (ggml-base.en.bin) in the models directory
  5. Run: voice-mcp (to start the daemon)

USAGE:
  Press the hotkey (Menu by default) and speak; dictation stops after silence.
  Text is typed at the cursor as you speak.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Deliver hotkey dictation through the clipboard instead of typing
    #[arg(long)]
    pub clipboard: bool,

    /// Override whisper model (tiny, base, small, medium, large-v3, large-v3-turbo)
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Override hotkey (e.g., menu, f12, ctrl+shift+space)
    #[arg(long, value_name = "KEY")]
    pub hotkey: Option<String>,

    /// Don't monitor the global hotkey
    #[arg(long, conflicts_with = "hotkey")]
    pub no_hotkey: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Speak text aloud
    Speak {
        /// Text to speak
        text: String,

        /// Voice to use (see `voice-mcp voices`)
        #[arg(long, value_name = "VOICE")]
        voice: Option<String>,

        /// Speech rate in words per minute
        #[arg(long, value_name = "WPM")]
        rate: Option<u32>,

        /// Volume from 0.0 to 1.0
        #[arg(long, value_name = "LEVEL")]
        volume: Option<f32>,
    },

    /// Record one utterance and transcribe it
    Listen {
        /// Stop recording after this many seconds
        #[arg(long, value_name = "SECS")]
        duration: Option<f64>,

        /// Language code (e.g., en, de, auto)
        #[arg(long, value_name = "LANG")]
        language: Option<String>,

        /// Where the transcript goes: typing, clipboard, or return
        #[arg(long, value_name = "MODE", default_value = "return")]
        #[arg(value_parser = ["typing", "clipboard", "return"])]
        output_mode: String,
    },

    /// List the voices of the active speech engine
    Voices,

    /// Show component, hotkey, and model cache status as JSON
    Status,

    /// Show current configuration
    Config,
}
