//! Text-to-speech
//!
//! Speech is synthesized by local command-line engines:
//! - espeak-ng - widely packaged on Linux
//! - spd-say - speech-dispatcher client, uses whatever synth the desktop has
//! - say - built into macOS
//!
//! [`TtsManager`] keeps these in fallback order, configured engine first,
//! and speaks through the first one installed.

use crate::config::TtsConfig;
use crate::error::TtsError;
use serde::Serialize;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A voice offered by an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
}

/// Parameters for one utterance
#[derive(Debug, Clone)]
pub struct SpeakOptions {
    pub voice: Option<String>,
    /// Words per minute
    pub rate: u32,
    /// 0.0 to 1.0
    pub volume: f32,
}

impl SpeakOptions {
    pub fn from_config(config: &TtsConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            rate: config.rate,
            volume: config.volume,
        }
    }
}

/// A speech synthesizer
pub trait TtsEngine: Send + Sync {
    /// Speak `text`, blocking until playback ends or `stop` is called
    fn speak(&self, text: &str, options: &SpeakOptions) -> Result<(), TtsError>;

    fn voices(&self) -> Vec<Voice>;

    fn is_available(&self) -> bool;

    /// Interrupt speech in progress
    fn stop(&self);

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    EspeakNg,
    SpdSay,
    Say,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [EngineKind::EspeakNg, EngineKind::SpdSay, EngineKind::Say];

    pub fn binary(self) -> &'static str {
        match self {
            EngineKind::EspeakNg => "espeak-ng",
            EngineKind::SpdSay => "spd-say",
            EngineKind::Say => "say",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "espeak-ng" | "espeak" => Some(EngineKind::EspeakNg),
            "spd-say" | "speech-dispatcher" => Some(EngineKind::SpdSay),
            "say" => Some(EngineKind::Say),
            _ => None,
        }
    }

    fn speak_args(self, text: &str, options: &SpeakOptions) -> Vec<String> {
        let volume = options.volume.clamp(0.0, 1.0);
        let mut args = Vec::new();
        match self {
            EngineKind::EspeakNg => {
                args.extend(["-s".to_string(), options.rate.to_string()]);
                // Amplitude runs 0-200 with 100 as normal
                args.extend(["-a".to_string(), ((volume * 200.0).round() as u32).to_string()]);
                if let Some(voice) = &options.voice {
                    args.extend(["-v".to_string(), voice.clone()]);
                }
            }
            EngineKind::SpdSay => {
                // Rate and volume run -100..100; 180 wpm is treated as normal
                let rate = ((options.rate as f32 - 180.0) / 1.8).clamp(-100.0, 100.0).round() as i32;
                let volume = ((volume * 200.0) - 100.0).round() as i32;
                args.extend(["-w".to_string(), "-r".to_string(), rate.to_string()]);
                args.extend(["-i".to_string(), volume.to_string()]);
                if let Some(voice) = &options.voice {
                    args.extend(["-y".to_string(), voice.clone()]);
                }
            }
            EngineKind::Say => {
                args.extend(["-r".to_string(), options.rate.to_string()]);
                if let Some(voice) = &options.voice {
                    args.extend(["-v".to_string(), voice.clone()]);
                }
            }
        }
        args.push("--".to_string());
        args.push(text.to_string());
        args
    }

    fn voices_args(self) -> &'static [&'static str] {
        match self {
            EngineKind::EspeakNg => &["--voices"],
            EngineKind::SpdSay => &["-L"],
            EngineKind::Say => &["-v", "?"],
        }
    }

    fn parse_voices(self, listing: &str) -> Vec<Voice> {
        match self {
            // Pty Language Age/Gender VoiceName File Other
            EngineKind::EspeakNg => listing
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    if cols.len() < 4 {
                        return None;
                    }
                    let gender = cols[2].rsplit('/').next().map(|g| match g {
                        "M" => "male".to_string(),
                        "F" => "female".to_string(),
                        other => other.to_lowercase(),
                    });
                    Some(Voice {
                        id: cols[1].to_string(),
                        name: cols[3].to_string(),
                        language: Some(cols[1].to_string()),
                        gender,
                    })
                })
                .collect(),
            // NAME LANGUAGE VARIANT
            EngineKind::SpdSay => listing
                .lines()
                .skip(1)
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    let name = cols.first()?;
                    Some(Voice {
                        id: name.to_string(),
                        name: name.to_string(),
                        language: cols.get(1).map(|l| l.to_string()),
                        gender: None,
                    })
                })
                .collect(),
            // Alex                en_US    # Most people recognize me by my voice.
            EngineKind::Say => listing
                .lines()
                .filter_map(|line| {
                    let head = line.split('#').next()?.trim();
                    let (name, language) = head.rsplit_once(char::is_whitespace)?;
                    let name = name.trim();
                    if name.is_empty() {
                        return None;
                    }
                    Some(Voice {
                        id: name.to_string(),
                        name: name.to_string(),
                        language: Some(language.to_string()),
                        gender: None,
                    })
                })
                .collect(),
        }
    }
}

/// Engine driven through its command-line tool
pub struct CommandTtsEngine {
    kind: EngineKind,
    available: bool,
    current: Mutex<Option<Child>>,
}

impl CommandTtsEngine {
    pub fn new(kind: EngineKind) -> Self {
        let available = which::which(kind.binary()).is_ok();
        if available {
            tracing::debug!("Detected TTS engine {}", kind.binary());
        }
        Self {
            kind,
            available,
            current: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }
}

impl TtsEngine for CommandTtsEngine {
    fn speak(&self, text: &str, options: &SpeakOptions) -> Result<(), TtsError> {
        if !self.available {
            return Err(TtsError::NoEngine);
        }
        let program = self.kind.binary();
        let child = Command::new(program)
            .args(self.kind.speak_args(text, options))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TtsError::SpeakFailed(format!("{}: {}", program, e)))?;

        {
            let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(mut previous) = current.replace(child) {
                let _ = previous.kill();
                let _ = previous.wait();
            }
        }

        // Poll so that stop() can take the child and kill it
        loop {
            let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            let Some(child) = current.as_mut() else {
                tracing::debug!("Speech stopped");
                return Ok(());
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    *current = None;
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(TtsError::SpeakFailed(format!("{} exited with {}", program, status)))
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    *current = None;
                    return Err(TtsError::SpeakFailed(e.to_string()));
                }
            }
            drop(current);
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn voices(&self) -> Vec<Voice> {
        if !self.available {
            return Vec::new();
        }
        match Command::new(self.kind.binary())
            .args(self.kind.voices_args())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => {
                self.kind.parse_voices(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                tracing::debug!("{} voice listing failed: {}", self.kind.binary(), output.status);
                Vec::new()
            }
            Err(e) => {
                tracing::debug!("{} voice listing failed: {}", self.kind.binary(), e);
                Vec::new()
            }
        }
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn stop(&self) {
        let child = self.current.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn name(&self) -> &str {
        self.kind.binary()
    }
}

/// Summary for status tools
#[derive(Debug, Clone, Serialize)]
pub struct TtsInfo {
    pub available: bool,
    pub engine: Option<String>,
    pub engines: Vec<String>,
    pub voice: Option<String>,
    pub voice_count: usize,
}

/// Fallback-ordered registry of TTS engines
pub struct TtsManager {
    config: TtsConfig,
    engines: Vec<Arc<dyn TtsEngine>>,
}

impl TtsManager {
    /// Registry of the command engines, configured engine first
    pub fn new(config: TtsConfig) -> Self {
        let preferred = EngineKind::from_name(&config.engine);
        if preferred.is_none() {
            tracing::warn!("Unknown TTS engine '{}', using fallback order", config.engine);
        }
        let order = preferred
            .into_iter()
            .chain(EngineKind::ALL.into_iter().filter(|k| Some(*k) != preferred));
        let engines = order
            .map(|kind| Arc::new(CommandTtsEngine::new(kind)) as Arc<dyn TtsEngine>)
            .collect();
        Self::with_engines(config, engines)
    }

    pub fn with_engines(config: TtsConfig, engines: Vec<Arc<dyn TtsEngine>>) -> Self {
        Self { config, engines }
    }

    /// First installed engine
    pub fn active_engine(&self) -> Option<&Arc<dyn TtsEngine>> {
        self.engines.iter().find(|e| e.is_available())
    }

    pub fn is_available(&self) -> bool {
        self.active_engine().is_some()
    }

    /// Speak with per-call overrides falling back to the config
    pub fn speak(
        &self,
        text: &str,
        voice: Option<&str>,
        rate: Option<u32>,
        volume: Option<f32>,
    ) -> Result<String, TtsError> {
        let engine = self.active_engine().ok_or(TtsError::NoEngine)?;
        let options = SpeakOptions {
            voice: voice.map(String::from).or_else(|| self.config.voice.clone()),
            rate: rate.unwrap_or(self.config.rate),
            volume: volume.unwrap_or(self.config.volume).clamp(0.0, 1.0),
        };

        tracing::debug!("Speaking {} characters with {}", text.chars().count(), engine.name());
        engine.speak(text, &options)?;
        Ok(format!(
            "Spoke {} characters using {}",
            text.chars().count(),
            engine.name()
        ))
    }

    pub fn voices(&self) -> Vec<Voice> {
        self.active_engine().map(|e| e.voices()).unwrap_or_default()
    }

    pub fn stop(&self) {
        for engine in &self.engines {
            engine.stop();
        }
    }

    pub fn info(&self) -> TtsInfo {
        let active = self.active_engine();
        TtsInfo {
            available: active.is_some(),
            engine: active.map(|e| e.name().to_string()),
            engines: self
                .engines
                .iter()
                .filter(|e| e.is_available())
                .map(|e| e.name().to_string())
                .collect(),
            voice: self.config.voice.clone(),
            voice_count: active.map(|e| e.voices().len()).unwrap_or(0),
        }
    }
}
