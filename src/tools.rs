//! Voice tools
//!
//! The operations exposed to clients, each a plain call on a
//! [`VoiceContext`]. Replies are serializable so the CLI can print them as
//! JSON.

use crate::audio::Cue;
use crate::config::OutputMode;
use crate::context::VoiceContext;
use crate::error::{TtsError, VoiceError};
use crate::hotkey::HotkeyStatus;
use crate::loading::ComponentSnapshot;
use crate::model_manager::ModelCacheStatus;
use crate::transcribe::handler::TranscriptionStatus;
use crate::transcribe::ListenOptions;
use crate::tts::Voice;
use serde::Serialize;
use std::time::Duration;

/// Convert text to speech with the configured engine
pub fn speak(
    ctx: &VoiceContext,
    text: &str,
    voice: Option<&str>,
    rate: Option<u32>,
    volume: Option<f32>,
) -> Result<String, VoiceError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TtsError::EmptyText.into());
    }
    tracing::info!("TTS request: {}", text.chars().take(50).collect::<String>());

    let message = ctx.tts().speak(text, voice, rate, volume)?;
    tracing::debug!("{}", message);
    Ok(message)
}

pub fn voices(ctx: &VoiceContext) -> Vec<Voice> {
    ctx.tts().voices()
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenReply {
    pub transcription: String,
    pub status: TranscriptionStatus,
    pub duration: f64,
    pub language: String,
    pub output_mode: OutputMode,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Record one utterance and deliver it in `mode`
///
/// A delivery failure still returns the transcript, with status
/// `partial_success`.
pub fn listen(
    ctx: &VoiceContext,
    duration: Option<Duration>,
    language: Option<&str>,
    mode: OutputMode,
) -> ListenReply {
    tracing::info!(
        "STT request: duration={:?}, language={:?}, output_mode={}",
        duration,
        language,
        mode
    );

    let handler = ctx.transcription();
    let options = ListenOptions {
        language: language.map(String::from),
        max_duration: duration,
    };

    ctx.feedback().play(Cue::ListenStart);
    let result = handler.transcribe_once(&options);
    ctx.feedback().play(if result.is_success() {
        Cue::ListenStop
    } else {
        Cue::Error
    });

    let mut reply = ListenReply {
        transcription: result.text,
        status: result.status,
        duration: result.duration_secs,
        language: result.language,
        output_mode: mode,
        model: result.model,
        warning: None,
        error: result.error,
    };

    if reply.status == TranscriptionStatus::Error {
        tracing::error!("Transcription failed: {}", reply.error.as_deref().unwrap_or("unknown error"));
        return reply;
    }

    if mode != OutputMode::Return && !reply.transcription.is_empty() {
        let delivery = ctx.delivery();
        // One-shot output is unrelated to anything typed before
        delivery.reset();
        let output = delivery.output_text(&reply.transcription, mode, true);
        if !output.success {
            let error = output.error.unwrap_or_default();
            tracing::warn!("Text output failed: {}", error);
            reply.status = TranscriptionStatus::PartialSuccess;
            reply.warning = Some(format!("Transcription succeeded but output failed: {}", error));
        }
    }

    tracing::info!(
        "STT request completed: {} characters in {:.1}s",
        reply.transcription.chars().count(),
        reply.duration
    );
    reply
}

pub fn start_hotkey_monitoring(ctx: &VoiceContext) -> Result<String, VoiceError> {
    let hotkey = &ctx.config().hotkey;
    if !hotkey.enabled {
        return Ok("Hotkey monitoring is disabled in configuration".to_string());
    }
    ctx.start_hotkey()?;
    Ok(format!("Hotkey monitoring started ({})", hotkey.name))
}

pub fn stop_hotkey_monitoring(ctx: &VoiceContext) -> String {
    if ctx.hotkey_manager().stop_monitoring() {
        "Hotkey monitoring stopped".to_string()
    } else {
        "Hotkey monitoring was not active".to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HotkeyConfiguration {
    pub enabled: bool,
    pub hotkey_name: String,
    pub output_mode: OutputMode,
    pub language: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotkeyStatusReply {
    #[serde(flatten)]
    pub status: HotkeyStatus,
    pub configuration: HotkeyConfiguration,
}

pub fn hotkey_status(ctx: &VoiceContext) -> HotkeyStatusReply {
    let config = ctx.config();
    HotkeyStatusReply {
        status: ctx.hotkey_manager().status(),
        configuration: HotkeyConfiguration {
            enabled: config.hotkey.enabled,
            hotkey_name: config.hotkey.name.clone(),
            output_mode: config.hotkey.output_mode,
            language: config.stt.language.clone(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadingStatusReply {
    pub started: bool,
    pub components: Vec<ComponentSnapshot>,
}

pub fn loading_status(ctx: &VoiceContext) -> LoadingStatusReply {
    LoadingStatusReply {
        started: ctx.loading().is_started(),
        components: ctx.loading().overall_status(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SttServerStatusReply {
    pub server_mode: bool,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<ModelCacheStatus>,
}

pub fn stt_server_status(ctx: &VoiceContext) -> SttServerStatusReply {
    SttServerStatusReply {
        server_mode: ctx.model_cache().is_some(),
        model: ctx.config().stt.model.clone(),
        cache: ctx.model_cache().map(|cache| cache.get_status()),
    }
}
