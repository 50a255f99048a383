//! Daemon module - process lifecycle
//!
//! Creates the process context, warms it up in the background, and keeps
//! it alive until SIGINT or SIGTERM.

use crate::config::Config;
use crate::context;
use crate::error::{Result, VoiceError};
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

pub struct Daemon {
    config: Config,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting voice-mcp daemon");

        #[cfg(unix)]
        let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
            VoiceError::Config(format!("Failed to set up SIGTERM handler: {}", e))
        })?;

        tracing::info!(
            "TTS engine: {}, STT model: {}, hotkey: {}",
            self.config.tts.engine,
            self.config.stt.model,
            if self.config.hotkey.enabled {
                self.config.hotkey.name.as_str()
            } else {
                "disabled"
            }
        );

        let ctx = context::create(self.config);

        // Open the cache before any loader can ask it for a model; the
        // preload itself blocks on model loads
        ctx.launch_model_server();
        let server = {
            let ctx = std::sync::Arc::clone(&ctx);
            tokio::task::spawn_blocking(move || ctx.preload_models())
        };

        if ctx.start_background_loading() {
            tracing::info!("Background loading started");
        }

        match server.await {
            Ok(Some(report)) => tracing::info!(
                "STT model server ready: {} preloaded, {} failed",
                report.preloaded.len(),
                report.failed.len()
            ),
            Ok(None) => tracing::debug!("STT server mode is off"),
            Err(e) => tracing::error!("STT model server startup panicked: {}", e),
        }

        #[cfg(unix)]
        tokio::select! {
            // Handle graceful shutdown (SIGINT from Ctrl+C)
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down...");
            }

            // Handle graceful shutdown (SIGTERM from systemctl stop)
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Received Ctrl+C, shutting down...");
        }

        drop(ctx);
        tokio::task::spawn_blocking(context::shutdown)
            .await
            .map_err(|e| VoiceError::Config(format!("Shutdown failed: {}", e)))?;

        tracing::info!("Daemon stopped");
        Ok(())
    }
}
