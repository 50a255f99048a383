//! voice-mcp - voice tools for assistant tool servers
//!
//! Run with `voice-mcp` or `voice-mcp daemon` to start the daemon.
//! `speak`, `listen`, `voices`, and `status` run one tool call and print
//! its reply as JSON.

use anyhow::Context as _;
use clap::Parser;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use voice_mcp::config::{self, Config, OutputMode};
use voice_mcp::{context, daemon, tools, Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so its log_level can apply
    let mut config = config::load_config(cli.config.as_deref())?;

    // Initialize logging
    let log_level = if cli.quiet {
        "error".to_string()
    } else {
        match cli.verbose {
            0 => config.log_level.clone().unwrap_or_else(|| "info".to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voice_mcp={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Apply CLI overrides
    if cli.clipboard {
        config.hotkey.output_mode = OutputMode::Clipboard;
    }
    if let Some(model) = cli.model {
        config.stt.model = model;
    }
    if let Some(hotkey) = cli.hotkey {
        config.hotkey.name = hotkey;
    }
    if cli.no_hotkey {
        config.hotkey.enabled = false;
    }

    // Run the appropriate command
    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            daemon::Daemon::new(config).run().await?;
        }

        Commands::Speak {
            text,
            voice,
            rate,
            volume,
        } => {
            let message = one_shot(config, move |ctx| {
                tools::speak(ctx, &text, voice.as_deref(), rate, volume)
            })
            .await??;
            println!("{}", message);
        }

        Commands::Listen {
            duration,
            language,
            output_mode,
        } => {
            let duration = duration
                .map(Duration::try_from_secs_f64)
                .transpose()
                .context("--duration must be a non-negative number of seconds")?;
            let mode: OutputMode = output_mode.parse()?;
            let reply = one_shot(config, move |ctx| {
                tools::listen(ctx, duration, language.as_deref(), mode)
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }

        Commands::Voices => {
            let voices = one_shot(config, tools::voices).await?;
            println!("{}", serde_json::to_string_pretty(&voices)?);
        }

        Commands::Status => {
            let status = one_shot(config, |ctx| {
                serde_json::json!({
                    "loading": tools::loading_status(ctx),
                    "hotkey": tools::hotkey_status(ctx),
                    "stt_server": tools::stt_server_status(ctx),
                })
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Config => {
            show_config(&config, cli.config.as_deref())?;
        }
    }

    Ok(())
}

/// Run one tool call on a fresh context, off the async runtime
async fn one_shot<T, F>(config: Config, call: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&context::VoiceContext) -> T + Send + 'static,
{
    let reply = tokio::task::spawn_blocking(move || {
        let ctx = context::create(config);
        let reply = call(&ctx);
        drop(ctx);
        context::shutdown();
        reply
    })
    .await?;
    Ok(reply)
}

/// Show current configuration
fn show_config(config: &Config, path: Option<&std::path::Path>) -> anyhow::Result<()> {
    println!("Current Configuration\n");
    println!("=====================\n");

    match path.map(std::path::PathBuf::from).or_else(Config::default_path) {
        Some(path) if path.exists() => println!("# Loaded from {}\n", path.display()),
        Some(path) => println!("# {} not found, using defaults\n", path.display()),
        None => println!("# No config directory, using defaults\n"),
    }

    println!("{}", toml::to_string_pretty(config)?);

    println!("# Lock directory: {}", config.lock_dir().display());
    println!("# Models directory: {}", Config::models_dir().display());
    Ok(())
}
