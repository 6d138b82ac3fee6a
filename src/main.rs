//! streamweb
//!
//! Command line entry point: parses arguments, loads configuration, sets up
//! logging and runs one command. SIGINT, SIGTERM and SIGHUP remove partial
//! downloads and stop transcoders before exiting with 130, 143 or 129.

use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamweb::cli::{Cli, Command};
use streamweb::commands::{manage, play, Context};
use streamweb::config::{AppConfig, LoggingConfig};
use streamweb::config_file::load_config;
use streamweb::error::Result;
use streamweb::history::History;
use streamweb::settings::Settings;
use streamweb::state::AppState;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", streamweb::APP_NAME, e);
            std::process::exit(1);
        }
    };
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging);
    tracing::debug!("{} v{} starting", streamweb::APP_NAME, streamweb::VERSION);

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Command, config: AppConfig) -> Result<i32> {
    match command {
        Command::Serve { bind } => {
            let state = Arc::new(AppState::new(config)?);
            tokio::select! {
                result = manage::serve(state.clone(), bind.as_deref()) => result.map(|_| 0),
                code = shutdown_signal() => {
                    state.transmux.shutdown().await;
                    Ok(code)
                }
            }
        }
        Command::History { action } => {
            manage::history(&History::new(History::default_path()?), &action)?;
            Ok(0)
        }
        Command::Settings { action } => {
            manage::settings(&Settings::default_path()?, &action)?;
            Ok(0)
        }
        command => {
            let ctx = Context::new(config)?;
            // dropping the command future kills its children and removes
            // unfinished downloads
            let result = tokio::select! {
                result = catalog_command(&ctx, &command) => result.map(|_| 0),
                code = shutdown_signal() => Ok(code),
            };
            ctx.shutdown().await;
            result
        }
    }
}

async fn catalog_command(ctx: &Context, command: &Command) -> Result<()> {
    match command {
        Command::Anime(args) => play::anime(ctx, args).await,
        Command::Series(args) => play::series(ctx, args).await,
        Command::Movie(args) => play::movie(ctx, args).await,
        Command::Serve { .. } | Command::History { .. } | Command::Settings { .. } => Ok(()),
    }
}

/// Wait for a termination signal and return the matching exit code.
#[cfg(unix)]
async fn shutdown_signal() -> i32 {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        tracing::warn!("Could not install signal handlers");
        return std::future::pending().await;
    };
    let code = tokio::select! {
        _ = interrupt.recv() => 130,
        _ = terminate.recv() => 143,
        _ = hangup.recv() => 129,
    };
    tracing::info!("Interrupted, cleaning up");
    code
}

#[cfg(not(unix))]
async fn shutdown_signal() -> i32 {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Could not listen for Ctrl-C: {}", e);
        return std::future::pending().await;
    }
    tracing::info!("Interrupted, cleaning up");
    130
}

/// Initialize logging with tracing. `RUST_LOG` wins over the configured
/// level; output goes to stderr so it never mixes with command output.
fn init_logging(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("streamweb={},tower_http={}", config.level, config.level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!streamweb::VERSION.is_empty());
    }
}
