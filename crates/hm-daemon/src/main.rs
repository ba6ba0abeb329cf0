//! HM Daemon - Droplet health manager
//!
//! Reads agent heartbeats and exit notices as JSON lines on stdin and writes
//! start and stop commands as JSON lines on stdout. Logs go to stderr.

use std::sync::Arc;

use clap::Parser;
use hm_daemon::{write_commands, Daemon, DaemonConfig, DaemonError, DaemonResult};
use hm_harmonizer::collaborators::ChannelDispatcher;
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HM Daemon CLI
#[derive(Parser)]
#[command(name = "hmd")]
#[command(about = "HM Daemon - Droplet health manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "HM_CONFIG")]
    config: Option<String>,

    /// Log level, overriding the configuration file
    #[arg(long, env = "HM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "HM_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Initialize tracing; stdout carries commands
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    config.validate().map_err(DaemonError::Config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        sweep_interval_secs = config.scheduler.sweep_interval_secs,
        desired_state_file = ?config.desired_state.file,
        "Starting health manager"
    );

    let (dispatcher, commands) = ChannelDispatcher::channel();
    let writer = tokio::spawn(write_commands(commands, tokio::io::stdout()));

    let (daemon, requests) = Daemon::new(config, Arc::new(dispatcher))?;
    let summary = daemon
        .run(requests, BufReader::new(tokio::io::stdin()), shutdown_signal())
        .await?;
    tracing::info!(
        messages = summary.messages,
        malformed = summary.malformed,
        "Agent feed processed"
    );

    // Dropping the daemon closes the command channel and lets the writer drain.
    drop(daemon);
    match writer.await {
        Ok(Ok(written)) => tracing::info!(commands = written, "Command output closed"),
        Ok(Err(e)) => return Err(e),
        Err(e) => tracing::error!(error = %e, "Command writer failed"),
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
