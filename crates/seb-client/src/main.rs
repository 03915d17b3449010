//! Exam browser client
//!
//! Started by the lockdown service with its launch credentials in the
//! environment. Connects back to the service, keeps the session alive and
//! acknowledges the service's commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seb_client::ServiceConnector;
use seb_core::config::{self, ClientConfig};
use seb_core::launch::LaunchCredentials;
use seb_core::traits::CommandHandler;
use seb_core::{LostReason, SessionEvent};

#[derive(Parser)]
#[command(name = "seb-client")]
#[command(about = "Exam browser client - connects to the lockdown service")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Acknowledges service commands; the browser UI consumes them elsewhere
struct AcknowledgingHandler;

#[async_trait]
impl CommandHandler for AcknowledgingHandler {
    async fn handle_command(&self, payload: Bytes) -> Bytes {
        tracing::info!("Service command ({} bytes)", payload.len());
        Bytes::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground {
        "debug"
    } else {
        &args.log_level
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Exam browser client starting...");

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_client_config_path);

    let config = if config_path.exists() {
        config::load_config(&config_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", config_path, e);
            ClientConfig::default()
        })
    } else {
        ClientConfig::default()
    };
    config.validate().context("Invalid configuration")?;

    let credentials =
        LaunchCredentials::from_env().context("Missing launch credentials from the service")?;
    tracing::info!("Service at {}", credentials.address);

    let reconnect = config.reconnect;
    let connector = Arc::new(
        ServiceConnector::new(credentials, config)
            .with_command_handler(Arc::new(AcknowledgingHandler)),
    );
    let mut events = connector.subscribe();

    loop {
        tokio::select! {
            result = connector.connect_with_retry() => {
                result.context("Failed to connect to the service")?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C during connect");
                connector.disconnect().await;
                return Ok(());
            }
        }

        let reason = tokio::select! {
            reason = wait_for_loss(&mut events) => reason,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, disconnecting...");
                connector.disconnect().await;
                return Ok(());
            }
        };

        match reason {
            Some(LostReason::Requested) => {
                tracing::info!("Service ended the session");
                return Ok(());
            }
            Some(reason) if reconnect => {
                tracing::warn!("Lost the service ({}); reconnecting", reason);
                connector.disconnect().await;
            }
            Some(reason) => {
                connector.disconnect().await;
                anyhow::bail!("Lost the service: {}", reason);
            }
            None => return Ok(()),
        }
    }
}

/// Wait for the current session to be lost
async fn wait_for_loss(
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> Option<LostReason> {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected) => tracing::info!("Connected to the service"),
            Ok(SessionEvent::Lost(reason)) => return Some(reason),
            Err(RecvError::Lagged(n)) => tracing::warn!("Event listener lagged by {} events", n),
            Err(RecvError::Closed) => return None,
        }
    }
}
