//! Exam lockdown service
//!
//! Mints the session token, launches the browser client with it and
//! supervises the client over a loopback channel. Losing the client
//! abnormally aborts the exam session unless `allow_reconnect` is set.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seb_core::auth::mint_token;
use seb_core::config::{self, ServiceConfig};
use seb_core::launch::LaunchCredentials;
use seb_core::traits::CommandHandler;
use seb_core::{LostReason, SessionEvent};
use seb_service::{ClientLauncher, ClientListener, ClientProxy};

#[derive(Parser)]
#[command(name = "seb-service")]
#[command(about = "Exam lockdown service - supervises the browser client")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Browser client executable (overrides config)
    #[arg(long)]
    client: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Acknowledges client-originated commands
struct LoggingHandler;

#[async_trait]
impl CommandHandler for LoggingHandler {
    async fn handle_command(&self, payload: Bytes) -> Bytes {
        tracing::info!("Client command ({} bytes)", payload.len());
        payload
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Exam lockdown service starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_service_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServiceConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServiceConfig::default()
        }
    };

    // Apply command-line overrides
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(client) = args.client {
        config.client_executable = Some(client);
    }
    config.validate().context("Invalid configuration")?;

    let token = mint_token();
    let proxy = Arc::new(
        ClientProxy::from_config(token.clone(), &config).with_command_handler(Arc::new(LoggingHandler)),
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let listener = ClientListener::bind(&config.bind_address, Arc::clone(&proxy), &config)
        .await?
        .with_shutdown_token(cancel.clone());
    let address = listener.local_addr()?;

    // Hand the token to the client; our copy is dropped (and zeroed) here
    let client = match ClientLauncher::from_config(&config) {
        Some(launcher) => Some(launcher.spawn(&LaunchCredentials::new(address, token))?),
        None => {
            drop(token);
            tracing::warn!(
                "No client executable configured; no client can obtain this session's token"
            );
            None
        }
    };

    // React to session events
    let events = proxy.subscribe();
    tokio::spawn(handle_session_events(
        events,
        Arc::clone(&proxy),
        cancel.clone(),
        config.allow_reconnect,
    ));

    // Watch the client process
    if let Some(mut child) = client {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => tracing::info!("Client exited with {}", status),
                    Err(e) => tracing::warn!("Failed to wait for client: {}", e),
                },
                _ = cancel.cancelled() => {}
            }
        });
    }

    listener.run().await?;

    proxy.end_session().await;
    tracing::info!("Service shutdown complete");
    Ok(())
}

/// Map session events onto lockdown policy
async fn handle_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    proxy: Arc<ClientProxy>,
    cancel: CancellationToken,
    allow_reconnect: bool,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected) => {
                tracing::info!("Client connected; lockdown active");
            }
            Ok(SessionEvent::Lost(LostReason::Requested)) => {
                tracing::info!("Client disconnected; ending exam session");
                cancel.cancel();
                return;
            }
            Ok(SessionEvent::Lost(reason)) => {
                tracing::error!("Client lost ({})", reason);
                if allow_reconnect {
                    // Reset so the client may authenticate on a fresh channel
                    proxy.disconnect().await;
                    tracing::info!("Waiting for the client to reconnect");
                } else {
                    tracing::error!("Aborting exam session");
                    cancel.cancel();
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Session event handler lagged by {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
