//! Loopback listener for the browser client
//!
//! Accepts TCP connections on 127.0.0.1 only, waits for the client's
//! `AuthenticateRequest` and hands the token and channel to the
//! [`ClientProxy`]. A client that is refused receives a `DisconnectNotice`
//! before the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use seb_core::channel::FramedChannel;
use seb_core::config::ServiceConfig;
use seb_core::traits::MessageChannel;
use seb_core::{ChannelError, SessionError};
use seb_protocol::Message;

use crate::proxy::ClientProxy;

/// Accepts the browser client and runs its authentication handshake
pub struct ClientListener {
    listener: TcpListener,
    proxy: Arc<ClientProxy>,
    auth_timeout: Duration,
    io_timeout: Duration,
    shutdown_token: Option<CancellationToken>,
}

impl ClientListener {
    /// Bind to `address`
    pub async fn bind(address: &str, proxy: Arc<ClientProxy>, config: &ServiceConfig) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to bind client listener to {}", address))?;

        let local = listener.local_addr()?;
        if !local.ip().is_loopback() {
            tracing::warn!(
                "Client listener bound to non-loopback address {}; remote peers will be dropped",
                local
            );
        }

        Ok(Self {
            listener,
            proxy,
            auth_timeout: config.auth_timeout,
            io_timeout: config.io_timeout,
            shutdown_token: None,
        })
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read client listener address")
    }

    /// Accept clients until the shutdown token is cancelled
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Client listener on {}", self.local_addr()?);
        let shutdown = self
            .shutdown_token
            .clone()
            .unwrap_or_else(CancellationToken::new);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Client listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        // Only the locally launched client may connect
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                            continue;
                        }

                        let proxy = Arc::clone(&self.proxy);
                        let auth_timeout = self.auth_timeout;
                        let io_timeout = self.io_timeout;
                        tokio::spawn(async move {
                            handle_client(stream, proxy, auth_timeout, io_timeout).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept client connection: {}", e);
                    }
                }
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    proxy: Arc<ClientProxy>,
    auth_timeout: Duration,
    io_timeout: Duration,
) {
    let channel: Arc<dyn MessageChannel> = Arc::new(FramedChannel::from_tcp(stream, io_timeout));
    tracing::debug!("Client connected from {}", channel.peer());

    if proxy.is_locked_out() {
        tracing::warn!("Refusing client {}: session locked", channel.peer());
        refuse(channel.as_ref()).await;
        return;
    }

    let token = match channel.recv_timeout(auth_timeout).await {
        Ok(Message::AuthenticateRequest(token)) => token,
        Ok(other) => {
            tracing::warn!(
                "Client {} sent {:?} before authenticating",
                channel.peer(),
                other.message_type()
            );
            refuse(channel.as_ref()).await;
            return;
        }
        Err(ChannelError::Timeout) => {
            tracing::warn!(
                "Client {} did not authenticate within {:?}",
                channel.peer(),
                auth_timeout
            );
            refuse(channel.as_ref()).await;
            return;
        }
        Err(e) => {
            tracing::debug!("Client {} went away before authenticating: {}", channel.peer(), e);
            channel.close().await;
            return;
        }
    };

    match proxy.try_connect(&token, Arc::clone(&channel)).await {
        Ok(()) => tracing::info!("Client {} authenticated", channel.peer()),
        Err(e @ (SessionError::AlreadyConnected | SessionError::AttemptsExhausted)) => {
            tracing::warn!("Refusing client {}: {}", channel.peer(), e);
            refuse(channel.as_ref()).await;
        }
        Err(e) => tracing::warn!("Client {} not authenticated: {}", channel.peer(), e),
    }
}

async fn refuse(channel: &dyn MessageChannel) {
    if let Err(e) = channel.send(Message::DisconnectNotice).await {
        tracing::debug!("Failed to notify refused client {}: {}", channel.peer(), e);
    }
    channel.close().await;
}
