//! Framed transport channel
//!
//! `FramedChannel` runs the wire codec over any async byte stream: a
//! loopback TCP connection in production, an in-memory duplex pipe in tests.
//! Reads and writes are independent halves so the heartbeat sender never
//! waits behind a blocked reader.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use seb_protocol::{Message, MessageCodec};

use crate::error::ChannelError;
use crate::traits::MessageChannel;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Message channel over an async byte stream
pub struct FramedChannel {
    reader: Mutex<FramedRead<BoxedReader, MessageCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, MessageCodec>>,
    closed: CancellationToken,
    io_timeout: Duration,
    peer: String,
}

impl FramedChannel {
    /// Wrap a generic bidirectional stream
    pub fn new<S>(stream: S, io_timeout: Duration, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(Box::pin(reader), Box::pin(writer), io_timeout, peer.into())
    }

    /// Wrap a TCP connection
    pub fn from_tcp(stream: TcpStream, io_timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        Self::from_halves(Box::pin(reader), Box::pin(writer), io_timeout, peer)
    }

    fn from_halves(
        reader: BoxedReader,
        writer: BoxedWriter,
        io_timeout: Duration,
        peer: String,
    ) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(reader, MessageCodec::new())),
            writer: Mutex::new(FramedWrite::new(writer, MessageCodec::new())),
            closed: CancellationToken::new(),
            io_timeout,
            peer,
        }
    }

    /// The I/O timeout applied to sends
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }
}

#[async_trait]
impl MessageChannel for FramedChannel {
    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.send(message).await
        };

        let result = tokio::select! {
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            result = tokio::time::timeout(self.io_timeout, write) => result,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!("Send to {} failed: {}", self.peer, e);
                self.close().await;
                Err(ChannelError::from(e))
            }
            Err(_) => {
                // A frame may be half written; the stream cannot be trusted
                tracing::warn!("Send to {} timed out after {:?}", self.peer, self.io_timeout);
                self.close().await;
                Err(ChannelError::Timeout)
            }
        }
    }

    async fn recv(&self) -> Result<Message, ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let read = async {
            let mut reader = self.reader.lock().await;
            reader.next().await
        };

        let item = tokio::select! {
            _ = self.closed.cancelled() => return Err(ChannelError::Closed),
            item = read => item,
        };

        match item {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => {
                tracing::debug!("Receive from {} failed: {}", self.peer, e);
                self.close().await;
                Err(ChannelError::from(e))
            }
            None => {
                tracing::debug!("Peer {} closed the stream", self.peer);
                self.close().await;
                Err(ChannelError::Closed)
            }
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        // Flush and shut down our write half so the peer sees EOF
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        match tokio::time::timeout(self.io_timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Shutdown of channel to {} failed: {}", self.peer, e),
            Err(_) => tracing::debug!("Shutdown of channel to {} timed out", self.peer),
        }
        tracing::debug!("Channel to {} closed", self.peer);
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
