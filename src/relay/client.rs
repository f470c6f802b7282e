// Client connections: server-side outboxes, stream pump and a protocol client

use crate::relay::channel::ChannelId;
use crate::relay::message::{Message, ProtocolMessage, UserId};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use uuid::Uuid;

/// Identifies one accepted transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a frame did not reach a connection's outbox
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbox full for longer than the delivery timeout")]
    TimedOut,
    #[error("outbox still full after an earlier timeout")]
    Lagging,
    #[error("connection closed")]
    Closed,
}

/// Server-side handle to a connected client
///
/// Frames go into a bounded outbox that the connection's writer task
/// drains, so a slow reader applies backpressure instead of growing memory.
/// Once a write times out the connection is marked lagging and later frames
/// are only queued if space is free right away, until the outbox drains.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    tx: mpsc::Sender<ProtocolMessage>,
    lagging: Arc<AtomicBool>,
}

impl ClientConnection {
    /// Create a connection handle and the receiving end of its outbox
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: ConnectionId::new(),
            tx,
            lagging: Arc::new(AtomicBool::new(false)),
        };
        (connection, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame, waiting at most `timeout` for outbox space
    ///
    /// A lagging connection never waits: the frame is dropped unless the
    /// outbox has room now, and the first successful enqueue clears the flag.
    pub async fn deliver(
        &self,
        message: ProtocolMessage,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if self.is_lagging() {
            return match self.tx.try_send(message) {
                Ok(()) => {
                    self.lagging.store(false, Ordering::Release);
                    Ok(())
                }
                Err(TrySendError::Full(_)) => Err(DeliveryError::Lagging),
                Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
            };
        }

        match self.tx.send_timeout(message, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.lagging.store(true, Ordering::Release);
                Err(DeliveryError::TimedOut)
            }
            Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A line read from a client: a parsed frame or the reason it did not parse
pub type InboundFrame = Result<ProtocolMessage, serde_json::Error>;

/// Pump a client stream: outbox frames out, parsed lines in
///
/// Returns when the peer closes the stream, a read fails or the inbound
/// side is dropped.
pub async fn handle_client_stream<S>(
    stream: S,
    mut outgoing_rx: mpsc::Receiver<ProtocolMessage>,
    incoming_tx: mpsc::UnboundedSender<InboundFrame>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // Spawn task to handle outgoing messages
    let write_task = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            match msg.to_bytes() {
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode frame: {}", e),
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Handle incoming messages
    let mut line = String::new();
    loop {
        line.clear();

        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let frame = ProtocolMessage::from_bytes(trimmed.as_bytes());
                if let Err(e) = &frame {
                    tracing::warn!("Failed to parse frame: {}", e);
                }
                if incoming_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    write_task.abort();
    Ok(())
}

/// Client side of the relay protocol
///
/// Live `deliver` frames that arrive while waiting for a reply are queued
/// and handed out by [`RelayClient::next_delivery`].
pub struct RelayClient {
    reader: Box<dyn AsyncBufRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    pending: VecDeque<Message>,
    user_id: Option<UserId>,
}

impl RelayClient {
    /// Connect to `server`: a filesystem path for a Unix socket, otherwise `host:port`
    pub async fn connect(server: &str) -> Result<Self> {
        if server.starts_with('/') || server.starts_with('.') {
            Self::connect_unix(Path::new(server)).await
        } else {
            Self::connect_tcp(server).await
        }
    }

    pub async fn connect_tcp(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(read_half, write_half))
    }

    pub async fn connect_unix(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", path))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::from_halves(read_half, write_half))
    }

    fn from_halves<R, W>(read_half: R, write_half: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader: Box::new(BufReader::new(read_half)),
            writer: Box::new(write_half),
            pending: VecDeque::new(),
            user_id: None,
        }
    }

    /// The identity the server accepted, once authenticated
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Write one frame
    pub async fn send_frame(&mut self, frame: &ProtocolMessage) -> Result<()> {
        let bytes = frame.to_bytes().context("Failed to encode frame")?;
        self.writer
            .write_all(&bytes)
            .await
            .context("Failed to write to server")?;
        self.writer.flush().await.context("Failed to flush to server")
    }

    /// Read the next frame, `None` once the server closes the stream
    pub async fn next_frame(&mut self) -> Result<Option<ProtocolMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .context("Failed to read from server")?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let frame = ProtocolMessage::from_bytes(trimmed.as_bytes())
                .context("Server sent a malformed frame")?;
            return Ok(Some(frame));
        }
    }

    /// Next frame that is not a live delivery; deliveries are queued
    async fn next_reply(&mut self) -> Result<ProtocolMessage> {
        loop {
            match self.next_frame().await? {
                Some(ProtocolMessage::Deliver { message }) => self.pending.push_back(message),
                Some(ProtocolMessage::Error { kind, message }) => {
                    anyhow::bail!("Server error ({}): {}", kind, message)
                }
                Some(frame) => return Ok(frame),
                None => anyhow::bail!("Server closed the connection"),
            }
        }
    }

    /// Present a bearer token; returns the identity bound to this connection
    pub async fn authenticate(&mut self, token: &str) -> Result<UserId> {
        self.send_frame(&ProtocolMessage::Auth {
            token: token.to_string(),
        })
        .await?;

        match self.next_reply().await? {
            ProtocolMessage::AuthResponse {
                success: true,
                user_id: Some(user_id),
                ..
            } => {
                self.user_id = Some(user_id);
                Ok(user_id)
            }
            ProtocolMessage::AuthResponse { message, .. } => {
                anyhow::bail!("Authentication failed: {}", message)
            }
            other => anyhow::bail!("Unexpected reply to auth: {:?}", other),
        }
    }

    /// Join the conversation with `peer`, returning the backlog
    pub async fn join(&mut self, peer: UserId) -> Result<(ChannelId, Vec<Message>)> {
        self.send_frame(&ProtocolMessage::Join { peer_id: peer }).await?;

        match self.next_reply().await? {
            ProtocolMessage::Joined { channel, history } => Ok((channel, history)),
            other => anyhow::bail!("Unexpected reply to join: {:?}", other),
        }
    }

    pub async fn leave(&mut self, peer: UserId) -> Result<ChannelId> {
        self.send_frame(&ProtocolMessage::Leave { peer_id: peer }).await?;

        match self.next_reply().await? {
            ProtocolMessage::Left { channel } => Ok(channel),
            other => anyhow::bail!("Unexpected reply to leave: {:?}", other),
        }
    }

    /// Send `content` to `peer`; returns the persisted record
    pub async fn send_message(&mut self, peer: UserId, content: &str) -> Result<Message> {
        self.send_frame(&ProtocolMessage::Send {
            peer_id: peer,
            content: content.to_string(),
        })
        .await?;

        match self.next_reply().await? {
            ProtocolMessage::Sent { message } => Ok(message),
            other => anyhow::bail!("Unexpected reply to send: {:?}", other),
        }
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.send_frame(&ProtocolMessage::Ping).await?;

        match self.next_reply().await? {
            ProtocolMessage::Pong => Ok(()),
            other => anyhow::bail!("Unexpected reply to ping: {:?}", other),
        }
    }

    /// Next live delivery, `None` once the server closes the stream
    pub async fn next_delivery(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }

        loop {
            match self.next_frame().await? {
                Some(ProtocolMessage::Deliver { message }) => return Ok(Some(message)),
                Some(ProtocolMessage::Error { kind, message }) => {
                    anyhow::bail!("Server error ({}): {}", kind, message)
                }
                Some(other) => tracing::debug!("Ignoring frame while listening: {:?}", other),
                None => return Ok(None),
            }
        }
    }
}
