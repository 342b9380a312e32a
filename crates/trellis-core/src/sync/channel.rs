//! Bidirectional message channel
//!
//! The transport is abstracted behind [`Channel`]: the engine only sees
//! typed messages and open/closed state. [`WsChannel`] carries JSON text
//! frames over a websocket; [`MemoryChannel`] is an in-process pair for
//! tests and embedded hosts. Reconnection is driven by the heartbeat
//! supervisor through a [`ChannelFactory`], never by the channel itself.
//!
//! The handshake runs against the whole channel; once a connection is
//! active, the supervisor splits it so it can await incoming messages
//! while still sending pings from the tick handler.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::message::{ClientMessage, ServerMessage};
use crate::error::{SyncError, SyncResult};

/// Outgoing half of a channel
#[async_trait]
pub trait ChannelSender: Send {
    async fn send(&mut self, message: &ClientMessage) -> SyncResult<()>;

    /// Close gracefully.
    async fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Incoming half of a channel
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Receive the next message. `Ok(None)` means the channel closed;
    /// a malformed frame is a protocol violation and propagates.
    async fn recv(&mut self) -> SyncResult<Option<ServerMessage>>;
}

/// A bidirectional, message-oriented connection
pub trait Channel: ChannelSender + ChannelReceiver {
    /// Split into independently owned halves.
    fn split(self: Box<Self>) -> (Box<dyn ChannelSender>, Box<dyn ChannelReceiver>);
}

/// Produces fresh channels for each (re)connection attempt
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self) -> SyncResult<Box<dyn Channel>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket-backed channel carrying JSON text frames
pub struct WsChannel {
    sender: WsSender,
    receiver: WsReceiver,
}

pub struct WsSender {
    write: SplitSink<WsStream, Message>,
    open: bool,
}

pub struct WsReceiver {
    read: SplitStream<WsStream>,
}

impl WsChannel {
    /// Connect to the given ws(s) URL.
    pub async fn connect(url: &str) -> SyncResult<Self> {
        debug!(url, "connecting channel");
        let (stream, _response) = connect_async(url).await?;
        let (write, read) = stream.split();
        Ok(Self {
            sender: WsSender { write, open: true },
            receiver: WsReceiver { read },
        })
    }
}

#[async_trait]
impl ChannelSender for WsSender {
    async fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        if !self.open {
            return Err(SyncError::Transport("channel is closed".to_string()));
        }
        self.write
            .send(Message::Text(message.encode()))
            .await
            .map_err(|e| {
                self.open = false;
                SyncError::from(e)
            })
    }

    async fn close(&mut self) {
        if self.open {
            self.write.close().await.ok();
            self.open = false;
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[async_trait]
impl ChannelReceiver for WsReceiver {
    async fn recv(&mut self) -> SyncResult<Option<ServerMessage>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let message = ServerMessage::decode(&text)
                        .map_err(|e| SyncError::Protocol(format!("bad frame: {}", e)))?;
                    return Ok(Some(message));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(other)) => {
                    // Binary/ping/pong frames are not part of the protocol
                    debug!(?other, "ignoring non-text frame");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "channel read error");
                    return Ok(None);
                }
            }
        }
    }
}

#[async_trait]
impl ChannelSender for WsChannel {
    async fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        self.sender.send(message).await
    }

    async fn close(&mut self) {
        self.sender.close().await;
    }

    fn is_open(&self) -> bool {
        self.sender.is_open()
    }
}

#[async_trait]
impl ChannelReceiver for WsChannel {
    async fn recv(&mut self) -> SyncResult<Option<ServerMessage>> {
        self.receiver.recv().await
    }
}

impl Channel for WsChannel {
    fn split(self: Box<Self>) -> (Box<dyn ChannelSender>, Box<dyn ChannelReceiver>) {
        (Box::new(self.sender), Box::new(self.receiver))
    }
}

/// Factory producing [`WsChannel`]s for one URL
pub struct WsChannelFactory {
    url: String,
}

impl WsChannelFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn open(&self) -> SyncResult<Box<dyn Channel>> {
        Ok(Box::new(WsChannel::connect(&self.url).await?))
    }
}

/// In-process channel endpoint
///
/// Created in pairs: the client half implements [`Channel`], the remote
/// half lets a test (or embedded server) play the server role.
pub struct MemoryChannel {
    sender: MemorySender,
    receiver: MemoryReceiver,
}

pub struct MemorySender {
    tx: mpsc::UnboundedSender<ClientMessage>,
    open: bool,
}

pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Server-side half of a [`MemoryChannel`] pair
pub struct MemoryChannelRemote {
    pub tx: mpsc::UnboundedSender<ServerMessage>,
    pub rx: mpsc::UnboundedReceiver<ClientMessage>,
}

impl MemoryChannel {
    pub fn pair() -> (Self, MemoryChannelRemote) {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: MemorySender {
                    tx: client_tx,
                    open: true,
                },
                receiver: MemoryReceiver { rx: client_rx },
            },
            MemoryChannelRemote {
                tx: server_tx,
                rx: server_rx,
            },
        )
    }
}

#[async_trait]
impl ChannelSender for MemorySender {
    async fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        if !self.open {
            return Err(SyncError::Transport("channel is closed".to_string()));
        }
        self.tx
            .send(message.clone())
            .map_err(|_| SyncError::Transport("remote endpoint dropped".to_string()))
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open && !self.tx.is_closed()
    }
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    async fn recv(&mut self) -> SyncResult<Option<ServerMessage>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl ChannelSender for MemoryChannel {
    async fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        self.sender.send(message).await
    }

    async fn close(&mut self) {
        self.sender.close().await;
    }

    fn is_open(&self) -> bool {
        self.sender.is_open()
    }
}

#[async_trait]
impl ChannelReceiver for MemoryChannel {
    async fn recv(&mut self) -> SyncResult<Option<ServerMessage>> {
        self.receiver.recv().await
    }
}

impl Channel for MemoryChannel {
    fn split(self: Box<Self>) -> (Box<dyn ChannelSender>, Box<dyn ChannelReceiver>) {
        (Box::new(self.sender), Box::new(self.receiver))
    }
}
