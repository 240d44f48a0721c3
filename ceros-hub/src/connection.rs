//! One WebSocket bound to one authenticated user.
//!
//! Each connection runs two pumps:
//! - the **read pump** (the task that called [`Connection::run`]) waits for
//!   the next inbound frame under a read deadline, decodes it and hands it to
//!   the [`Dispatcher`];
//! - the **write pump** (a spawned task) drains the outbound buffer, joins
//!   whatever is already queued into one newline-delimited text frame, and
//!   sends a Ping every `ping_interval`.
//!
//! ```text
//! register ──► active ──┬── ReadClosed  ──┐
//!                       ├── WriteClosed ──┼──► Unregistered
//!                       └── Evicted     ──┘
//! ```
//!
//! Whichever pump stops first ends the connection; the hub is told exactly
//! once from [`Connection::run`], and a repeated unregister is a no-op there.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::error::HubError;
use crate::hub::{HubHandle, Registration};
use crate::protocol::{Envelope, Frame, FrameBatch};

/// Identity of one physical connection. A user may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque authenticated user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-connection limits and liveness timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Outbound buffer capacity in frames
    pub send_buffer: usize,
    /// Largest inbound message accepted, in bytes
    pub max_message_size: usize,
    /// Peer must send something (data, ping or pong) within this window
    pub read_timeout: Duration,
    /// Deadline for a single write
    pub write_timeout: Duration,
    /// Keepalive probe period; stays below `read_timeout`
    pub ping_interval: Duration,
    /// Deadline for each persistence or authorization call made while
    /// handling an inbound frame
    pub collaborator_timeout: Duration,
}

impl ConnectionConfig {
    /// Set the read deadline and derive the probe period from it (9/10).
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.ping_interval = read_timeout * 9 / 10;
        self
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn with_collaborator_timeout(mut self, collaborator_timeout: Duration) -> Self {
        self.collaborator_timeout = collaborator_timeout;
        self
    }

    pub fn with_send_buffer(mut self, send_buffer: usize) -> Self {
        self.send_buffer = send_buffer.max(1);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            send_buffer: 256,
            max_message_size: 4096,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            collaborator_timeout: Duration::from_secs(5),
        }
    }
}

/// How an active connection ended, and its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ReadClosed,
    WriteClosed,
    Evicted,
    Unregistered,
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent Close or the stream ended
    ClientClosed,
    /// Transport error on read
    ReadError(String),
    /// Nothing received within the read deadline
    TimedOut,
    /// A data write or keepalive probe failed
    WriteFailed,
    /// The hub closed the outbound buffer
    Evicted,
    /// The hub task is gone
    HubClosed,
}

impl CloseReason {
    /// The state the connection passed through before unregistering.
    pub fn exit_state(&self) -> ConnectionState {
        match self {
            Self::ClientClosed | Self::ReadError(_) | Self::TimedOut | Self::HubClosed => {
                ConnectionState::ReadClosed
            }
            Self::WriteFailed => ConnectionState::WriteClosed,
            Self::Evicted => ConnectionState::Evicted,
        }
    }

    fn write_pump_finished(&self) -> bool {
        matches!(self, Self::WriteFailed | Self::Evicted)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => write!(f, "closed by client"),
            Self::ReadError(e) => write!(f, "read error: {e}"),
            Self::TimedOut => write!(f, "keepalive timeout"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::Evicted => write!(f, "evicted by hub"),
            Self::HubClosed => write!(f, "hub closed"),
        }
    }
}

/// Who is speaking, as seen by the dispatch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub user_id: UserId,
}

/// How the write pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteExit {
    BufferClosed,
    WriteFailed,
}

/// A registered connection, ready to run its pumps.
pub struct Connection<S> {
    ctx: ConnectionContext,
    ws: WebSocketStream<S>,
    outbound: mpsc::Receiver<Frame>,
    hub: HubHandle,
    dispatcher: Arc<Dispatcher>,
    config: ConnectionConfig,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create the outbound buffer and admit the connection to the hub.
    pub async fn register(
        ws: WebSocketStream<S>,
        user_id: UserId,
        hub: HubHandle,
        dispatcher: Arc<Dispatcher>,
        config: ConnectionConfig,
    ) -> Result<Self, HubError> {
        let ctx = ConnectionContext {
            id: ConnectionId::new(),
            user_id,
        };
        let (tx, outbound) = mpsc::channel(config.send_buffer.max(1));

        hub.register(Registration {
            id: ctx.id,
            user_id: ctx.user_id.clone(),
            outbound: tx,
        })
        .await?;

        Ok(Self {
            ctx,
            ws,
            outbound,
            hub,
            dispatcher,
            config,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.ctx.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.ctx.user_id
    }

    /// Run both pumps until either stops, then unregister.
    pub async fn run(self) -> CloseReason {
        let Self {
            ctx,
            ws,
            outbound,
            hub,
            dispatcher,
            config,
        } = self;

        let (sink, stream) = ws.split();
        let mut write_task = tokio::spawn(write_pump(sink, outbound, config.clone()));

        let reason = read_pump(stream, &ctx, &dispatcher, config.read_timeout, &mut write_task).await;
        log::debug!(
            "Connection {} ({}) {:?}: {reason}",
            ctx.user_id,
            ctx.id,
            reason.exit_state()
        );

        // Closes the outbound buffer; no-op if the hub already evicted us.
        if hub.unregister(ctx.id).await.is_err() {
            log::debug!("Hub gone while unregistering {}", ctx.id);
        }

        if !reason.write_pump_finished() {
            // Bounded: the write pump only has the close frame left to send.
            if timeout(config.write_timeout * 2, &mut write_task).await.is_err() {
                write_task.abort();
            }
        }

        log::info!(
            "Connection {} ({}) {:?}: {reason}",
            ctx.user_id,
            ctx.id,
            ConnectionState::Unregistered
        );
        reason
    }
}

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    ctx: &ConnectionContext,
    dispatcher: &Dispatcher,
    read_timeout: Duration,
    write_task: &mut JoinHandle<WriteExit>,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            exit = &mut *write_task => {
                return match exit {
                    Ok(WriteExit::BufferClosed) => CloseReason::Evicted,
                    Ok(WriteExit::WriteFailed) | Err(_) => CloseReason::WriteFailed,
                };
            }

            // Any received frame, including Pong, resets the deadline.
            next = timeout(read_timeout, stream.next()) => {
                let msg = match next {
                    Err(_) => return CloseReason::TimedOut,
                    Ok(None) => return CloseReason::ClientClosed,
                    Ok(Some(Err(e))) => return read_error(e),
                    Ok(Some(Ok(msg))) => msg,
                };

                match msg {
                    Message::Text(text) => {
                        let envelope = match Envelope::decode(text.as_str()) {
                            Ok(envelope) => envelope,
                            Err(e) => {
                                log::warn!("Dropping malformed frame from {}: {e}", ctx.user_id);
                                continue;
                            }
                        };
                        if let Err(HubError::HubClosed) = dispatcher.dispatch(ctx, envelope).await {
                            return CloseReason::HubClosed;
                        }
                    }
                    Message::Close(_) => return CloseReason::ClientClosed,
                    Message::Binary(data) => {
                        log::debug!("Ignoring {}-byte binary frame from {}", data.len(), ctx.user_id);
                    }
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
        }
    }
}

fn read_error(e: tungstenite::Error) -> CloseReason {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            CloseReason::ClientClosed
        }
        tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ) => CloseReason::ClientClosed,
        other => {
            log::warn!("WebSocket read error: {other}");
            CloseReason::ReadError(other.to_string())
        }
    }
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    config: ConnectionConfig,
) -> WriteExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    let exit = loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = send_with_deadline(&mut sink, Message::Close(None), config.write_timeout).await;
                    break WriteExit::BufferClosed;
                };

                let mut batch = FrameBatch::new(&frame);
                while let Ok(next) = outbound.try_recv() {
                    batch.push(&next);
                }
                let text = batch.into_text();

                if let Err(e) = send_with_deadline(&mut sink, Message::text(text), config.write_timeout).await {
                    log::debug!("Write failed: {e}");
                    break WriteExit::WriteFailed;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = send_with_deadline(&mut sink, Message::Ping(Default::default()), config.write_timeout).await {
                    log::debug!("Keepalive probe failed: {e}");
                    break WriteExit::WriteFailed;
                }
            }
        }
    };

    let _ = timeout(config.write_timeout, sink.close()).await;
    exit
}

async fn send_with_deadline<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    msg: Message,
    deadline: Duration,
) -> Result<(), tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(deadline, sink.send(msg)).await {
        Ok(result) => result,
        Err(_) => Err(tungstenite::Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "write deadline exceeded",
        ))),
    }
}
