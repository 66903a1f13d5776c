//! Transport-neutral view of a realtime connection.
//!
//! A group never touches a socket directly. It sends through a
//! [`ConnectionSink`] and consumes the connection's [`ConnectionEvent`]s in
//! arrival order. [`channel_connection`] builds both halves over in-process
//! channels; the websocket adapter and the tests drive the other end.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifier of a connection within its group.
pub type ConnectionId = String;

/// Something that happened on the client side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A text payload from the client.
    Message(String),
    /// Reply to a heartbeat ping.
    Pong,
    /// The client closed the connection or the stream ended.
    Close,
    /// The transport failed.
    Error(String),
}

/// A frame the group wants written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),
}

/// Write side of a connection.
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), ConnectionError>;

    /// Send a protocol-level ping.
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Close the connection from the server side. Closing twice is harmless.
    async fn close(&self);
}

/// A connection handed to a group: its sink plus its ordered event stream.
pub struct RawConnection {
    pub sink: Arc<dyn ConnectionSink>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl RawConnection {
    pub fn new(
        sink: Arc<dyn ConnectionSink>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self { sink, events }
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection").finish_non_exhaustive()
    }
}

struct ChannelSink {
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[async_trait]
impl ConnectionSink for ChannelSink {
    async fn send(&self, text: &str) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| ConnectionError::Closed)
    }

    async fn ping(&self) -> Result<(), ConnectionError> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Transport end of a [`channel_connection`].
///
/// Frames written by the group arrive on `outbound`; client activity is
/// reported through `events`.
pub struct ConnectionPeer {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionPeer {
    /// Report a text message from the client. Returns `false` once the
    /// group stopped listening.
    pub fn message(&self, text: impl Into<String>) -> bool {
        self.events
            .send(ConnectionEvent::Message(text.into()))
            .is_ok()
    }

    pub fn pong(&self) -> bool {
        self.events.send(ConnectionEvent::Pong).is_ok()
    }

    pub fn close(&self) -> bool {
        self.events.send(ConnectionEvent::Close).is_ok()
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.events
            .send(ConnectionEvent::Error(reason.into()))
            .is_ok()
    }

    /// Next frame written by the group, `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Frames already written, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames already written, without waiting.
    pub fn drain_texts(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

/// Build a connection over unbounded in-process channels.
pub fn channel_connection() -> (RawConnection, ConnectionPeer) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let raw = RawConnection::new(Arc::new(ChannelSink { outbound: outbound_tx }), events_rx);
    let peer = ConnectionPeer {
        outbound: outbound_rx,
        events: events_tx,
    };
    (raw, peer)
}
