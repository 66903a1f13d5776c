//! axum websocket adapter.
//!
//! Splits an upgraded socket into a writer task fed by the group's sink and a
//! reader loop that turns frames into [`ConnectionEvent`]s. Incoming pings
//! are answered by axum itself.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GroupBroadcaster;
use super::connection::{ConnectionEvent, ConnectionPeer, Outbound, channel_connection};
use super::hooks::GroupHooks;

fn event_for(message: Message) -> Option<ConnectionEvent> {
    match message {
        Message::Text(text) => Some(ConnectionEvent::Message(text.to_string())),
        Message::Binary(data) => Some(ConnectionEvent::Message(
            String::from_utf8_lossy(&data).into_owned(),
        )),
        Message::Pong(_) => Some(ConnectionEvent::Pong),
        Message::Close(_) => Some(ConnectionEvent::Close),
        Message::Ping(_) => None,
    }
}

fn frame_for(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Bytes::new()),
        Outbound::Close => Message::Close(None),
    }
}

/// How long the reader waits for the client's answer after the server sent
/// a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Attach an upgraded websocket to the group `name` and serve it until it
/// closes.
pub async fn serve_socket(
    socket: WebSocket,
    broadcaster: GroupBroadcaster,
    name: String,
    hooks: Arc<dyn GroupHooks>,
) {
    let (raw, peer) = channel_connection();
    let (mut ws_tx, ws_rx) = socket.split();

    let connection_id = match broadcaster.attach(&name, hooks, raw).await {
        Ok((id, _group)) => id,
        Err(e) => {
            warn!(group = %name, error = %e, "failed to attach websocket");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    debug!(group = %name, connection_id = %connection_id, "websocket attached");
    pump_socket(ws_tx, ws_rx, peer, &name, &connection_id).await;
    debug!(group = %name, connection_id = %connection_id, "websocket finished");
}

/// Move frames between a socket and the group side of a connection until
/// either end is done.
///
/// Once the writer stops (server close, failed write, sink dropped) the
/// reader waits at most [`CLOSE_GRACE`] for the client's close frame, so a
/// half-open peer can't hold the task.
async fn pump_socket<W, R, E>(ws_tx: W, mut ws_rx: R, peer: ConnectionPeer, name: &str, connection_id: &str)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let ConnectionPeer { outbound, events } = peer;
    let writer_done = CancellationToken::new();
    let writer = tokio::spawn(write_frames(
        ws_tx,
        outbound,
        writer_done.clone(),
        name.to_string(),
        connection_id.to_string(),
    ));

    let server_closed = loop {
        let frame = tokio::select! {
            biased;
            frame = ws_rx.next() => frame,
            _ = writer_done.cancelled() => break true,
        };

        let Some(frame) = frame else {
            break false;
        };
        let event = match frame {
            Ok(message) => match event_for(message) {
                Some(event) => event,
                None => continue,
            },
            Err(e) => ConnectionEvent::Error(e.to_string()),
        };

        let terminal = matches!(event, ConnectionEvent::Close | ConnectionEvent::Error(_));
        if events.send(event).is_err() || terminal {
            break false;
        }
    };

    if server_closed {
        let answered = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(message)) = ws_rx.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
        if answered.is_err() {
            debug!(group = %name, connection_id = %connection_id, "peer did not answer close, dropping socket");
        }
    }

    // Stream ended without a close frame
    let _ = events.send(ConnectionEvent::Close);
    drop(events);

    if let Err(e) = writer.await {
        debug!(group = %name, connection_id = %connection_id, error = %e, "websocket writer task failed");
    }
}

async fn write_frames<W>(
    mut ws_tx: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    done: CancellationToken,
    name: String,
    connection_id: String,
) where
    W: Sink<Message> + Unpin + Send,
    W::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        let closing = frame == Outbound::Close;
        if let Err(e) = ws_tx.send(frame_for(frame)).await {
            debug!(group = %name, connection_id = %connection_id, error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = ws_tx.close().await;
    done.cancel();
}
