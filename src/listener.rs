//! Push notification listener.
//!
//! One WebSocket connection per event. The backend broadcasts a free-text
//! line whenever the queue changes; the payload carries no contract, so
//! every inbound frame is surfaced as an opaque [`ListenerEvent::Changed`]
//! hint and never parsed. The listener does not reconnect itself — that
//! policy belongs to the sync driver.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Lifecycle of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// What the listener reports to the sync driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Server state may have changed. Content-free by design of the wire
    /// protocol.
    Changed,
    /// The connection moved to a new lifecycle state.
    State(ConnectionState),
}

/// A live push subscription for one event.
pub struct QueueListener {
    events: mpsc::UnboundedReceiver<ListenerEvent>,
}

impl QueueListener {
    /// Open the push connection and start forwarding events.
    ///
    /// Fails only if the initial dial fails; after that, connection loss is
    /// reported as a `Closed` or `Errored` state event and the stream ends.
    pub async fn connect(ws_base_url: &str, event_id: i64) -> anyhow::Result<Self> {
        let url = format!(
            "{}/ws/events/{event_id}/queue",
            ws_base_url.trim_end_matches('/')
        );

        let (stream, _) = connect_async(url.as_str()).await?;
        tracing::debug!(event_id, %url, "push connection open");

        let (tx, events) = mpsc::unbounded_channel();
        let _ = tx.send(ListenerEvent::State(ConnectionState::Open));

        tokio::spawn(read_loop(stream, tx));

        Ok(Self { events })
    }

    /// Receive the next event. `None` once the connection is gone and its
    /// terminal state has been delivered.
    pub async fn recv(&mut self) -> Option<ListenerEvent> {
        self.events.recv().await
    }

    #[cfg(test)]
    pub(crate) fn from_channel(events: mpsc::UnboundedReceiver<ListenerEvent>) -> Self {
        Self { events }
    }
}

async fn read_loop<S>(mut stream: S, tx: mpsc::UnboundedSender<ListenerEvent>)
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            // Keepalive traffic, not a change hint. tungstenite answers
            // pings on its own.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                let _ = tx.send(ListenerEvent::State(ConnectionState::Closed));
                break;
            }
            Some(Ok(_)) => {
                // Text or binary: content is not contractual, treat as a hint
                if tx.send(ListenerEvent::Changed).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("push connection error: {e}");
                let _ = tx.send(ListenerEvent::State(ConnectionState::Errored));
                break;
            }
        }
    }
}
