//! The bidirectional message channel.
//!
//! A thin duplex wrapper over a WebSocket: text frames out, channel events
//! in. Reconnection is the owner's job; a channel is opened once and
//! reports exactly one `Closed` event when its socket dies.

use crate::error::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

/// Events surfaced by an open channel, in arrival order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The socket is open and the first frame may be sent
    Open,
    /// A text frame arrived
    Message(String),
    /// The socket errored; a `Closed` event follows
    Error(String),
    /// The socket is gone. Always the final event.
    Closed,
}

/// Handle to an open message channel.
///
/// Dropping the handle closes the writer side, which ends the socket.
pub struct MessageChannel {
    outbound: mpsc::UnboundedSender<Message>,
}

impl MessageChannel {
    /// Open the channel and spawn its reader/writer tasks.
    ///
    /// Returns the send handle and the ordered event stream. The `Open`
    /// event is already queued when this returns.
    pub async fn open(url: &str) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        info!(%url, "opening message channel");
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        let _ = events.send(ChannelEvent::Open);

        // Writer: forward queued frames until the handle is dropped.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    error!("failed to send message: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Reader: surface frames and the terminal close.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = events.send(ChannelEvent::Message(text));
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "close frame received");
                        break;
                    }
                    Ok(_) => {
                        // Binary, ping, pong -- tungstenite answers pings itself
                    }
                    Err(e) => {
                        let _ = events.send(ChannelEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            let _ = events.send(ChannelEvent::Closed);
        });

        Ok((Self { outbound }, events_rx))
    }

    /// Queue a text frame. No-op once the socket is gone.
    pub fn send_text(&self, text: String) {
        debug!(frame = %text, "channel send");
        if self.outbound.send(Message::Text(text)).is_err() {
            debug!("send on closed channel ignored");
        }
    }

    /// Queue a JSON frame.
    pub fn send_json(&self, value: &Value) {
        self.send_text(value.to_string());
    }

    /// Ask the peer to close. Queued frames ahead of this are still sent.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}
