//! Client event bus and reactive stream bridge.
//!
//! A single broadcast channel carries every client-level event; subscribers
//! get them in emission order. [`EventStream`] is the reactive view: every
//! emission reaches every open stream.

use crate::error::{BrainError, Result};
use crate::protocol::BrainStatus;
use crate::status::ConnectionStatus;
use crate::types::SessionAuth;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Client-level events. [`ClientEvent::name`] yields the stable event-name
/// string for each variant.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Message channel opened
    WsConnected,
    /// Message channel closed
    WsClosed,
    /// Inbound message of an unrecognised type
    BrainEvent {
        /// The message's `type` tag
        kind: String,
        /// Raw message
        raw: Value,
    },
    /// Express-mode flag reported by the brain
    ExpressMode {
        /// Whether express mode is enabled
        enabled: bool,
    },
    /// The brain rejected the PIN; a new submission is needed
    PinRequired,
    /// Authorization succeeded
    Authorized(SessionAuth),
    /// Brain status report
    StatusMessage(BrainStatus),
    /// Every inbound message, raw
    WsMessage(Value),
    /// Brain status-LED color report
    ColorMessage(Value),
    /// Any `handset_*` message
    HandsetMessage {
        /// The message's `type` tag
        kind: String,
        /// Raw message
        raw: Value,
    },
    /// The connection state changed
    ConnectionStatusChanged(ConnectionStatus),
}

impl ClientEvent {
    /// The stable event-name string for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WsConnected => "WS_CONNECTED",
            Self::WsClosed => "WS_CLOSED",
            Self::BrainEvent { .. } => "BRAIN_EVENT",
            Self::ExpressMode { .. } => "EXPRESS_MODE",
            Self::PinRequired => "PIN_REQUIRED",
            Self::Authorized(_) => "AUTHORIZED",
            Self::StatusMessage(_) => "STATUS_MESSAGE",
            Self::WsMessage(_) => "WS_MESSAGE",
            Self::ColorMessage(_) => "COLOR_MESSAGE",
            Self::HandsetMessage { .. } => "HANDSET_MESSAGE",
            Self::ConnectionStatusChanged(_) => "CONNECTION_STATUS_CHANGED",
        }
    }
}

/// Multi-listener pub/sub for client events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers. No subscribers is fine.
    pub fn publish(&self, event: ClientEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to raw broadcast delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// Open a reactive stream over the bus.
    pub fn stream(&self) -> EventStream {
        EventStream {
            rx: self.sender.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Reactive stream over the event bus.
///
/// Every event emitted after the stream was opened is observed exactly once,
/// in order, unless the consumer lags past the buffer.
pub struct EventStream {
    rx: broadcast::Receiver<ClientEvent>,
}

impl EventStream {
    /// Receive the next event.
    pub async fn next(&mut self) -> Result<ClientEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => BrainError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => {
                BrainError::ChannelError(format!("Lagged by {n} events"))
            }
        })
    }

    /// Receive an event if one is queued, without waiting.
    pub fn try_next(&mut self) -> Result<Option<ClientEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(BrainError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(BrainError::ChannelError(format!("Lagged by {n} events")))
            }
        }
    }
}
