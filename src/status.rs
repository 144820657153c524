use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state of a [`BrainClient`](crate::BrainClient).
///
/// Every transition emits exactly one
/// [`ClientEvent::ConnectionStatusChanged`](crate::ClientEvent) carrying the
/// new state; a transition to the current state emits nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Bootstrap and handshakes are in progress
    Connecting,
    /// Bootstrap failed or the brain reported a fatal system state
    Failure,
    /// Explicitly disconnected by the caller
    Disconnected,
    /// Channel dropped without a manual disconnect; a retry is pending
    Reconnecting,
    /// A PIN submission is in flight
    Authorizing,
    /// The brain rejected the submitted PIN
    Unauthorized,
    /// Fully connected and authorized
    Active,
    /// The brain is re-parsing its space configuration
    Synchronizing,
}

impl ConnectionStatus {
    /// The human-readable status string used verbatim in
    /// `CONNECTION_STATUS_CHANGED` payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "Connecting ...",
            Self::Failure => "Connection Failure",
            Self::Disconnected => "Brain disconnected",
            Self::Reconnecting => "Reconnecting to brain ...",
            Self::Authorizing => "Authorizing ...",
            Self::Unauthorized => "Unauthorized Connection",
            Self::Active => "Connection Active",
            Self::Synchronizing => "Synchronizing ...",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
