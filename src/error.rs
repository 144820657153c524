use thiserror::Error;

/// Result type for brain operations
pub type Result<T> = std::result::Result<T, BrainError>;

/// Errors that can occur when interacting with a brain
#[derive(Error, Debug)]
pub enum BrainError {
    /// The controller has no space provisioned to it
    #[error("Brain is not provisioned")]
    NotProvisioned,

    /// Express mode is switched off on the provisioned space
    #[error("Express mode is disabled on the provisioned space")]
    ExpressModeDisabled,

    /// An operation that needs a live connection was called too early
    #[error("Client not initialized: {0}")]
    ClientNotInitialized(String),

    /// Custom states exist only on the system device
    #[error("Not the system device")]
    NotSystemDevice,

    /// State key unknown, or not a custom state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Command key unknown
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Device not found during lookup
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The brain rejected the request's credentials (HTTP 403)
    #[error("Unauthorized")]
    Unauthorized,

    /// Non-2xx HTTP response that is not retried
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Raw response body
        body: String,
    },

    /// HTTP transport error
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid endpoint or URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out
    #[error("Request timeout")]
    Timeout,

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl BrainError {
    /// Returns the HTTP status carried by this error, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Unauthorized => Some(403),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Returns `true` if this is a transient transport error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout => true,
            Self::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}
