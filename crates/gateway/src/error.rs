//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The tunnel closed while a command or stream was in flight.
    #[error("tunnel closed")]
    TunnelClosed,

    /// No reply to a command within the reply window.
    #[error("timed out waiting for reply to request {0}")]
    ReplyTimeout(String),

    /// A request id was reused while still live on the tunnel.
    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),

    /// The connector answered a command with an error status.
    #[error("connector error: {0}")]
    Connector(String),

    /// No live tunnel for the tenant.
    #[error("tenant not connected: {0}")]
    TenantNotConnected(String),

    /// The whole flight_info + do_get sequence overran its deadline.
    #[error("query deadline exceeded")]
    QueryTimeout,

    /// The transport cannot carry this frame kind.
    #[error("unsupported frame for this transport: {0}")]
    UnsupportedFrame(&'static str),

    /// Receiver side of a channel is gone.
    #[error("channel send error")]
    ChannelSend,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<axum::Error> for GatewayError {
    fn from(e: axum::Error) -> Self {
        GatewayError::Transport(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
