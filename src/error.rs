//! Error types for the BBTronic realtime client.

use thiserror::Error;

/// Errors that can occur when using the realtime connection manager.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Waited for an in-flight connection attempt longer than the configured bound.
    #[error("timed out waiting for the in-flight connection attempt")]
    ConnectTimeout,

    /// The transport rejected the connection attempt.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// Attempted an operation that requires an active channel, but the manager is not connected.
    #[error("not connected to the realtime channel")]
    NotConnected,

    /// An inbound frame body could not be parsed as a topic message.
    ///
    /// Never returned to callers; the manager logs it and drops the frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Publishing a frame on a closed or broken link failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A message payload was not a JSON object.
    #[error("payload must be a JSON object")]
    InvalidPayload,

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// The peer sent something that is not valid STOMP, or answered with an ERROR frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to serialize or deserialize a JSON message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for realtime client operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;
