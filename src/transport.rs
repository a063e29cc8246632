//! Text-frame transport abstraction underneath the STOMP link.
//!
//! The [`Transport`] trait defines a bidirectional text message channel between
//! the client and the backend broker. Each call carries exactly one complete
//! frame, so implementations handle message framing internally (WebSocket
//! frames, SockJS envelopes, length-prefixed TCP, ...).
//!
//! Opening a connection is split out into the [`Dialer`] trait: the connection
//! manager has to dial again on every reconnect, so it needs a factory rather
//! than a single pre-connected transport.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use bbtronic_realtime::error::RealtimeError;
//! use bbtronic_realtime::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), RealtimeError> {
//!         // Send one text frame
//!         # let _ = message;
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, RealtimeError>> {
//!         // Receive the next text frame; None when closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), RealtimeError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::RealtimeError;

/// A bidirectional text message transport.
///
/// # Object Safety
///
/// This trait is object-safe; the STOMP link stores a `Box<dyn Transport>`
/// so that any [`Dialer`] can feed it.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportSend`] if the message could not be sent
    /// (e.g., connection broken, write buffer full).
    async fn send(&mut self, message: String) -> Result<(), RealtimeError>;

    /// Receive the next text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete message was received
    /// - `Some(Err(e))`: a transport error occurred (e.g., [`RealtimeError::TransportReceive`])
    /// - `None`: the connection was closed cleanly by the server
    async fn recv(&mut self) -> Option<Result<String, RealtimeError>>;

    /// Close the transport connection gracefully.
    ///
    /// After calling this method, subsequent calls to [`send`](Transport::send) and
    /// [`recv`](Transport::recv) may return errors or `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), RealtimeError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, message: String) -> Result<(), RealtimeError> {
        (**self).send(message).await
    }

    async fn recv(&mut self) -> Option<Result<String, RealtimeError>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<(), RealtimeError> {
        (**self).close().await
    }
}

/// Opens fresh [`Transport`] connections to an endpoint.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Dial `endpoint` and return a connected transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unreachable or rejects the connection.
    async fn dial(&self, endpoint: &str) -> Result<Box<dyn Transport>, RealtimeError>;
}
