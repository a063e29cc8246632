//! The publish/subscribe link contract the connection manager drives.
//!
//! A [`Connector`] opens a [`Link`]: one established session with the broker
//! that multiplexes many destinations. The manager never looks below this
//! layer, so the STOMP implementation in [`crate::stomp`] can be swapped for a
//! test double or another broker protocol without touching the reconnection
//! and replay logic.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Receives the raw body of every frame delivered to one subscription.
///
/// Called on the link's receive task, in arrival order, never concurrently
/// for the same subscription.
pub type FrameSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Opens links to the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new link to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be dialed or the broker
    /// rejects the session.
    async fn open(&self, endpoint: &str) -> Result<Box<dyn Link>>;
}

/// One established broker session.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Start delivering frames published on `path` to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailed`](crate::RealtimeError::SendFailed) if the link is closed.
    fn subscribe(&self, path: &str, sink: FrameSink) -> Result<Box<dyn LinkSubscription>>;

    /// Publish `body` to `path`. Fire-and-forget: no acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`SendFailed`](crate::RealtimeError::SendFailed) if the link is closed.
    fn publish(&self, path: &str, body: String) -> Result<()>;

    /// `true` once the link is gone, for whatever reason.
    fn is_closed(&self) -> bool;

    /// Resolves once the link is gone. Returns immediately if it already is.
    async fn closed(&self);

    /// Close the session and wait for the broker to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful close fails; the link is considered
    /// closed either way.
    async fn close(&self) -> Result<()>;
}

/// A live subscription on a [`Link`].
pub trait LinkSubscription: Send + Sync {
    /// Stop delivery. The handle is consumed.
    fn cancel(self: Box<Self>);
}
