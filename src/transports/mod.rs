//! Transport implementations for the realtime channel.
//!
//! This module provides concrete [`Transport`](crate::Transport) and
//! [`Dialer`](crate::Dialer) implementations behind feature gates. Enable the
//! corresponding Cargo feature to pull in a transport:
//!
//! | Feature                | Transport              | Dialer              |
//! |------------------------|------------------------|---------------------|
//! | `transport-websocket`  | [`WebSocketTransport`] | [`WebSocketDialer`] |

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketDialer, WebSocketTransport};
