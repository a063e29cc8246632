//! # BBTronic Realtime
//!
//! Realtime channel of the BBTronic party-game client: one shared broker
//! connection that every session screen subscribes through.
//!
//! The crate keeps a single STOMP-over-WebSocket link open to the backend and
//! multiplexes per-session topics (`/topic/{sessionCode}`) over it. Messages
//! are JSON objects discriminated by an `event` field.
//!
//! ## Features
//!
//! - **One channel**: [`ConnectionManager`] owns the link; concurrent
//!   `connect` calls share one attempt
//! - **Self-healing**: unexpected drops trigger exponential-backoff
//!   reconnection and replay of every durable subscription
//! - **Layered**: the manager drives a [`Link`], the STOMP [`stomp`] layer
//!   drives a [`Transport`]; any layer can be swapped
//! - **WebSocket built-in**: default `transport-websocket` feature provides
//!   `WebSocketTransport` and `WebSocketDialer`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bbtronic_realtime::events::{EventRouter, GAME_STARTED};
//! use bbtronic_realtime::{ConnectionManager, ManagerConfig};
//!
//! let manager = ConnectionManager::websocket(ManagerConfig::from_env());
//! manager.connect().await?;
//!
//! let router = EventRouter::new()
//!     .on(GAME_STARTED, |msg| println!("game started: {:?}", msg.fields))
//!     .on_creator_left(|farewell| println!("session over: {farewell:?}"));
//! manager.subscribe("ABC123", router)?;
//!
//! manager.send("ABC123", "userUpdate", serde_json::json!({ "userId": 42 }))?;
//! ```

pub mod error;
pub mod events;
pub mod handler;
pub mod link;
pub mod manager;
pub mod message;
pub mod signal;
pub mod stomp;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use error::{RealtimeError, Result};
pub use events::EventRouter;
pub use handler::{hook_fns, MessageHandler, RecoveryHook};
pub use link::{Connector, FrameSink, Link, LinkSubscription};
pub use manager::{ChannelHandle, ConnectionManager, ConnectionState, ManagerConfig};
pub use message::TopicMessage;
pub use signal::EnvironmentSignal;
pub use stomp::{StompConfig, StompConnector, StompLink};
pub use transport::{Dialer, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketDialer, WebSocketTransport};
