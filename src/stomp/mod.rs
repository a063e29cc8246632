//! STOMP 1.2 broker link.
//!
//! The BBTronic backend exposes a STOMP broker relay behind its `/websocket`
//! endpoint; session topics are plain `/topic/{code}` destinations.

pub mod frame;
mod link;

pub use frame::{Command, Frame, FrameReader, MAX_FRAME_BYTES};
pub use link::{StompConfig, StompConnector, StompLink};
