//! Dispatch of session topic messages by event name.
//!
//! Every frame on a session topic carries an `event` discriminator. The
//! backend publishes a handful of well-known ones; [`EventRouter`] maps them
//! (and any application-defined ones) to callbacks.
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use bbtronic_realtime::events::{EventRouter, GAME_STARTED};
//! use bbtronic_realtime::{MessageHandler, TopicMessage};
//!
//! let started = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&started);
//! let router = EventRouter::new()
//!     .on(GAME_STARTED, move |_msg| flag.store(true, Ordering::SeqCst));
//!
//! router.on_message(TopicMessage::new(GAME_STARTED));
//! assert!(started.load(Ordering::SeqCst));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::handler::MessageHandler;
use crate::message::TopicMessage;

/// The session creator left; the session is over for everyone.
pub const CREATOR_LEFT: &str = "creatorLeft";
/// A participant left the session.
pub const USER_LEFT: &str = "userLeft";
/// A participant's profile or score changed.
pub const USER_UPDATE: &str = "userUpdate";
/// The creator started the game.
pub const GAME_STARTED: &str = "gameStarted";

type Callback = Arc<dyn Fn(TopicMessage) + Send + Sync>;
type TerminationCallback = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// A [`MessageHandler`] that routes each message by its `event` field.
///
/// * `creatorLeft` goes to the [`on_creator_left`](Self::on_creator_left)
///   callback with the optional `message` field, and to nothing else.
/// * Any other event goes to the callback registered with [`on`](Self::on).
/// * Events nobody registered for are logged and handed to
///   [`on_unhandled`](Self::on_unhandled), if set.
#[derive(Clone, Default)]
pub struct EventRouter {
    routes: HashMap<String, Callback>,
    creator_left: Option<TerminationCallback>,
    unhandled: Option<Callback>,
}

impl EventRouter {
    /// An empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `event` to `callback`, replacing any earlier route for it.
    #[must_use]
    pub fn on<F>(mut self, event: impl Into<String>, callback: F) -> Self
    where
        F: Fn(TopicMessage) + Send + Sync + 'static,
    {
        self.routes.insert(event.into(), Arc::new(callback));
        self
    }

    /// Called when the session creator leaves, with the backend's optional
    /// farewell text.
    #[must_use]
    pub fn on_creator_left<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<String>) + Send + Sync + 'static,
    {
        self.creator_left = Some(Arc::new(callback));
        self
    }

    /// Called for events without a route.
    #[must_use]
    pub fn on_unhandled<F>(mut self, callback: F) -> Self
    where
        F: Fn(TopicMessage) + Send + Sync + 'static,
    {
        self.unhandled = Some(Arc::new(callback));
        self
    }

    /// `true` if a route is registered for `event`.
    pub fn handles(&self, event: &str) -> bool {
        if event == CREATOR_LEFT {
            return self.creator_left.is_some();
        }
        self.routes.contains_key(event)
    }
}

impl MessageHandler for EventRouter {
    fn on_message(&self, message: TopicMessage) {
        if message.event == CREATOR_LEFT {
            let farewell = message.get_str("message").map(str::to_owned);
            debug!(farewell = farewell.as_deref(), "session creator left");
            match &self.creator_left {
                Some(callback) => callback(farewell),
                None => warn!("session creator left but no termination callback is set"),
            }
            return;
        }

        if let Some(route) = self.routes.get(&message.event) {
            route(message);
            return;
        }

        warn!(event = %message.event, "no route for session event");
        if let Some(unhandled) = &self.unhandled {
            unhandled(message);
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut events: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        events.sort_unstable();
        f.debug_struct("EventRouter")
            .field("events", &events)
            .field("creator_left", &self.creator_left.is_some())
            .field("unhandled", &self.unhandled.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make_log = Arc::clone(&log);
        let make = move |tag: &str| -> Callback {
            let log = Arc::clone(&make_log);
            let tag = tag.to_string();
            Arc::new(move |msg: TopicMessage| {
                log.lock().unwrap().push(format!("{tag}:{}", msg.event));
            })
        };
        (log, make)
    }

    #[test]
    fn creator_left_short_circuits_other_routes() {
        let (log, make) = recorder();
        let farewell = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&farewell);
        let on_route = make("route");
        let on_unhandled = make("unhandled");

        let router = EventRouter::new()
            .on(CREATOR_LEFT, move |m| on_route(m))
            .on_unhandled(move |m| on_unhandled(m))
            .on_creator_left(move |text| *seen.lock().unwrap() = Some(text));

        let msg = TopicMessage::new(CREATOR_LEFT).with_field("message", json!("bye"));
        router.on_message(msg);

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(*farewell.lock().unwrap(), Some(Some("bye".to_string())));
    }

    #[test]
    fn creator_left_without_message_passes_none() {
        let farewell = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&farewell);
        let router =
            EventRouter::new().on_creator_left(move |text| *seen.lock().unwrap() = Some(text));

        router.on_message(TopicMessage::new(CREATOR_LEFT));
        assert_eq!(*farewell.lock().unwrap(), Some(None));
    }

    #[test]
    fn routes_by_event_name() {
        let (log, make) = recorder();
        let user_left = make("left");
        let user_update = make("update");
        let router = EventRouter::new()
            .on(USER_LEFT, move |m| user_left(m))
            .on(USER_UPDATE, move |m| user_update(m));

        router.on_message(TopicMessage::new(USER_UPDATE));
        router.on_message(TopicMessage::new(USER_LEFT));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["update:userUpdate".to_string(), "left:userLeft".to_string()]
        );
    }

    #[test]
    fn unknown_events_reach_unhandled() {
        let (log, make) = recorder();
        let on_unhandled = make("unhandled");
        let router = EventRouter::new()
            .on(GAME_STARTED, |_| {})
            .on_unhandled(move |m| on_unhandled(m));

        router.on_message(TopicMessage::new("scoreboard"));
        assert_eq!(*log.lock().unwrap(), vec!["unhandled:scoreboard".to_string()]);
    }

    #[test]
    fn unknown_events_without_fallback_are_dropped() {
        let router = EventRouter::new();
        router.on_message(TopicMessage::new("whatever"));
    }

    #[test]
    fn later_route_replaces_earlier() {
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        let router = EventRouter::new()
            .on(GAME_STARTED, move |m| first(m))
            .on(GAME_STARTED, move |m| second(m));

        router.on_message(TopicMessage::new(GAME_STARTED));
        assert_eq!(*log.lock().unwrap(), vec!["second:gameStarted".to_string()]);
    }

    #[test]
    fn handles_reports_routes() {
        let router = EventRouter::new().on(USER_UPDATE, |_| {});
        assert!(router.handles(USER_UPDATE));
        assert!(!router.handles(USER_LEFT));
        assert!(!router.handles(CREATOR_LEFT));
        assert!(EventRouter::new()
            .on_creator_left(|_| {})
            .handles(CREATOR_LEFT));
    }

    #[test]
    fn debug_lists_sorted_events() {
        let router = EventRouter::new()
            .on(USER_UPDATE, |_| {})
            .on(GAME_STARTED, |_| {});
        let out = format!("{router:?}");
        assert!(out.contains(r#"events: ["gameStarted", "userUpdate"]"#));
    }
}
