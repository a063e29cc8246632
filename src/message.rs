//! The JSON message shape carried on session topics.
//!
//! Every frame on `/topic/{sessionCode}` is a flat JSON object with an `event`
//! discriminator and arbitrary sibling fields:
//!
//! ```json
//! { "event": "userUpdate", "users": [{ "username": "ana", "ready": true }] }
//! ```
//!
//! The connection manager treats everything except `event` as opaque.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RealtimeError, Result};

/// Destination prefix shared by inbound and outbound session frames.
pub const TOPIC_PREFIX: &str = "/topic/";

/// Build the broker destination for a session code.
pub fn topic_path(topic_key: &str) -> String {
    format!("{TOPIC_PREFIX}{topic_key}")
}

/// One parsed topic frame: `{ "event": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    /// Event name, e.g. `"gameStarted"`.
    pub event: String,
    /// All other top-level fields of the frame.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TopicMessage {
    /// Create a message with no extra fields.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            fields: Map::new(),
        }
    }

    /// Build a message from an event name and a payload object.
    ///
    /// `payload` must be a JSON object (its fields are merged next to `event`)
    /// or `null` for no extra fields. An `event` key inside the payload is
    /// ignored; the explicit event name always wins.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidPayload`] for any other JSON value.
    pub fn with_payload(event: impl Into<String>, payload: Value) -> Result<Self> {
        let mut fields = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(RealtimeError::InvalidPayload),
        };
        fields.remove("event");
        Ok(Self {
            event: event.into(),
            fields,
        })
    }

    /// Add one field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a string field by name.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Parse a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::MalformedFrame`] if the body is not a JSON
    /// object with a string `event` field. Subscriptions log and drop such
    /// frames, so a valid JSON object without `event` (or with a non-string
    /// one) never reaches a [`MessageHandler`](crate::MessageHandler).
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| RealtimeError::MalformedFrame(e.to_string()))
    }

    /// Serialize to the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Serialization`] if a field cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
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
    use super::*;
    use serde_json::json;

    #[test]
    fn fields_are_flattened_next_to_event() {
        let msg = TopicMessage::with_payload("userLeft", json!({ "username": "ana" })).unwrap();
        let wire: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(wire, json!({ "event": "userLeft", "username": "ana" }));
    }

    #[test]
    fn null_payload_means_no_fields() {
        let msg = TopicMessage::with_payload("gameStarted", Value::Null).unwrap();
        assert!(msg.fields.is_empty());
        assert_eq!(msg.to_json().unwrap(), r#"{"event":"gameStarted"}"#);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let err = TopicMessage::with_payload("x", json!([1, 2])).unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidPayload));
    }

    #[test]
    fn payload_cannot_override_event_name() {
        let msg = TopicMessage::with_payload("real", json!({ "event": "fake", "n": 1 })).unwrap();
        assert_eq!(msg.event, "real");
        assert_eq!(msg.get("n"), Some(&json!(1)));
        assert!(msg.get("event").is_none());
    }

    #[test]
    fn parse_collects_unknown_fields() {
        let msg = TopicMessage::parse(
            r#"{"event":"creatorLeft","message":"host left","extra":{"a":1}}"#,
        )
        .unwrap();
        assert_eq!(msg.event, "creatorLeft");
        assert_eq!(msg.get_str("message"), Some("host left"));
        assert_eq!(msg.get("extra"), Some(&json!({ "a": 1 })));
    }

    #[test]
    fn parse_rejects_missing_event() {
        let err = TopicMessage::parse(r#"{"users":[]}"#).unwrap_err();
        assert!(matches!(err, RealtimeError::MalformedFrame(_)));
    }

    #[test]
    fn parse_rejects_non_string_event() {
        for body in [r#"{"event":7}"#, r#"{"event":null}"#, r#"{"event":{"name":"x"}}"#] {
            assert!(
                matches!(TopicMessage::parse(body), Err(RealtimeError::MalformedFrame(_))),
                "{body} should be rejected"
            );
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            TopicMessage::parse("not json"),
            Err(RealtimeError::MalformedFrame(_))
        ));
        assert!(matches!(
            TopicMessage::parse("[]"),
            Err(RealtimeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn topic_path_prefixes_session_code() {
        assert_eq!(topic_path("ABC123"), "/topic/ABC123");
    }
}
