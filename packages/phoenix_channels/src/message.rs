//! The wire envelope carried over the transport.
//!
//! Wire format, one JSON object per text frame:
//!
//! `{ "topic": "room:lobby", "event": "phx_join", "ref": "12", "payload": {...} }`
//!
//! `ref` is a string-encoded integer or `null`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FrameError;

/// Correlation id minted by the socket. Unique per connection until wraparound.
pub type Ref = u64;

/// Loosely-typed payload value. `serde_json::Value` already is the
/// string/number/bool/null/array/object variant type the protocol needs.
pub type Payload = serde_json::Value;

/// Reserved protocol event names.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";

    /// Lifecycle events whose refs must match the channel's current join ref.
    pub(crate) const LIFECYCLE: [&str; 4] = [CLOSE, ERROR, LEAVE, JOIN];
}

/// Topic used for socket-level frames such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Synthetic event name a channel re-dispatches a `phx_reply` under.
pub fn reply_event_name(r: Ref) -> String {
    format!("chan_reply_{r}")
}

/// An immutable `{topic, event, payload, ref}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    topic: String,
    event: String,
    payload: Payload,
    #[serde(rename = "ref", default, with = "wire_ref")]
    ref_id: Option<Ref>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
        ref_id: Option<Ref>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            ref_id,
        }
    }

    /// The periodic keep-alive frame.
    pub fn heartbeat(ref_id: Ref) -> Self {
        Self::new(
            PHOENIX_TOPIC,
            events::HEARTBEAT,
            serde_json::json!({}),
            Some(ref_id),
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn ref_id(&self) -> Option<Ref> {
        self.ref_id
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound text frame.
    ///
    /// `topic` and `event` must be strings and `payload` must be an object.
    /// An unparseable `ref` is read as absent.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let message: Message = serde_json::from_str(text)?;
        if !message.payload.is_object() {
            return Err(FrameError::PayloadNotObject);
        }
        Ok(message)
    }
}

mod wire_ref {
    use super::*;

    pub fn serialize<S: Serializer>(r: &Option<Ref>, serializer: S) -> Result<S::Ok, S::Error> {
        match r {
            Some(r) => serializer.serialize_str(&r.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Ref>, D::Error> {
        let value = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match value {
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            _ => None,
        })
    }
}
