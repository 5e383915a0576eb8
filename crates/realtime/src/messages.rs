//! Realtime WebSocket frame types.
//!
//! The realtime server speaks the Phoenix channel protocol: every frame is a
//! JSON object `{"topic", "event", "payload", "ref", "join_ref"}`. Client
//! broadcasts arrive as `event: "broadcast"` with the user event nested in
//! the payload: `{"type": "broadcast", "event": "<name>", "payload": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_BROADCAST: &str = "broadcast";

/// Topic used for heartbeats.
pub const TOPIC_PHOENIX: &str = "phoenix";

/// Realtime topic for a channel name.
pub fn topic_for(channel: &str) -> String {
    format!("realtime:{channel}")
}

/// One Phoenix protocol frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Join `topic` as a broadcast-only subscriber that does not receive
    /// its own messages.
    pub fn join(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false, "ack": false },
                    "presence": { "key": "" }
                }
            }),
            reference: Some(reference.to_string()),
            join_ref: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: TOPIC_PHOENIX.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }
}

/// Server frames the subscriber acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A client broadcast on a joined topic.
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
    /// Reply to a frame we sent.
    Reply {
        topic: String,
        reference: Option<String>,
        ok: bool,
        response: Value,
    },
    /// The server dropped the channel (`phx_error` / `phx_close`).
    ChannelClosed { topic: String, reason: String },
    Other,
}

/// Parse a text frame from the server.
pub fn parse_inbound(text: &str) -> Result<Inbound, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;

    Ok(match frame.event.as_str() {
        EVENT_BROADCAST => {
            let event = frame
                .payload
                .get("event")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let payload = frame
                .payload
                .get("payload")
                .cloned()
                .unwrap_or(Value::Null);
            Inbound::Broadcast {
                topic: frame.topic,
                event,
                payload,
            }
        }
        EVENT_REPLY => Inbound::Reply {
            ok: frame.payload.get("status").and_then(Value::as_str) == Some("ok"),
            response: frame
                .payload
                .get("response")
                .cloned()
                .unwrap_or(Value::Null),
            topic: frame.topic,
            reference: frame.reference,
        },
        EVENT_ERROR | EVENT_CLOSE => Inbound::ChannelClosed {
            topic: frame.topic,
            reason: frame.event,
        },
        _ => Inbound::Other,
    })
}
