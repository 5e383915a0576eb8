//! Per-building broadcast channel: transport contract and payload parsing.
//!
//! A [`BroadcastSource`] delivers the raw JSON payloads of one named event on
//! one named channel. Payloads for `visitor_decision_update` come in several
//! shapes (see [`parse_broadcast_payload`]).
//!
//! [`BroadcastBus`] is the in-process implementation, backed by
//! `tokio::sync::broadcast`. The WebSocket transport lives in the realtime
//! crate.

use async_trait::async_trait;
use porteiro_core::decision::DecisionRecord;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// Event name carrying resident decisions.
pub const EVENT_DECISION_UPDATE: &str = "visitor_decision_update";

/// Buffer between a transport and its subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Errors from a broadcast transport.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("Broadcast transport closed")]
    Closed,

    #[error("Broadcast transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BroadcastSource: Send + Sync {
    /// Subscribe to `event` on `channel`.
    ///
    /// Payloads arrive on the returned receiver; dropping it closes the
    /// subscription.
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> Result<mpsc::Receiver<Value>, BroadcastError>;
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Interpretation of one `visitor_decision_update` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastPayload {
    /// One or more decision-like records delivered inline.
    Records(Vec<DecisionRecord>),
    /// Only an identifier; the record must be looked up.
    Lookup(String),
    /// Anything else.
    Unrecognised,
}

/// Keys that may carry the identifier of a decision log entry, in priority order.
const LOOKUP_KEYS: &[&str] = &["visitorLogId", "visitor_log_id", "visitorLogID", "id"];

/// Classify a broadcast payload.
///
/// Accepted shapes: an array of records, `{decisions: [...]}`,
/// `{decision: {...}}`, or an object carrying only an identifier under one of
/// `visitorLogId`, `visitor_log_id`, `visitorLogID` or `id`. Array elements
/// that are not objects are skipped.
pub fn parse_broadcast_payload(payload: &Value) -> BroadcastPayload {
    if let Some(items) = payload.as_array() {
        return BroadcastPayload::Records(parse_records(items));
    }

    let Some(object) = payload.as_object() else {
        return BroadcastPayload::Unrecognised;
    };

    if let Some(items) = object.get("decisions").and_then(Value::as_array) {
        return BroadcastPayload::Records(parse_records(items));
    }

    if let Some(decision) = object.get("decision").filter(|d| d.is_object()) {
        return match serde_json::from_value::<DecisionRecord>(decision.clone()) {
            Ok(record) => BroadcastPayload::Records(vec![record]),
            Err(_) => BroadcastPayload::Unrecognised,
        };
    }

    LOOKUP_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .map(BroadcastPayload::Lookup)
        .unwrap_or(BroadcastPayload::Unrecognised)
}

fn parse_records(items: &[Value]) -> Vec<DecisionRecord> {
    items
        .iter()
        .filter(|item| item.is_object())
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// BroadcastBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the in-process bus.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct BusMessage {
    channel: String,
    event: String,
    payload: Value,
}

/// In-process fan-out broadcast channel.
///
/// Any number of subscribers receive every payload published on their
/// channel/event pair. Designed to be shared via `Arc<BroadcastBus>`.
pub struct BroadcastBus {
    sender: broadcast::Sender<BusMessage>,
}

impl BroadcastBus {
    /// When the buffer is full the oldest un-consumed messages are dropped and
    /// slow subscribers skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a payload. Silently dropped when nobody is subscribed.
    pub fn publish(&self, channel: &str, event: &str, payload: Value) {
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            event: event.to_string(),
            payload,
        });
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BroadcastSource for BroadcastBus {
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> Result<mpsc::Receiver<Value>, BroadcastError> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let channel = channel.to_string();
        let event = event.to_string();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    received = receiver.recv() => received,
                };
                match message {
                    Ok(msg) if msg.channel == channel && msg.event == event => {
                        if tx.send(msg.payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, channel = %channel, "Broadcast subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(channel = %channel, "Broadcast subscription closed");
        });

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn array_payload_yields_records() {
        let payload = json!([
            { "id": "1", "status": "approved" },
            "garbage",
            { "id": "2", "status": "rejected" }
        ]);
        assert_matches!(parse_broadcast_payload(&payload), BroadcastPayload::Records(r) if r.len() == 2);
    }

    #[test]
    fn decisions_wrapper_yields_records() {
        let payload = json!({ "decisions": [{ "id": "1" }] });
        assert_matches!(parse_broadcast_payload(&payload), BroadcastPayload::Records(r) if r.len() == 1);
    }

    #[test]
    fn single_decision_wrapper_yields_one_record() {
        let payload = json!({ "decision": { "id": "1", "visitorId": "v1" } });
        assert_matches!(
            parse_broadcast_payload(&payload),
            BroadcastPayload::Records(r) if r[0].visitor_id.as_deref() == Some("v1")
        );
    }

    #[test]
    fn identifier_only_payload_requests_lookup() {
        for key in ["visitorLogId", "visitor_log_id", "visitorLogID", "id"] {
            let payload = json!({ key: "log-7" });
            assert_eq!(
                parse_broadcast_payload(&payload),
                BroadcastPayload::Lookup("log-7".into()),
                "key {key}"
            );
        }
        assert_eq!(
            parse_broadcast_payload(&json!({ "id": 99 })),
            BroadcastPayload::Lookup("99".into())
        );
    }

    #[test]
    fn lookup_key_priority() {
        let payload = json!({ "id": "generic", "visitor_log_id": "specific" });
        assert_eq!(
            parse_broadcast_payload(&payload),
            BroadcastPayload::Lookup("specific".into())
        );
    }

    #[test]
    fn other_shapes_are_unrecognised() {
        for payload in [json!(null), json!("text"), json!(5), json!({}), json!({ "id": "" })] {
            assert_eq!(parse_broadcast_payload(&payload), BroadcastPayload::Unrecognised);
        }
    }

    #[tokio::test]
    async fn bus_routes_by_channel_and_event() {
        let bus = BroadcastBus::default();
        let mut rx = bus.subscribe("porteiro-decisions-b1", EVENT_DECISION_UPDATE).await.unwrap();

        bus.publish("porteiro-decisions-b2", EVENT_DECISION_UPDATE, json!({ "id": "other" }));
        bus.publish("porteiro-decisions-b1", "something_else", json!({ "id": "other" }));
        bus.publish("porteiro-decisions-b1", EVENT_DECISION_UPDATE, json!({ "id": "mine" }));

        let received = rx.recv().await.expect("should receive the payload");
        assert_eq!(received, json!({ "id": "mine" }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = BroadcastBus::default();
        bus.publish("c", "e", json!({}));
    }
}
