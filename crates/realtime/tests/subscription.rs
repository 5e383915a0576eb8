//! End-to-end tests for `RealtimeClient` against a local WebSocket server.
//!
//! The server side is a bare `tokio-tungstenite` acceptor that plays the
//! realtime protocol by hand: it reads the join frame, replies, and pushes
//! broadcast frames.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use porteiro_events::BroadcastSource;
use porteiro_realtime::messages::Frame;
use porteiro_realtime::{RealtimeClient, RealtimeConfig, ReconnectConfig};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const CHANNEL: &str = "porteiro-decisions-b1";
const TOPIC: &str = "realtime:porteiro-decisions-b1";
const EVENT: &str = "visitor_decision_update";
const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fake server helpers
// ---------------------------------------------------------------------------

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("client should connect")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Next text frame from the client, skipping heartbeats.
async fn read_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("client should send a frame")
            .expect("stream open")
            .unwrap();
        if let Message::Text(text) = msg {
            let frame: Frame = serde_json::from_str(&text).unwrap();
            if frame.event != "heartbeat" {
                return frame;
            }
        }
    }
}

async fn send(ws: &mut WebSocketStream<TcpStream>, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn reply_ok(ws: &mut WebSocketStream<TcpStream>, join: &Frame) {
    send(
        ws,
        json!({
            "topic": join.topic,
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": join.reference,
        }),
    )
    .await;
}

async fn broadcast(ws: &mut WebSocketStream<TcpStream>, topic: &str, event: &str, payload: Value) {
    send(
        ws,
        json!({
            "topic": topic,
            "event": "broadcast",
            "payload": { "type": "broadcast", "event": event, "payload": payload },
            "ref": null,
        }),
    )
    .await;
}

fn client_for(listener: &TcpListener) -> RealtimeClient {
    let addr = listener.local_addr().unwrap();
    let mut config = RealtimeConfig::new(format!("http://{addr}"), "anon-key");
    config.access_token = Some("user-jwt".into());
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
    };
    RealtimeClient::new(config)
}

// ---------------------------------------------------------------------------
// Test: join, then only matching broadcasts are forwarded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn joins_topic_and_forwards_matching_broadcasts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let mut rx = client.subscribe(CHANNEL, EVENT).await.unwrap();

    let mut ws = accept(&listener).await;
    let join = read_frame(&mut ws).await;
    assert_eq!(join.topic, TOPIC);
    assert_eq!(join.event, "phx_join");
    assert_eq!(join.payload["config"]["broadcast"]["self"], false);
    assert_eq!(join.payload["access_token"], "user-jwt");
    reply_ok(&mut ws, &join).await;

    broadcast(&mut ws, TOPIC, "some_other_event", json!({ "id": "ignored" })).await;
    broadcast(&mut ws, "realtime:elsewhere", EVENT, json!({ "id": "ignored" })).await;
    broadcast(&mut ws, TOPIC, EVENT, json!({ "visitorLogId": "log-1" })).await;

    let payload = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload, json!({ "visitorLogId": "log-1" }));

    client.shutdown();
}

// ---------------------------------------------------------------------------
// Test: a dropped socket is reconnected and the topic rejoined
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejoins_after_connection_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let mut rx = client.subscribe(CHANNEL, EVENT).await.unwrap();

    let mut first = accept(&listener).await;
    let join = read_frame(&mut first).await;
    reply_ok(&mut first, &join).await;
    drop(first);

    let mut second = accept(&listener).await;
    let rejoin = read_frame(&mut second).await;
    assert_eq!(rejoin.event, "phx_join");
    assert_eq!(rejoin.topic, TOPIC);
    reply_ok(&mut second, &rejoin).await;

    broadcast(&mut second, TOPIC, EVENT, json!([{ "id": "after-reconnect" }])).await;
    let payload = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(payload[0]["id"], "after-reconnect");

    client.shutdown();
}

// ---------------------------------------------------------------------------
// Test: dropping the receiver leaves the channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dropping_receiver_leaves_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let rx = client.subscribe(CHANNEL, EVENT).await.unwrap();

    let mut ws = accept(&listener).await;
    let join = read_frame(&mut ws).await;
    reply_ok(&mut ws, &join).await;

    drop(rx);

    let leave = read_frame(&mut ws).await;
    assert_eq!(leave.event, "phx_leave");
    assert_eq!(leave.topic, TOPIC);
}

// ---------------------------------------------------------------------------
// Test: shutdown ends the subscription stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_closes_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = client_for(&listener);
    let mut rx = client.subscribe(CHANNEL, EVENT).await.unwrap();

    let mut ws = accept(&listener).await;
    let join = read_frame(&mut ws).await;
    reply_ok(&mut ws, &join).await;

    client.shutdown();
    let end = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert!(end.is_none());
}
