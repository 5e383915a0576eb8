//! WebSocket client for the realtime broadcast server.
//!
//! [`RealtimeClient`] holds the connection settings. Every
//! [`subscribe`](BroadcastSource::subscribe) call spawns one subscription
//! task that owns its own socket: connect, join the channel topic, forward
//! matching broadcasts, heartbeat, and rejoin after reconnecting. The task
//! ends when the subscriber drops its receiver or the client is shut down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use porteiro_events::broadcast::{BroadcastError, BroadcastSource, SUBSCRIPTION_BUFFER};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::messages::{parse_inbound, topic_for, Frame, Inbound};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for the realtime server.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project base URL (`https://...`) or a `ws(s)://` URL.
    pub url: String,
    /// Public API key, sent as the `apikey` query parameter.
    pub api_key: String,
    /// User access token, sent in the join payload when present.
    pub access_token: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl RealtimeConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Full WebSocket endpoint, e.g.
    /// `wss://xyz.supabase.co/realtime/v1/websocket?apikey=...&vsn=1.0.0`.
    pub fn socket_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!(
            "{base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.api_key
        )
    }
}

/// A live WebSocket connection to the realtime server.
pub struct RealtimeConnection {
    pub ws_stream: WsStream,
}

/// Errors that can occur when working with the realtime socket.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client has been shut down.
    #[error("Realtime client closed")]
    Closed,
}

#[derive(Clone)]
pub struct RealtimeClient {
    config: Arc<RealtimeConfig>,
    /// Parent of every subscription's token.
    cancel: CancellationToken,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Open one WebSocket connection.
    pub async fn connect(&self) -> Result<RealtimeConnection, RealtimeError> {
        if self.cancel.is_cancelled() {
            return Err(RealtimeError::Closed);
        }
        let url = self.config.socket_url();
        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            RealtimeError::Connection(format!(
                "Failed to connect to realtime server at {}: {e}",
                self.config.url
            ))
        })?;

        tracing::info!(url = %self.config.url, "Connected to realtime server");
        Ok(RealtimeConnection { ws_stream })
    }

    /// Close every subscription opened through this client.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BroadcastSource for RealtimeClient {
    async fn subscribe(
        &self,
        channel: &str,
        event: &str,
    ) -> Result<mpsc::Receiver<Value>, BroadcastError> {
        if self.cancel.is_cancelled() {
            return Err(BroadcastError::Closed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(run_subscription(
            self.clone(),
            topic_for(channel),
            event.to_string(),
            tx,
            self.cancel.child_token(),
        ));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Subscription task
// ---------------------------------------------------------------------------

enum SessionEnd {
    /// Subscriber gone or client shut down.
    Finished,
    /// Socket or channel lost; reconnect.
    Dropped(String),
}

/// Core subscription loop: connect -> join -> forward -> reconnect.
async fn run_subscription(
    client: RealtimeClient,
    topic: String,
    event: String,
    tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
) {
    let first = tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tx.closed() => return,
        result = client.connect() => result,
    };
    let mut pending = match first {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "Connection failed, entering reconnect loop");
            None
        }
    };

    loop {
        let conn = match pending.take() {
            Some(conn) => conn,
            None => {
                let reconnected = tokio::select! {
                    _ = tx.closed() => None,
                    conn = reconnect_loop(&client, &client.config.reconnect, &cancel) => conn,
                };
                match reconnected {
                    Some(conn) => conn,
                    None => break,
                }
            }
        };

        match run_session(&client.config, conn.ws_stream, &topic, &event, &tx, &cancel).await {
            SessionEnd::Finished => break,
            SessionEnd::Dropped(reason) => {
                tracing::warn!(topic = %topic, reason = %reason, "Realtime connection lost, entering reconnect loop");
            }
        }
    }
    tracing::info!(topic = %topic, "Realtime subscription closed");
}

#[derive(Default)]
struct RefCounter(u64);

impl RefCounter {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

/// Join `topic` and forward its `event` broadcasts until the socket drops.
async fn run_session(
    config: &RealtimeConfig,
    mut ws: WsStream,
    topic: &str,
    event: &str,
    tx: &mpsc::Sender<Value>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let mut refs = RefCounter::default();
    let join_ref = refs.next();
    let mut join = Frame::join(topic, &join_ref);
    if let Some(token) = &config.access_token {
        join.payload["access_token"] = json!(token);
    }
    if let Err(e) = send_frame(&mut ws, &join).await {
        return SessionEnd::Dropped(e.to_string());
    }

    let mut heartbeat = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                leave(&mut ws, topic, &refs.next()).await;
                return SessionEnd::Finished;
            }
            _ = tx.closed() => {
                leave(&mut ws, topic, &refs.next()).await;
                return SessionEnd::Finished;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = send_frame(&mut ws, &Frame::heartbeat(&refs.next())).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            message = ws.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(format!("closed by server: {frame:?}"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".into()),
                };

                match parse_inbound(&text) {
                    Ok(Inbound::Broadcast { topic: t, event: e, payload }) if t == topic && e == event => {
                        tracing::trace!(topic, payload = %payload, "Realtime broadcast received");
                        if tx.send(payload).await.is_err() {
                            leave(&mut ws, topic, &refs.next()).await;
                            return SessionEnd::Finished;
                        }
                    }
                    Ok(Inbound::Reply { reference, ok, response, .. })
                        if reference.as_deref() == Some(join_ref.as_str()) =>
                    {
                        if !ok {
                            return SessionEnd::Dropped(format!("join rejected: {response}"));
                        }
                        tracing::info!(topic, "Joined realtime channel");
                    }
                    Ok(Inbound::ChannelClosed { topic: t, reason }) if t == topic => {
                        return SessionEnd::Dropped(reason);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(topic, error = %e, "Ignoring malformed realtime frame");
                    }
                }
            }
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<(), RealtimeError> {
    let text = serde_json::to_string(frame).map_err(|e| RealtimeError::Protocol(e.to_string()))?;
    ws.send(Message::Text(text))
        .await
        .map_err(|e| RealtimeError::Connection(e.to_string()))
}

/// Best-effort leave and close.
async fn leave(ws: &mut WsStream, topic: &str, reference: &str) {
    if let Err(e) = send_frame(ws, &Frame::leave(topic, reference)).await {
        tracing::debug!(topic, error = %e, "Failed to send leave frame");
    }
    let _ = ws.close(None).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn socket_url_maps_http_schemes() {
        let config = RealtimeConfig::new("https://xyz.supabase.co/", "anon");
        assert_eq!(
            config.socket_url(),
            "wss://xyz.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );

        let config = RealtimeConfig::new("http://127.0.0.1:4000", "k");
        assert!(config.socket_url().starts_with("ws://127.0.0.1:4000/realtime/v1/websocket"));

        let config = RealtimeConfig::new("ws://host", "k");
        assert!(config.socket_url().starts_with("ws://host/realtime"));
    }

    #[test]
    fn defaults() {
        let config = RealtimeConfig::new("http://h", "k");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.access_token.is_none());
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let client = RealtimeClient::new(RealtimeConfig::new("http://127.0.0.1:9", "k"));
        client.shutdown();
        assert_matches!(client.subscribe("c", "e").await, Err(BroadcastError::Closed));
    }
}
