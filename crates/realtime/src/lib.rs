//! Realtime broadcast transport.
//!
//! Connects to the realtime server over WebSocket, joins per-building
//! channel topics and forwards their broadcasts to the decision watcher.
//! Dropped connections are retried with exponential backoff and the channel
//! is rejoined on every new socket.

pub mod client;
pub mod messages;
pub mod reconnect;

pub use client::{RealtimeClient, RealtimeConfig, RealtimeConnection, RealtimeError};
pub use reconnect::ReconnectConfig;
