//! Retry schedule for re-establishing a dropped realtime socket.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{RealtimeClient, RealtimeConnection};

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the wait between retries.
    pub max_delay: Duration,
    /// Growth factor applied after each failed retry.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay that follows `current`, never above `max_delay`.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let scaled = current.as_secs_f64() * config.multiplier.max(1.0);
    Duration::try_from_secs_f64(scaled)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

/// Endless sequence of retry delays: `initial_delay`, then growing by
/// `multiplier` up to `max_delay`.
pub struct Backoff<'a> {
    config: &'a ReconnectConfig,
    next: Duration,
}

impl<'a> Backoff<'a> {
    pub fn new(config: &'a ReconnectConfig) -> Self {
        Self {
            config,
            next: config.initial_delay.min(config.max_delay),
        }
    }
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = next_delay(current, self.config);
        Some(current)
    }
}

/// Retry `client.connect()` on the backoff schedule until it succeeds.
///
/// Every attempt is preceded by its delay, so a socket that just dropped is
/// not hammered. Returns `None` once `cancel` fires.
pub async fn reconnect_loop(
    client: &RealtimeClient,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<RealtimeConnection> {
    for (attempt, delay) in (1u32..).zip(Backoff::new(config)) {
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before realtime reconnect");
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = client.connect() => result,
        };
        match result {
            Ok(conn) => {
                tracing::info!(attempt, "Realtime socket re-established");
                return Some(conn);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "Realtime reconnect failed");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RealtimeConfig;

    fn secs(delays: impl Iterator<Item = Duration>) -> Vec<u64> {
        delays.map(|d| d.as_secs()).collect()
    }

    #[test]
    fn default_schedule_caps_at_thirty_seconds() {
        let config = ReconnectConfig::default();
        assert_eq!(secs(Backoff::new(&config).take(8)), [1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn multiplier_below_one_never_shrinks() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(5),
            multiplier: 0.5,
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(5), &config), Duration::from_secs(5));
    }

    #[test]
    fn initial_delay_above_cap_is_clamped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(10),
            multiplier: 3.0,
        };
        assert_eq!(secs(Backoff::new(&config).take(2)), [10, 10]);
    }

    #[tokio::test]
    async fn cancelled_token_returns_none() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = RealtimeClient::new(RealtimeConfig::new("http://127.0.0.1:9", "anon"));
        assert!(reconnect_loop(&client, &ReconnectConfig::default(), &cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_wait_returns_none() {
        let cancel = CancellationToken::new();
        let client = RealtimeClient::new(RealtimeConfig::new("http://127.0.0.1:9", "anon"));
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(60),
            ..Default::default()
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        assert!(reconnect_loop(&client, &config, &cancel).await.is_none());
    }
}
