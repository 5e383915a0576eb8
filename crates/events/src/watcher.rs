//! Decision watcher: merges the poll path and the broadcast path into one
//! deduplicated stream of resident decisions for a single building.
//!
//! While running, the watcher owns three tasks:
//!
//! - the **poll task** queries [`DecisionSource::decisions_since`] on a fixed
//!   interval and advances its query window after every successful query;
//! - the **broadcast task** drains the building's broadcast subscription,
//!   resolving identifier-only payloads with a point lookup;
//! - the **gate task** is the single consumer of both. It owns the
//!   [`DecisionSignatureCache`], filters scope and completeness, drops
//!   duplicates and forwards fresh [`DecisionNotice`]s to the caller.
//!
//! The poll checkpoint is committed only once a polled batch has been fully
//! forwarded, and it outlives the run: a restart (for instance after a
//! session expiry) polls from the last committed checkpoint, so decisions
//! made while the watcher was halted are still picked up.
//!
//! All three stop on one [`CancellationToken`]. Once [`DecisionWatcher::stop`]
//! returns, no further notice is sent.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use porteiro_core::decision::{Decision, DecisionRecord};
use porteiro_core::signature::DecisionSignature;
use porteiro_core::types::{EntityId, Timestamp};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{
    parse_broadcast_payload, BroadcastPayload, BroadcastSource, EVENT_DECISION_UPDATE,
};
use crate::cache::{DecisionSignatureCache, DEFAULT_CACHE_CAPACITY, DEFAULT_STORE_KEY};
use crate::source::{DecisionSource, SourceError};
use crate::store::PersistentStore;

/// How long `stop()` waits for each task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer between the producers and the gate.
const BATCH_BUFFER: usize = 32;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay between two polls. The first poll runs immediately on start.
    pub poll_interval: Duration,
    /// Signatures retained in the dedup cache.
    pub cache_capacity: usize,
    /// Broadcast channel name is `<channel_prefix><building_id>`.
    pub channel_prefix: String,
    /// Broadcast event carrying decisions.
    pub event: String,
    /// Key the cache is persisted under.
    pub store_key: String,
    /// Prefix of the display name used when a resident name is unknown.
    pub name_fallback_prefix: String,
    /// Capacity of the notice stream returned by `start()`.
    pub notice_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            channel_prefix: "porteiro-decisions-".to_string(),
            event: EVENT_DECISION_UPDATE.to_string(),
            store_key: DEFAULT_STORE_KEY.to_string(),
            name_fallback_prefix: "Resident".to_string(),
            notice_buffer: 64,
        }
    }
}

impl WatcherConfig {
    pub fn channel_for(&self, building_id: &str) -> String {
        format!("{}{building_id}", self.channel_prefix)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Which path delivered a decision first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPath {
    Poll,
    Broadcast,
}

impl DeliveryPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decision to present, emitted exactly once per signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionNotice {
    pub decision: Decision,
    pub signature: DecisionSignature,
    /// Display name of the responding resident.
    pub resident_name: String,
    pub path: DeliveryPath,
}

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Decision watcher is already running for building {0}")]
    AlreadyRunning(String),
}

/// Invoked once when the backend reports expired authorization.
pub type SessionExpiredHandler = Arc<dyn Fn(&SourceError) + Send + Sync>;

// ---------------------------------------------------------------------------
// DecisionWatcher
// ---------------------------------------------------------------------------

pub struct DecisionWatcher {
    config: WatcherConfig,
    source: Arc<dyn DecisionSource>,
    broadcast: Arc<dyn BroadcastSource>,
    store: Arc<dyn PersistentStore>,
    on_session_expired: Option<SessionExpiredHandler>,
    /// Held between runs; moved into the gate task while running.
    cache: Option<DecisionSignatureCache>,
    /// Last committed poll checkpoint. `None` until the first start.
    watermark: Option<Timestamp>,
    running: Option<Running>,
}

struct Running {
    building_id: String,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    poller: JoinHandle<()>,
    broadcaster: Option<JoinHandle<()>>,
    gate: JoinHandle<DecisionSignatureCache>,
}

/// State shared by the tasks of one run.
struct Shared {
    building_id: String,
    source: Arc<dyn DecisionSource>,
    on_session_expired: Option<SessionExpiredHandler>,
    expired: AtomicBool,
    cancel: CancellationToken,
    /// Poll checkpoint whose results have all been forwarded.
    committed: Mutex<Timestamp>,
}

impl Shared {
    fn committed(&self) -> Timestamp {
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, checkpoint: Timestamp) {
        let mut committed = self.committed.lock().unwrap_or_else(PoisonError::into_inner);
        if checkpoint > *committed {
            *committed = checkpoint;
        }
    }

    /// Surface an expired session once and halt every task of this run.
    fn escalate(&self, error: &SourceError) {
        if !self.expired.swap(true, Ordering::SeqCst) {
            tracing::info!(
                building_id = %self.building_id,
                error = %error,
                "Session expired, halting decision watcher",
            );
            if let Some(handler) = &self.on_session_expired {
                handler(error);
            }
        }
        self.cancel.cancel();
    }
}

struct Batch {
    path: DeliveryPath,
    records: Vec<DecisionRecord>,
    /// Poll checkpoint to commit once every record has been handled.
    checkpoint: Option<Timestamp>,
}

impl DecisionWatcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn DecisionSource>,
        broadcast: Arc<dyn BroadcastSource>,
        store: Arc<dyn PersistentStore>,
    ) -> Self {
        Self {
            config,
            source,
            broadcast,
            store,
            on_session_expired: None,
            cache: None,
            watermark: None,
            running: None,
        }
    }

    /// Register the callback fired when the backend rejects the session.
    pub fn with_session_expired<F>(mut self, handler: F) -> Self
    where
        F: Fn(&SourceError) + Send + Sync + 'static,
    {
        self.on_session_expired = Some(Arc::new(handler));
        self
    }

    /// Poll checkpoint the next run starts from, once a run has started.
    pub fn watermark(&self) -> Option<Timestamp> {
        self.watermark
    }

    /// `true` between `start()` and either `stop()` or a session expiry.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.cancel.is_cancelled())
    }

    /// Start watching `building_id`.
    ///
    /// Restores the signature cache on first start, subscribes to the
    /// building's broadcast channel and begins polling from the last
    /// committed watermark (the current time on first start). A failed
    /// subscription is logged and the watcher continues on the poll path
    /// alone. The returned stream ends when the watcher stops.
    pub async fn start(
        &mut self,
        building_id: impl Into<String>,
    ) -> Result<mpsc::Receiver<DecisionNotice>, WatcherError> {
        if let Some(running) = &self.running {
            if !running.cancel.is_cancelled() {
                return Err(WatcherError::AlreadyRunning(running.building_id.clone()));
            }
            // Halted by a session expiry; collect the finished tasks first.
            self.stop().await;
        }

        let building_id = building_id.into();
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => {
                let mut cache = DecisionSignatureCache::with_capacity(
                    self.store.clone(),
                    self.config.store_key.clone(),
                    self.config.cache_capacity,
                );
                cache.restore().await;
                cache
            }
        };

        let watermark = *self.watermark.get_or_insert_with(Utc::now);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            building_id: building_id.clone(),
            source: self.source.clone(),
            on_session_expired: self.on_session_expired.clone(),
            expired: AtomicBool::new(false),
            cancel: cancel.clone(),
            committed: Mutex::new(watermark),
        });

        let (batch_tx, batch_rx) = mpsc::channel(BATCH_BUFFER);
        let (notice_tx, notice_rx) = mpsc::channel(self.config.notice_buffer.max(1));

        let channel = self.config.channel_for(&building_id);
        let broadcaster = match self.broadcast.subscribe(&channel, &self.config.event).await {
            Ok(payloads) => Some(tokio::spawn(broadcast_loop(
                shared.clone(),
                payloads,
                batch_tx.clone(),
            ))),
            Err(e) => {
                tracing::warn!(
                    building_id = %building_id,
                    channel = %channel,
                    error = %e,
                    "Broadcast subscription failed, continuing with polling only",
                );
                None
            }
        };

        let poller = tokio::spawn(poll_loop(
            shared.clone(),
            self.config.poll_interval,
            watermark,
            batch_tx,
        ));

        let gate = tokio::spawn(gate_loop(
            shared.clone(),
            cache,
            batch_rx,
            notice_tx,
            self.config.name_fallback_prefix.clone(),
        ));

        tracing::info!(
            building_id = %building_id,
            channel = %channel,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            watermark = %watermark,
            "Decision watcher started",
        );

        self.running = Some(Running {
            building_id,
            cancel,
            shared,
            poller,
            broadcaster,
            gate,
        });
        Ok(notice_rx)
    }

    /// Stop polling, close the subscription and wait for the tasks to exit.
    ///
    /// Idempotent. When this returns no further notice will be sent and the
    /// stream returned by `start()` ends once drained. Notices already
    /// buffered in it are still delivered: their signatures are recorded as
    /// notified, so the consumer should present them rather than discard
    /// them.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();

        if let Some(mut handle) = running.broadcaster {
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!(building_id = %running.building_id, "Broadcast task did not stop in time, aborting");
                handle.abort();
            }
        }

        let mut poller = running.poller;
        if tokio::time::timeout(STOP_TIMEOUT, &mut poller).await.is_err() {
            tracing::warn!(building_id = %running.building_id, "Poll task did not stop in time, aborting");
            poller.abort();
        }

        let mut gate = running.gate;
        match tokio::time::timeout(STOP_TIMEOUT, &mut gate).await {
            Ok(Ok(cache)) => self.cache = Some(cache),
            Ok(Err(e)) => {
                tracing::error!(building_id = %running.building_id, error = %e, "Decision gate task failed");
            }
            Err(_) => {
                tracing::warn!(building_id = %running.building_id, "Decision gate did not stop in time, aborting");
                gate.abort();
            }
        }

        self.watermark = Some(running.shared.committed());
        tracing::info!(
            building_id = %running.building_id,
            watermark = ?self.watermark,
            "Decision watcher stopped",
        );
    }
}

impl Drop for DecisionWatcher {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Producers
// ---------------------------------------------------------------------------

async fn poll_loop(
    shared: Arc<Shared>,
    poll_interval: Duration,
    mut watermark: Timestamp,
    batches: mpsc::Sender<Batch>,
) {
    let cancel = shared.cancel.clone();
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let checked_at = Utc::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = shared.source.decisions_since(&shared.building_id, watermark) => result,
        };

        let records = match result {
            Ok(records) => records,
            Err(e) if e.is_session_expired() => {
                shared.escalate(&e);
                break;
            }
            Err(e) => {
                tracing::error!(
                    building_id = %shared.building_id,
                    error = %e,
                    "Decision poll failed",
                );
                continue;
            }
        };

        // The query window moves on now; the checkpoint is committed by the
        // gate once the batch is forwarded. The dedup cache absorbs overlap.
        watermark = checked_at;
        tracing::debug!(
            building_id = %shared.building_id,
            count = records.len(),
            checkpoint = %watermark,
            "Decision poll completed",
        );

        if records.is_empty() {
            shared.commit(checked_at);
            continue;
        }
        let batch = Batch {
            path: DeliveryPath::Poll,
            records,
            checkpoint: Some(checked_at),
        };
        if !forward(&cancel, &batches, batch).await {
            break;
        }
    }
    tracing::debug!(building_id = %shared.building_id, "Poll task exited");
}

async fn broadcast_loop(
    shared: Arc<Shared>,
    mut payloads: mpsc::Receiver<Value>,
    batches: mpsc::Sender<Batch>,
) {
    let cancel = shared.cancel.clone();

    loop {
        let payload = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            payload = payloads.recv() => match payload {
                Some(payload) => payload,
                None => {
                    tracing::warn!(building_id = %shared.building_id, "Broadcast subscription closed");
                    break;
                }
            },
        };

        let records = match parse_broadcast_payload(&payload) {
            BroadcastPayload::Records(records) => records,
            BroadcastPayload::Lookup(id) => {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = shared.source.decision_by_id(&shared.building_id, &id) => result,
                };
                match result {
                    Ok(Some(record)) => vec![record],
                    Ok(None) => {
                        tracing::info!(
                            building_id = %shared.building_id,
                            visitor_log_id = %id,
                            "Broadcast referenced an unknown decision, dropping",
                        );
                        continue;
                    }
                    Err(e) if e.is_session_expired() => {
                        shared.escalate(&e);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            building_id = %shared.building_id,
                            visitor_log_id = %id,
                            error = %e,
                            "Decision lookup failed",
                        );
                        continue;
                    }
                }
            }
            BroadcastPayload::Unrecognised => {
                tracing::warn!(
                    building_id = %shared.building_id,
                    payload = %payload,
                    "Ignoring unrecognised broadcast payload",
                );
                continue;
            }
        };

        if records.is_empty() {
            continue;
        }
        let batch = Batch {
            path: DeliveryPath::Broadcast,
            records,
            checkpoint: None,
        };
        if !forward(&cancel, &batches, batch).await {
            break;
        }
    }
    tracing::debug!(building_id = %shared.building_id, "Broadcast task exited");
}

/// Hand a batch to the gate. Returns `false` once the run is over.
async fn forward(cancel: &CancellationToken, batches: &mpsc::Sender<Batch>, batch: Batch) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = batches.send(batch) => sent.is_ok(),
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

async fn gate_loop(
    shared: Arc<Shared>,
    mut cache: DecisionSignatureCache,
    mut batches: mpsc::Receiver<Batch>,
    notices: mpsc::Sender<DecisionNotice>,
    fallback_prefix: String,
) -> DecisionSignatureCache {
    let cancel = shared.cancel.clone();

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        let checkpoint = batch.checkpoint;
        if !process_batch(&shared, &mut cache, batch, &notices, &fallback_prefix).await {
            break;
        }
        if let Some(checkpoint) = checkpoint {
            shared.commit(checkpoint);
        }
    }
    cache
}

/// Filter, dedup and forward one batch in arrival order.
///
/// Returns `false` when the run is over (cancelled or the caller dropped the
/// stream).
async fn process_batch(
    shared: &Shared,
    cache: &mut DecisionSignatureCache,
    batch: Batch,
    notices: &mpsc::Sender<DecisionNotice>,
    fallback_prefix: &str,
) -> bool {
    let building_id = shared.building_id.as_str();
    let path = batch.path;
    let received = batch.records.len();

    let mut in_batch = HashSet::new();
    let mut fresh = Vec::new();

    for record in batch.records {
        if !record.belongs_to(building_id) {
            tracing::debug!(
                building_id,
                record_id = ?record.id,
                record_building = ?record.building_id(),
                "Dropping decision outside building scope",
            );
            continue;
        }

        let decision = match record.into_decision() {
            Ok(decision) => decision,
            Err(reason) => {
                tracing::debug!(building_id, reason = %reason, "Dropping incomplete decision");
                continue;
            }
        };

        let signature = decision.signature();
        if cache.has(&signature) || !in_batch.insert(signature.clone()) {
            tracing::debug!(building_id, signature = %signature, path = %path, "Duplicate decision suppressed");
            continue;
        }
        fresh.push((decision, signature));
    }

    if fresh.is_empty() {
        return true;
    }

    let names = resolve_names(shared, &fresh).await;

    let mut open = true;
    let mut forwarded = 0usize;
    for (decision, signature) in fresh {
        let resident_name = names
            .get(&decision.responded_by)
            .cloned()
            .unwrap_or_else(|| fallback_name(fallback_prefix, &decision.responded_by));

        let notice = DecisionNotice {
            decision,
            signature: signature.clone(),
            resident_name,
            path,
        };

        let sent = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => false,
            sent = notices.send(notice) => sent.is_ok(),
        };
        if !sent {
            open = false;
            break;
        }

        tracing::info!(building_id, signature = %signature, path = %path, "Decision notified");
        cache.add(signature);
        forwarded += 1;
    }

    if forwarded > 0 {
        cache.persist().await;
    }
    tracing::debug!(building_id, path = %path, received, forwarded, "Decision batch processed");
    open
}

/// Look up display names for the responders of a batch.
///
/// Failures degrade to an empty map; callers fall back per id.
async fn resolve_names(
    shared: &Shared,
    fresh: &[(Decision, DecisionSignature)],
) -> HashMap<EntityId, String> {
    let mut ids: Vec<EntityId> = fresh.iter().map(|(d, _)| d.responded_by.clone()).collect();
    ids.sort();
    ids.dedup();

    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => return HashMap::new(),
        result = shared.source.resident_names(&ids) => result,
    };

    match result {
        Ok(names) => names,
        Err(e) if e.is_session_expired() => {
            shared.escalate(&e);
            HashMap::new()
        }
        Err(e) => {
            tracing::warn!(building_id = %shared.building_id, error = %e, "Resident name lookup failed");
            HashMap::new()
        }
    }
}

/// `"<prefix> <first 8 chars of id>"`.
pub fn fallback_name(prefix: &str, resident_id: &str) -> String {
    let short: String = resident_id.chars().take(8).collect();
    format!("{prefix} {short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_channel_naming() {
        let config = WatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.channel_for("b1"), "porteiro-decisions-b1");
        assert_eq!(config.event, "visitor_decision_update");
    }

    #[test]
    fn fallback_name_uses_first_eight_chars() {
        assert_eq!(
            fallback_name("Resident", "3f2a9c1e-77aa-4c1b"),
            "Resident 3f2a9c1e"
        );
        assert_eq!(fallback_name("Morador", "u1"), "Morador u1");
    }

    #[test]
    fn delivery_path_display() {
        assert_eq!(DeliveryPath::Poll.to_string(), "poll");
        assert_eq!(DeliveryPath::Broadcast.to_string(), "broadcast");
    }
}
