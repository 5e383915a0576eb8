//! Resident decision delivery for the doorman's device.
//!
//! Provides:
//! - [`PersistentStore`] with in-process and file-backed implementations.
//! - [`DecisionSignatureCache`] - bounded, persisted set of notified signatures.
//! - [`DecisionSource`] and its PostgREST implementation [`RestDecisionSource`].
//! - [`BroadcastSource`], the in-process [`BroadcastBus`] and payload parsing.
//! - [`DecisionWatcher`] - merges poll and broadcast into one deduplicated
//!   stream of [`DecisionNotice`]s.

pub mod broadcast;
pub mod cache;
pub mod rest;
pub mod source;
pub mod store;
pub mod watcher;

pub use broadcast::{
    parse_broadcast_payload, BroadcastBus, BroadcastError, BroadcastPayload, BroadcastSource,
};
pub use cache::DecisionSignatureCache;
pub use rest::{RestConfig, RestDecisionSource};
pub use source::{DecisionSource, SourceError};
pub use store::{FileStore, MemoryStore, PersistentStore, StoreError};
pub use watcher::{DecisionNotice, DecisionWatcher, DeliveryPath, WatcherConfig, WatcherError};
