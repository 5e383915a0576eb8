//! Set of already-notified decision signatures.
//!
//! [`DecisionSignatureCache`] is the dedup gate between the two delivery
//! paths and the presenter. Membership checks and inserts are purely in
//! memory; [`persist`](DecisionSignatureCache::persist) writes the most
//! recent signatures to a [`PersistentStore`] as a JSON array so a restarted
//! process does not re-announce decisions it already showed.
//!
//! The cache is owned by exactly one watcher and is not meant to be shared
//! between concurrent writers.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use porteiro_core::signature::DecisionSignature;

use crate::store::{PersistentStore, StoreError};

/// Number of signatures retained (in memory and on disk).
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Key the signature list is stored under.
pub const DEFAULT_STORE_KEY: &str = "porteiro_notified_signatures";

pub struct DecisionSignatureCache {
    store: Arc<dyn PersistentStore>,
    key: String,
    capacity: usize,
    seen: HashSet<DecisionSignature>,
    /// Insertion order, oldest first.
    order: VecDeque<DecisionSignature>,
}

impl DecisionSignatureCache {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self::with_capacity(store, DEFAULT_STORE_KEY, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(
        store: Arc<dyn PersistentStore>,
        key: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            store,
            key: key.into(),
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    pub fn has(&self, signature: &DecisionSignature) -> bool {
        self.seen.contains(signature)
    }

    /// Record a signature as notified. Does not persist.
    ///
    /// Returns `false` if it was already present. When the cache is full the
    /// oldest signature is evicted.
    pub fn add(&mut self, signature: DecisionSignature) -> bool {
        if !self.seen.insert(signature.clone()) {
            return false;
        }
        self.order.push_back(signature);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Signatures in insertion order, oldest first.
    pub fn snapshot(&self) -> Vec<DecisionSignature> {
        self.order.iter().cloned().collect()
    }

    /// Write the retained signatures to the store.
    ///
    /// Failures are logged and reported as `false`; the in-memory set stays
    /// authoritative for the rest of the process lifetime.
    pub async fn persist(&self) -> bool {
        match self.try_persist().await {
            Ok(()) => {
                tracing::debug!(count = self.order.len(), key = %self.key, "Signatures persisted");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, key = %self.key, "Failed to persist signatures");
                false
            }
        }
    }

    async fn try_persist(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&self.order)?;
        self.store.save(&self.key, &bytes).await
    }

    /// Seed the cache from the store.
    ///
    /// Any load or decode failure leaves the cache empty rather than
    /// blocking startup. Returns the number of signatures restored.
    pub async fn restore(&mut self) -> usize {
        self.seen.clear();
        self.order.clear();

        let signatures = match self.try_load().await {
            Ok(signatures) => signatures,
            Err(e) => {
                tracing::warn!(error = %e, key = %self.key, "Failed to restore signatures, starting empty");
                return 0;
            }
        };

        for signature in signatures {
            self.add(signature);
        }
        tracing::info!(count = self.order.len(), key = %self.key, "Signatures restored");
        self.order.len()
    }

    async fn try_load(&self) -> Result<Vec<DecisionSignature>, StoreError> {
        match self.store.load(&self.key).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn sig(n: usize) -> DecisionSignature {
        DecisionSignature::from(format!("v{n}_approved_u1_{n}"))
    }

    struct BrokenStore;

    #[async_trait]
    impl PersistentStore for BrokenStore {
        async fn load(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(std::io::Error::other("disk on fire").into())
        }

        async fn save(&self, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(std::io::Error::other("disk on fire").into())
        }
    }

    #[test]
    fn add_then_has() {
        let mut cache = DecisionSignatureCache::new(Arc::new(MemoryStore::new()));
        assert!(!cache.has(&sig(1)));
        assert!(cache.add(sig(1)));
        assert!(cache.has(&sig(1)));
        assert!(!cache.add(sig(1)), "second insert is a no-op");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn persisted_list_keeps_most_recent_hundred() {
        let store = Arc::new(MemoryStore::new());
        let mut cache = DecisionSignatureCache::new(store.clone());

        for n in 0..150 {
            cache.add(sig(n));
        }
        assert!(cache.persist().await);

        let bytes = store.load(DEFAULT_STORE_KEY).await.unwrap().unwrap();
        let persisted: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        let expected: Vec<String> = (50..150).map(|n| sig(n).into_inner()).collect();
        assert_eq!(persisted, expected);

        assert!(!cache.has(&sig(49)), "oldest entries are evicted first");
        assert!(cache.has(&sig(50)));
    }

    #[tokio::test]
    async fn restore_seeds_from_store() {
        let store = Arc::new(MemoryStore::new());
        store
            .save(DEFAULT_STORE_KEY, br#"["a_approved_u1_1","b_rejected_u2_2"]"#)
            .await
            .unwrap();

        let mut cache = DecisionSignatureCache::new(store);
        assert_eq!(cache.restore().await, 2);
        assert!(cache.has(&DecisionSignature::from("a_approved_u1_1".to_string())));
        assert!(cache.has(&DecisionSignature::from("b_rejected_u2_2".to_string())));
    }

    #[tokio::test]
    async fn restore_truncates_to_capacity() {
        let store = Arc::new(MemoryStore::new());
        let list: Vec<String> = (0..10).map(|n| sig(n).into_inner()).collect();
        store
            .save("k", &serde_json::to_vec(&list).unwrap())
            .await
            .unwrap();

        let mut cache = DecisionSignatureCache::with_capacity(store, "k", 3);
        assert_eq!(cache.restore().await, 3);
        assert_eq!(cache.snapshot(), vec![sig(7), sig(8), sig(9)]);
    }

    #[tokio::test]
    async fn corrupt_store_restores_empty() {
        let store = Arc::new(MemoryStore::new());
        store.save(DEFAULT_STORE_KEY, b"not json").await.unwrap();

        let mut cache = DecisionSignatureCache::new(store);
        assert_eq!(cache.restore().await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn store_failures_are_not_fatal() {
        let mut cache = DecisionSignatureCache::new(Arc::new(BrokenStore));
        assert_eq!(cache.restore().await, 0);

        cache.add(sig(1));
        assert!(!cache.persist().await);
        assert!(cache.has(&sig(1)), "in-memory set stays authoritative");
    }
}
