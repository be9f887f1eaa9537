//! External-query response cache over the shared key-value store.
//!
//! Keys are deterministic hashes of provider id + query + parameters, so
//! identical requests from any worker hit the same entry. Entries expire
//! after the configured TTL (default 7 days).

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::StoreError;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "qcache:";

pub struct QueryCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl_days: u32) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(ttl_days as u64 * 24 * 60 * 60),
        }
    }

    /// Deterministic cache key for a provider query.
    pub fn key(provider_id: &str, query: &str, params: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(query.as_bytes());
        hasher.update([0u8]);
        hasher.update(params.to_string().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{KEY_PREFIX}{hex}")
    }

    pub async fn get(
        &self,
        provider_id: &str,
        query: &str,
        params: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.store
            .get(&Self::key(provider_id, query, params))
            .await
    }

    pub async fn put(
        &self,
        provider_id: &str,
        query: &str,
        params: &serde_json::Value,
        response: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store
            .set(&Self::key(provider_id, query, params), response, Some(self.ttl))
            .await
    }
}
