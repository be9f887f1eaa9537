//! Thin interfaces over the process-external shared stores.
//!
//! Cache entries, circuit-breaker state, checkpoints, and the dead-letter
//! queue all live in shared stores accessed through these traits. Every
//! writer assumes concurrent writers: state transitions use
//! compare-and-swap, the DLQ uses sorted-set operations, and cache and
//! checkpoint writes use set-with-TTL. Nothing in the core holds a mutable
//! singleton beyond a handle to one of these.

pub mod chapters;
pub mod memory;

pub use chapters::ChapterStore;
pub use memory::{MemoryKeyValueStore, MemorySortedSetStore};

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::StoreError;

/// A shared key-value store with TTL and CAS semantics.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a live value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Atomically replace the value only if the current value equals
    /// `expected` (`None` meaning absent). Returns whether the swap won.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&serde_json::Value>,
        new: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`; used for admin listings only.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// One member of a sorted set, scored for chronological ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// A shared sorted-set store; scores are timestamps for the DLQ.
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Add or update a member with the given score.
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, ordered ascending by score,
    /// paged by `offset`/`limit`.
    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    async fn zrem(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove every member with score strictly below `threshold`; returns
    /// how many were removed.
    async fn zremrange_below(&self, set: &str, threshold: f64) -> Result<u64, StoreError>;

    async fn zcard(&self, set: &str) -> Result<u64, StoreError>;
}
