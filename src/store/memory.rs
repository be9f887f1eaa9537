//! In-memory shared-store implementations.
//!
//! Used in single-node `serve` mode and by every test. The maps are
//! concurrent; expiry is checked lazily on read so no sweeper task is
//! required for correctness.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::time::{Duration, Instant};

use super::{KeyValueStore, ScoredMember, SortedSetStore};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Concurrent key-value map with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries eagerly. Tests use this to assert TTL behavior;
    /// production reads do not depend on it.
    pub fn sweep(&self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            Some(_) => {
                drop(self.entries.remove(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&serde_json::Value>,
        new: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let new_entry = Entry {
            value: new,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = !current.is_expired();
                let matches = match (live, expected) {
                    (true, Some(exp)) => &current.value == exp,
                    (true, None) => false,
                    (false, None) => true,
                    (false, Some(_)) => false,
                };
                if matches {
                    occupied.insert(new_entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(new_entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired() && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Concurrent sorted sets; members sort ascending by score with the member
/// string as tiebreaker for deterministic paging.
#[derive(Default)]
pub struct MemorySortedSetStore {
    sets: DashMap<String, DashMap<String, f64>>,
}

impl MemorySortedSetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SortedSetStore for MemorySortedSetStore {
    async fn zadd(&self, set: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        set: &str,
        min: f64,
        max: f64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        let Some(members) = self.sets.get(set) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<ScoredMember> = members
            .iter()
            .filter(|entry| *entry.value() >= min && *entry.value() <= max)
            .map(|entry| ScoredMember {
                member: entry.key().clone(),
                score: *entry.value(),
            })
            .collect();
        matched.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn zrem(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .get(set)
            .is_some_and(|members| members.remove(member).is_some()))
    }

    async fn zremrange_below(&self, set: &str, threshold: f64) -> Result<u64, StoreError> {
        let Some(members) = self.sets.get(set) else {
            return Ok(0);
        };
        let before = members.len() as u64;
        members.retain(|_, score| *score >= threshold);
        Ok(before - members.len() as u64)
    }

    async fn zcard(&self, set: &str) -> Result<u64, StoreError> {
        Ok(self.sets.get(set).map(|m| m.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryKeyValueStore::new();
        store
            .set("k1", serde_json::json!({"a": 1}), None)
            .await
            .unwrap();
        assert_eq!(
            store.get("k1").await.unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
        assert!(store.delete("k1").await.unwrap());
        assert_eq!(store.get("k1").await.unwrap(), None);
        assert!(!store.delete("k1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryKeyValueStore::new();
        store
            .set("soon", serde_json::json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("soon").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_succeeds_only_against_expected_value() {
        let store = MemoryKeyValueStore::new();
        // Create-if-absent.
        assert!(
            store
                .compare_and_swap("state", None, serde_json::json!("closed"), None)
                .await
                .unwrap()
        );
        // Wrong expectation loses.
        assert!(
            !store
                .compare_and_swap(
                    "state",
                    Some(&serde_json::json!("open")),
                    serde_json::json!("half_open"),
                    None
                )
                .await
                .unwrap()
        );
        // Right expectation wins.
        assert!(
            store
                .compare_and_swap(
                    "state",
                    Some(&serde_json::json!("closed")),
                    serde_json::json!("open"),
                    None
                )
                .await
                .unwrap()
        );
        assert_eq!(
            store.get("state").await.unwrap(),
            Some(serde_json::json!("open"))
        );
    }

    #[tokio::test]
    async fn cas_create_fails_when_key_exists() {
        let store = MemoryKeyValueStore::new();
        store.set("k", serde_json::json!(1), None).await.unwrap();
        assert!(
            !store
                .compare_and_swap("k", None, serde_json::json!(2), None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn keys_with_prefix_excludes_expired() {
        let store = MemoryKeyValueStore::new();
        store
            .set("cp:task-1:a", serde_json::json!(1), None)
            .await
            .unwrap();
        store
            .set(
                "cp:task-1:b",
                serde_json::json!(2),
                Some(Duration::from_millis(5)),
            )
            .await
            .unwrap();
        store
            .set("other:x", serde_json::json!(3), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let keys = store.keys_with_prefix("cp:task-1:").await.unwrap();
        assert_eq!(keys, vec!["cp:task-1:a".to_string()]);
    }

    #[tokio::test]
    async fn sorted_set_ranges_page_in_score_order() {
        let store = MemorySortedSetStore::new();
        store.zadd("dlq", "c", 30.0).await.unwrap();
        store.zadd("dlq", "a", 10.0).await.unwrap();
        store.zadd("dlq", "b", 20.0).await.unwrap();

        let all = store
            .zrange_by_score("dlq", f64::MIN, f64::MAX, 0, 10)
            .await
            .unwrap();
        let members: Vec<&str> = all.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(members, vec!["a", "b", "c"]);

        let page = store
            .zrange_by_score("dlq", f64::MIN, f64::MAX, 1, 1)
            .await
            .unwrap();
        assert_eq!(page[0].member, "b");

        let bounded = store
            .zrange_by_score("dlq", 15.0, 25.0, 0, 10)
            .await
            .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].member, "b");
    }

    #[tokio::test]
    async fn zremrange_below_trims_old_members() {
        let store = MemorySortedSetStore::new();
        store.zadd("dlq", "old", 5.0).await.unwrap();
        store.zadd("dlq", "new", 50.0).await.unwrap();
        let removed = store.zremrange_below("dlq", 10.0).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.zcard("dlq").await.unwrap(), 1);
        assert!(store.zrem("dlq", "new").await.unwrap());
        assert!(!store.zrem("dlq", "new").await.unwrap());
    }
}
