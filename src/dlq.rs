//! Dead-letter queue: a chronologically ordered archive of permanently
//! failed background tasks.
//!
//! Entries are scored by failure timestamp in a shared sorted set, with the
//! full record stored alongside in the key-value store. The DLQ is the
//! post-mortem surface: entries keep the raw error, trace, and retry count
//! that the user-facing API deliberately withholds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::{ErrorKind, StoreError};
use crate::store::{KeyValueStore, SortedSetStore};

const SET_KEY: &str = "dlq:index";
const ENTRY_PREFIX: &str = "dlq:entry:";

/// One archived failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task_name: String,
    pub task_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    /// Full diagnostic trace; never surfaced outside the admin surface.
    pub traceback: String,
    pub retry_count: u32,
    /// Queue class the task originally ran on, for re-enqueue.
    pub queue: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub trace_id: String,
    pub failed_at: DateTime<Utc>,
}

/// Filters for `list`; all optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub task_name: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqStatistics {
    pub total: u64,
    pub by_task_name: BTreeMap<String, u64>,
    pub by_error_kind: BTreeMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Re-enqueue hook implemented by the worker runtime; keeps the DLQ free
/// of a direct dependency on queue internals.
#[async_trait::async_trait]
pub trait TaskRequeue: Send + Sync {
    async fn requeue(&self, entry: &DeadLetterEntry) -> Result<(), String>;
}

pub struct DeadLetterQueue {
    sets: Arc<dyn SortedSetStore>,
    kv: Arc<dyn KeyValueStore>,
    retention_days: u32,
}

impl DeadLetterQueue {
    pub fn new(
        sets: Arc<dyn SortedSetStore>,
        kv: Arc<dyn KeyValueStore>,
        retention_days: u32,
    ) -> Self {
        Self {
            sets,
            kv,
            retention_days,
        }
    }

    fn entry_key(task_id: &str) -> String {
        format!("{ENTRY_PREFIX}{task_id}")
    }

    /// Archive a terminal failure. One entry per task id; a repeat add for
    /// the same id overwrites (the latest failure wins).
    #[allow(clippy::too_many_arguments)]
    pub async fn add(
        &self,
        task_name: &str,
        task_id: &str,
        error_kind: ErrorKind,
        error_message: &str,
        traceback: &str,
        retry_count: u32,
        queue: &str,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<DeadLetterEntry, StoreError> {
        let entry = DeadLetterEntry {
            task_name: task_name.to_string(),
            task_id: task_id.to_string(),
            error_kind,
            error_message: error_message.to_string(),
            traceback: traceback.to_string(),
            retry_count,
            queue: queue.to_string(),
            metadata,
            trace_id: Uuid::new_v4().to_string(),
            failed_at: Utc::now(),
        };
        self.kv
            .set(
                &Self::entry_key(task_id),
                serde_json::to_value(&entry)?,
                None,
            )
            .await?;
        self.sets
            .zadd(SET_KEY, task_id, entry.failed_at.timestamp_millis() as f64)
            .await?;
        tracing::warn!(
            task_name,
            task_id,
            kind = %error_kind,
            "task archived to dead-letter queue"
        );
        Ok(entry)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<DeadLetterEntry>, StoreError> {
        match self.kv.get(&Self::entry_key(task_id)).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Entries matching `filter`, oldest first, paged by offset/limit.
    pub async fn list(
        &self,
        filter: &DlqFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let min = filter
            .after
            .map(|t| t.timestamp_millis() as f64)
            .unwrap_or(f64::MIN);
        let max = filter
            .before
            .map(|t| t.timestamp_millis() as f64)
            .unwrap_or(f64::MAX);
        let members = self
            .sets
            .zrange_by_score(SET_KEY, min, max, 0, usize::MAX)
            .await?;

        let mut matched = Vec::new();
        for member in members {
            let Some(entry) = self.get(&member.member).await? else {
                continue;
            };
            if let Some(task_name) = &filter.task_name
                && &entry.task_name != task_name
            {
                continue;
            }
            if let Some(kind) = filter.error_kind
                && entry.error_kind != kind
            {
                continue;
            }
            matched.push(entry);
        }
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    /// Re-enqueue a failed task onto its original queue and drop the entry.
    pub async fn retry(
        &self,
        task_id: &str,
        requeue: &dyn TaskRequeue,
    ) -> Result<DeadLetterEntry, StoreError> {
        let entry = self.get(task_id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "dlq entry",
            id: task_id.to_string(),
        })?;
        requeue
            .requeue(&entry)
            .await
            .map_err(StoreError::Conflict)?;
        self.remove(task_id).await?;
        Ok(entry)
    }

    pub async fn remove(&self, task_id: &str) -> Result<bool, StoreError> {
        let in_set = self.sets.zrem(SET_KEY, task_id).await?;
        let in_kv = self.kv.delete(&Self::entry_key(task_id)).await?;
        Ok(in_set || in_kv)
    }

    pub async fn statistics(&self) -> Result<DlqStatistics, StoreError> {
        let entries = self.list(&DlqFilter::default(), usize::MAX, 0).await?;
        let mut by_task_name: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_error_kind: BTreeMap<String, u64> = BTreeMap::new();
        for entry in &entries {
            *by_task_name.entry(entry.task_name.clone()).or_default() += 1;
            *by_error_kind
                .entry(entry.error_kind.as_str().to_string())
                .or_default() += 1;
        }
        Ok(DlqStatistics {
            total: entries.len() as u64,
            oldest: entries.first().map(|e| e.failed_at),
            newest: entries.last().map(|e| e.failed_at),
            by_task_name,
            by_error_kind,
        })
    }

    /// Drop entries older than `older_than_days` (defaults to the
    /// configured retention). Returns how many were removed.
    pub async fn cleanup(&self, older_than_days: Option<u32>) -> Result<u64, StoreError> {
        let days = older_than_days.unwrap_or(self.retention_days);
        let threshold = Utc::now() - chrono::Duration::days(days as i64);
        let threshold_ms = threshold.timestamp_millis() as f64;

        // Collect victims first so their bodies can be removed too.
        let victims = self
            .sets
            .zrange_by_score(SET_KEY, f64::MIN, threshold_ms, 0, usize::MAX)
            .await?;
        for victim in &victims {
            self.kv.delete(&Self::entry_key(&victim.member)).await?;
        }
        self.sets.zremrange_below(SET_KEY, threshold_ms).await?;
        Ok(victims.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKeyValueStore, MemorySortedSetStore};
    use std::sync::Mutex;

    fn dlq() -> DeadLetterQueue {
        DeadLetterQueue::new(
            Arc::new(MemorySortedSetStore::new()),
            Arc::new(MemoryKeyValueStore::new()),
            30,
        )
    }

    async fn add_entry(dlq: &DeadLetterQueue, task_name: &str, task_id: &str, kind: ErrorKind) {
        dlq.add(
            task_name,
            task_id,
            kind,
            "boom",
            "stage trace",
            3,
            "default",
            BTreeMap::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dlq = dlq();
        add_entry(&dlq, "chapter_generation", "task-1", ErrorKind::StoreError).await;
        let entry = dlq.get("task-1").await.unwrap().unwrap();
        assert_eq!(entry.task_name, "chapter_generation");
        assert_eq!(entry.error_kind, ErrorKind::StoreError);
        assert_eq!(entry.retry_count, 3);
        assert!(!entry.trace_id.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_task_and_kind() {
        let dlq = dlq();
        add_entry(&dlq, "chapter_generation", "t1", ErrorKind::StoreError).await;
        add_entry(&dlq, "embedding", "t2", ErrorKind::ProviderTransient).await;
        add_entry(&dlq, "chapter_generation", "t3", ErrorKind::ProviderTransient).await;

        let all = dlq.list(&DlqFilter::default(), 100, 0).await.unwrap();
        assert_eq!(all.len(), 3);

        let by_task = dlq
            .list(
                &DlqFilter {
                    task_name: Some("chapter_generation".to_string()),
                    ..Default::default()
                },
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(by_task.len(), 2);

        let by_kind = dlq
            .list(
                &DlqFilter {
                    error_kind: Some(ErrorKind::ProviderTransient),
                    ..Default::default()
                },
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(by_kind.len(), 2);

        let combined = dlq
            .list(
                &DlqFilter {
                    task_name: Some("chapter_generation".to_string()),
                    error_kind: Some(ErrorKind::ProviderTransient),
                    ..Default::default()
                },
                100,
                0,
            )
            .await
            .unwrap();
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].task_id, "t3");
    }

    #[tokio::test]
    async fn list_pages_with_offset_and_limit() {
        let dlq = dlq();
        for i in 0..5 {
            add_entry(&dlq, "task", &format!("t{i}"), ErrorKind::StoreError).await;
        }
        let page = dlq.list(&DlqFilter::default(), 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
    }

    struct RecordingRequeue {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl TaskRequeue for RecordingRequeue {
        async fn requeue(&self, entry: &DeadLetterEntry) -> Result<(), String> {
            if self.fail {
                return Err("queue full".to_string());
            }
            self.seen.lock().unwrap().push(entry.task_id.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn retry_requeues_and_removes() {
        let dlq = dlq();
        add_entry(&dlq, "embedding", "t1", ErrorKind::ProviderTransient).await;
        let requeue = RecordingRequeue {
            seen: Mutex::new(vec![]),
            fail: false,
        };
        let entry = dlq.retry("t1", &requeue).await.unwrap();
        assert_eq!(entry.task_id, "t1");
        assert_eq!(*requeue.seen.lock().unwrap(), vec!["t1".to_string()]);
        assert!(dlq.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_requeue_keeps_the_entry() {
        let dlq = dlq();
        add_entry(&dlq, "embedding", "t1", ErrorKind::ProviderTransient).await;
        let requeue = RecordingRequeue {
            seen: Mutex::new(vec![]),
            fail: true,
        };
        assert!(dlq.retry("t1", &requeue).await.is_err());
        assert!(dlq.get("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn statistics_aggregate_by_name_and_kind() {
        let dlq = dlq();
        add_entry(&dlq, "a", "t1", ErrorKind::StoreError).await;
        add_entry(&dlq, "a", "t2", ErrorKind::ProviderTransient).await;
        add_entry(&dlq, "b", "t3", ErrorKind::StoreError).await;
        let stats = dlq.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_task_name["a"], 2);
        assert_eq!(stats.by_error_kind["store_error"], 2);
        assert!(stats.oldest.is_some());
    }

    #[tokio::test]
    async fn cleanup_drops_only_old_entries() {
        let sets = Arc::new(MemorySortedSetStore::new());
        let kv = Arc::new(MemoryKeyValueStore::new());
        let dlq = DeadLetterQueue::new(sets.clone(), kv.clone(), 30);
        add_entry(&dlq, "task", "fresh", ErrorKind::StoreError).await;

        // Plant an entry 40 days in the past.
        let old_time = Utc::now() - chrono::Duration::days(40);
        let mut old = dlq.get("fresh").await.unwrap().unwrap();
        old.task_id = "stale".to_string();
        old.failed_at = old_time;
        kv.set("dlq:entry:stale", serde_json::to_value(&old).unwrap(), None)
            .await
            .unwrap();
        sets.zadd(SET_KEY, "stale", old_time.timestamp_millis() as f64)
            .await
            .unwrap();

        let removed = dlq.cleanup(None).await.unwrap();
        assert_eq!(removed, 1);
        assert!(dlq.get("stale").await.unwrap().is_none());
        assert!(dlq.get("fresh").await.unwrap().is_some());
    }
}
