//! Per-task checkpoints: let long multi-step background work skip steps
//! that already completed on a previous attempt.
//!
//! Records live in the shared key-value store under a per-task-id scope
//! with a TTL (default 7 days); the store garbage-collects expired records.
//! Both the chapter orchestrator (per-stage and per-section) and the
//! document ingestion pipeline (per-phase) run inside a checkpoint scope.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::StoreError;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "checkpoint:";

/// A completed step's record: when it finished plus small free-form
/// metadata (cost, duration, provider used).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub completed_at: chrono::DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Progress summary for operator surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointProgress {
    pub completed: usize,
    pub total: Option<usize>,
    pub percentage: Option<f64>,
}

/// Handle scoped to one task id.
#[derive(Clone)]
pub struct Checkpoint {
    store: Arc<dyn KeyValueStore>,
    task_id: String,
    ttl: Duration,
}

impl Checkpoint {
    pub fn new(store: Arc<dyn KeyValueStore>, task_id: impl Into<String>, ttl_days: u32) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            ttl: Duration::from_secs(ttl_days as u64 * 24 * 60 * 60),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn step_key(&self, step: &str) -> String {
        format!("{KEY_PREFIX}{}:{}", self.task_id, step)
    }

    fn scope_prefix(&self) -> String {
        format!("{KEY_PREFIX}{}:", self.task_id)
    }

    pub async fn mark_step_complete(
        &self,
        step: &str,
        metadata: Option<BTreeMap<String, serde_json::Value>>,
    ) -> Result<(), StoreError> {
        let record = StepRecord {
            completed_at: Utc::now(),
            metadata: metadata.unwrap_or_default(),
        };
        self.store
            .set(
                &self.step_key(step),
                serde_json::to_value(&record)?,
                Some(self.ttl),
            )
            .await
    }

    pub async fn is_step_complete(&self, step: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(&self.step_key(step)).await?.is_some())
    }

    pub async fn get_step_metadata(
        &self,
        step: &str,
    ) -> Result<Option<BTreeMap<String, serde_json::Value>>, StoreError> {
        match self.store.get(&self.step_key(step)).await? {
            Some(value) => {
                let record: StepRecord = serde_json::from_value(value)?;
                Ok(Some(record.metadata))
            }
            None => Ok(None),
        }
    }

    /// Completed step names, sorted for reproducibility.
    pub async fn get_completed_steps(&self) -> Result<Vec<String>, StoreError> {
        let prefix = self.scope_prefix();
        let keys = self.store.keys_with_prefix(&prefix).await?;
        Ok(keys
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect())
    }

    pub async fn get_progress(
        &self,
        total: Option<usize>,
    ) -> Result<CheckpointProgress, StoreError> {
        let completed = self.get_completed_steps().await?.len();
        let percentage = total
            .filter(|t| *t > 0)
            .map(|t| (completed as f64 / t as f64) * 100.0);
        Ok(CheckpointProgress {
            completed,
            total,
            percentage,
        })
    }

    /// Remove every step record for this task.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for key in self.store.keys_with_prefix(&self.scope_prefix()).await? {
            self.store.delete(&key).await?;
        }
        Ok(())
    }
}
