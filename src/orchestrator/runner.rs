//! The stage loop: drives one chapter through the fourteen stages.
//!
//! Per-stage contract: consult the checkpoint (skip completed stages),
//! emit `stage_start`, run the body under the cancellation token and
//! deadline, persist payload + advanced stage atomically, mark the
//! checkpoint with {cost, duration, provider}, emit `stage_complete`.
//! Recoverable failures retry with exponential backoff; exhaustion marks
//! the chapter failed and archives a DLQ entry (cancellations and
//! provider-unavailable excepted).

use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::errors::StageError;
use crate::model::{Chapter, ChapterStatus, StageId};
use crate::progress::ProgressEvent;

use super::bodies::execute_stage;
use super::context::{StageContext, StageDeps};

/// Task name under which chapter failures are archived.
const TASK_NAME: &str = "chapter_generation";

pub struct ChapterRunner {
    deps: Arc<StageDeps>,
}

impl ChapterRunner {
    pub fn new(deps: Arc<StageDeps>) -> Self {
        Self { deps }
    }

    fn checkpoint_for(&self, chapter_id: Uuid) -> Checkpoint {
        Checkpoint::new(
            self.deps.kv.clone(),
            format!("chapter:{chapter_id}"),
            self.deps.config.checkpoint.ttl_days,
        )
    }

    /// Run a chapter to a terminal state. Resumable: completed stages are
    /// skipped via the checkpoint, and a previously failed chapter
    /// continues from its recorded stage.
    pub async fn run(&self, chapter_id: Uuid, cancel: CancellationToken) -> Result<(), StageError> {
        use tracing::Instrument;
        let span = tracing::info_span!("chapter_run", chapter_id = %chapter_id);
        self.run_inner(chapter_id, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        chapter_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), StageError> {
        let mut chapter = self
            .deps
            .with_store(|store| store.get_chapter(chapter_id))?
            .ok_or(StageError::Store(crate::errors::StoreError::NotFound {
                entity: "chapter",
                id: chapter_id.to_string(),
            }))?;
        // A re-run of a failed chapter resumes from its recorded stage.
        chapter.status = ChapterStatus::InProgress;
        chapter.failure_kind = None;
        chapter.failure_message = None;

        let checkpoint = self.checkpoint_for(chapter_id);
        let ctx = StageContext {
            deps: &self.deps,
            cancel: &cancel,
            checkpoint: &checkpoint,
        };

        for stage in StageId::ALL {
            let completed = checkpoint.is_step_complete(stage.as_str()).await?;
            if completed && chapter.payload(stage).is_some() {
                tracing::debug!(stage = %stage, "stage already complete, skipping");
                continue;
            }

            if let Err(err) = self.run_stage(stage, &mut chapter, &ctx).await {
                self.fail_chapter(&mut chapter, stage, &err).await;
                return Err(err);
            }
        }

        self.deps
            .progress
            .publish(ProgressEvent::chapter_complete(chapter.id, chapter.version));
        tracing::info!(version = chapter.version, "chapter completed");
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: StageId,
        chapter: &mut Chapter,
        ctx: &StageContext<'_>,
    ) -> Result<(), StageError> {
        let pipeline = &self.deps.config.pipeline;
        // Input validation never retries: a bad topic stays bad.
        let max_attempts = match stage {
            StageId::InputValid => 1,
            _ => pipeline.stage_max_attempts.max(1),
        };

        self.deps
            .progress
            .publish(ProgressEvent::stage_start(chapter.id, stage));
        tracing::info!(stage = %stage, "stage started");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = tokio::select! {
                _ = ctx.cancel.cancelled() => Err(StageError::Cancelled),
                output = execute_stage(stage, chapter, ctx) => output,
            };

            match result {
                Ok(output) => {
                    let duration_ms = started.elapsed().as_millis() as u64;
                    chapter.total_cost_usd += output.cost_usd;
                    chapter.stage_payloads.insert(stage, output.payload);
                    if let Some(next) = stage.next() {
                        chapter.current_stage = next;
                    }
                    // Payload and stage advance land in one write.
                    self.deps.with_store(|store| store.save_chapter(chapter))?;

                    let mut metadata = BTreeMap::new();
                    metadata.insert("cost_usd".to_string(), serde_json::json!(output.cost_usd));
                    metadata.insert("duration_ms".to_string(), serde_json::json!(duration_ms));
                    if let Some(provider) = &output.provider {
                        metadata.insert("provider".to_string(), serde_json::json!(provider));
                    }
                    ctx.checkpoint
                        .mark_step_complete(stage.as_str(), Some(metadata))
                        .await?;

                    self.deps.progress.publish(ProgressEvent::stage_complete(
                        chapter.id,
                        stage,
                        serde_json::json!({
                            "cost_usd": output.cost_usd,
                            "duration_ms": duration_ms,
                        }),
                    ));
                    tracing::info!(stage = %stage, attempt, duration_ms, "stage completed");
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = stage_backoff(
                        pipeline.stage_backoff_base_ms,
                        pipeline.stage_backoff_cap_ms,
                        attempt,
                    );
                    tracing::warn!(
                        stage = %stage,
                        attempt,
                        ?backoff,
                        error = %err,
                        "stage failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    tracing::error!(stage = %stage, attempt, error = %err, "stage failed terminally");
                    return Err(err);
                }
            }
        }
    }

    async fn fail_chapter(&self, chapter: &mut Chapter, stage: StageId, err: &StageError) {
        chapter.status = ChapterStatus::Failed;
        chapter.failure_kind = Some(err.kind());
        chapter.failure_message = Some(err.user_message());
        // current_stage stays where it was so a later retry resumes here.
        if let Err(persist_err) = self.deps.with_store(|store| store.save_chapter(chapter)) {
            tracing::error!(error = %persist_err, "failed to persist chapter failure");
        }

        if err.goes_to_dlq() {
            let mut metadata = BTreeMap::new();
            metadata.insert("stage".to_string(), serde_json::json!(stage.as_str()));
            metadata.insert("topic".to_string(), serde_json::json!(chapter.topic));
            if let Err(dlq_err) = self
                .deps
                .dlq
                .add(
                    TASK_NAME,
                    &chapter.id.to_string(),
                    err.kind(),
                    &err.user_message(),
                    &format!("{err:?}"),
                    self.deps.config.pipeline.stage_max_attempts,
                    "default",
                    metadata,
                )
                .await
            {
                tracing::error!(
                    error = %dlq_err,
                    "failed to archive terminal failure to the dead-letter queue"
                );
            }
        }

        self.deps.progress.publish(ProgressEvent::chapter_failed(
            chapter.id,
            err.kind(),
            &err.user_message(),
        ));
    }
}

/// Exponential backoff with jitter: base × 2^(attempt−1), capped.
fn stage_backoff(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(cap_ms);
    let jitter = rand::rng().random_range(0..=capped / 4 + 1);
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        for _ in 0..10 {
            assert!(stage_backoff(1000, 30_000, 1) >= Duration::from_millis(1000));
            assert!(stage_backoff(1000, 30_000, 1) <= Duration::from_millis(1251));
            assert!(stage_backoff(1000, 30_000, 2) >= Duration::from_millis(2000));
            let capped = stage_backoff(1000, 30_000, 10);
            assert!(capped >= Duration::from_millis(30_000));
            assert!(capped <= Duration::from_millis(37_501));
        }
    }
}
