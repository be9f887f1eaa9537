//! The worker runtime proper: queues, consumers, and the execution wrapper.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{QueueClass, TaskSpec};
use crate::checkpoint::Checkpoint;
use crate::config::WorkerConfig;
use crate::dlq::{DeadLetterEntry, DeadLetterQueue, TaskRequeue};
use crate::errors::{StageError, WorkerError};
use crate::store::KeyValueStore;

/// Everything a handler gets besides the task itself.
pub struct TaskContext {
    /// Checkpoint scoped to the task id; handlers skip completed steps.
    pub checkpoint: Checkpoint,
    pub cancel: CancellationToken,
}

/// One registered task implementation, keyed by task name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<(), StageError>;
}

struct QueueState {
    tx: mpsc::UnboundedSender<TaskSpec>,
    depth: Arc<AtomicUsize>,
}

pub struct WorkerRuntime {
    handlers: Arc<HashMap<String, Arc<dyn TaskHandler>>>,
    queues: HashMap<QueueClass, QueueState>,
    config: WorkerConfig,
    cancel: CancellationToken,
    consumers: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Build the runtime and start its consumers.
    pub fn start(
        handlers: HashMap<String, Arc<dyn TaskHandler>>,
        kv: Arc<dyn KeyValueStore>,
        dlq: Arc<DeadLetterQueue>,
        config: WorkerConfig,
        checkpoint_ttl_days: u32,
    ) -> Self {
        let handlers = Arc::new(handlers);
        let cancel = CancellationToken::new();
        let mut queues = HashMap::new();
        let mut consumers = Vec::new();

        for class in QueueClass::ALL {
            let (tx, rx) = mpsc::unbounded_channel::<TaskSpec>();
            let depth = Arc::new(AtomicUsize::new(0));
            queues.insert(
                class,
                QueueState {
                    tx,
                    depth: depth.clone(),
                },
            );

            // One receiver per class feeding a bounded set of executors.
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..config.concurrency.max(1) {
                let rx = rx.clone();
                let depth = depth.clone();
                let handlers = handlers.clone();
                let kv = kv.clone();
                let dlq = dlq.clone();
                let config = config.clone();
                let cancel = cancel.child_token();
                consumers.push(tokio::spawn(async move {
                    loop {
                        let task = tokio::select! {
                            _ = cancel.cancelled() => break,
                            task = async { rx.lock().await.recv().await } => task,
                        };
                        let Some(task) = task else { break };
                        depth.fetch_sub(1, Ordering::SeqCst);
                        execute_task(
                            &task,
                            &handlers,
                            kv.clone(),
                            &dlq,
                            &config,
                            checkpoint_ttl_days,
                            cancel.child_token(),
                        )
                        .await;
                    }
                }));
            }
        }

        Self {
            handlers,
            queues,
            config,
            cancel,
            consumers,
        }
    }

    /// Enqueue a task, rejecting retryably above the high-watermark.
    pub fn submit(&self, task: TaskSpec) -> Result<(), WorkerError> {
        if !self.handlers.contains_key(&task.name) {
            return Err(WorkerError::UnknownTaskType(task.name));
        }
        let queue = self
            .queues
            .get(&task.queue)
            .expect("all queue classes are initialized at startup");
        if queue.depth.load(Ordering::SeqCst) >= self.config.queue_high_watermark {
            return Err(WorkerError::Backpressure {
                queue: task.queue.as_str().to_string(),
            });
        }
        queue.depth.fetch_add(1, Ordering::SeqCst);
        queue.tx.send(task).map_err(|e| WorkerError::Backpressure {
            queue: e.0.queue.as_str().to_string(),
        })
    }

    pub fn queue_depth(&self, class: QueueClass) -> usize {
        self.queues
            .get(&class)
            .map(|q| q.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop consumers; in-flight tasks observe their cancellation token.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for consumer in self.consumers {
            let _ = consumer.await;
        }
    }
}

#[async_trait]
impl TaskRequeue for WorkerRuntime {
    async fn requeue(&self, entry: &DeadLetterEntry) -> Result<(), String> {
        let queue = QueueClass::from_str(&entry.queue)?;
        let payload = entry
            .metadata
            .get("payload")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        self.submit(TaskSpec::new(
            entry.task_name.clone(),
            entry.task_id.clone(),
            queue,
            payload,
        ))
        .map_err(|e| e.to_string())
    }
}

/// Run one task to completion: retry with exponential backoff up to the
/// attempt cap, then archive in the DLQ unless the failure was a
/// cancellation.
async fn execute_task(
    task: &TaskSpec,
    handlers: &HashMap<String, Arc<dyn TaskHandler>>,
    kv: Arc<dyn KeyValueStore>,
    dlq: &DeadLetterQueue,
    config: &WorkerConfig,
    checkpoint_ttl_days: u32,
    cancel: CancellationToken,
) {
    let Some(handler) = handlers.get(&task.name) else {
        // submit() filters unknown names; a rename race lands here.
        tracing::error!(task = %task.name, "no handler registered");
        return;
    };
    let ctx = TaskContext {
        checkpoint: Checkpoint::new(kv, task.task_id.clone(), checkpoint_ttl_days),
        cancel,
    };

    let mut attempt = 0u32;
    let last_error = loop {
        attempt += 1;
        match handler.handle(task, &ctx).await {
            Ok(()) => {
                tracing::info!(task = %task.name, task_id = %task.task_id, attempt, "task completed");
                return;
            }
            Err(StageError::Cancelled) => {
                tracing::info!(task = %task.name, task_id = %task.task_id, "task cancelled");
                return;
            }
            Err(err) if err.is_retryable() && attempt < config.max_attempts => {
                let backoff = Duration::from_millis(
                    (config.backoff_base_ms * 2u64.pow(attempt - 1)).min(config.backoff_cap_ms),
                );
                tracing::warn!(
                    task = %task.name,
                    task_id = %task.task_id,
                    attempt,
                    ?backoff,
                    error = %err,
                    "task failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => break err,
        }
    };

    if last_error.goes_to_dlq() {
        let mut metadata = BTreeMap::new();
        metadata.insert("payload".to_string(), task.payload.clone());
        if let Err(dlq_err) = dlq
            .add(
                &task.name,
                &task.task_id,
                last_error.kind(),
                &last_error.user_message(),
                &format!("{last_error:?}"),
                attempt,
                task.queue.as_str(),
                metadata,
            )
            .await
        {
            tracing::error!(
                task = %task.name,
                task_id = %task.task_id,
                error = %dlq_err,
                "failed to archive terminal failure to the dead-letter queue"
            );
        }
    } else {
        tracing::warn!(
            task = %task.name,
            task_id = %task.task_id,
            error = %last_error,
            "terminal failure not eligible for the dead-letter queue"
        );
    }
}
