//! Background worker runtime: queued task execution segregated by
//! workload class.
//!
//! Every task execution is wrapped in a checkpoint scope, a bounded retry
//! policy with exponential backoff, and DLQ capture on terminal failure
//! (cancellation excepted). Submissions above the queue high-watermark are
//! rejected retryably.

pub mod runtime;

pub use runtime::{TaskContext, TaskHandler, WorkerRuntime};

use serde::{Deserialize, Serialize};

/// Workload classes; each gets its own queue and consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Default,
    Embeddings,
    Images,
}

impl QueueClass {
    pub const ALL: [QueueClass; 3] = [QueueClass::Default, QueueClass::Embeddings, QueueClass::Images];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Embeddings => "embeddings",
            Self::Images => "images",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "default" => Ok(Self::Default),
            "embeddings" => Ok(Self::Embeddings),
            "images" => Ok(Self::Images),
            _ => Err(format!("Invalid queue class: {}", s)),
        }
    }
}

/// A named unit of background work with a payload identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Handler name, e.g. "ingest_document" or "section_generation".
    pub name: String,
    /// Stable task id; also the checkpoint scope.
    pub task_id: String,
    pub queue: QueueClass,
    pub payload: serde_json::Value,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        task_id: impl Into<String>,
        queue: QueueClass,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            task_id: task_id.into(),
            queue,
            payload,
        }
    }
}
