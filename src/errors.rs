//! Typed error hierarchy for the Scribe pipeline.
//!
//! Three top-level enums cover the three layers that handle failures:
//! - `ProviderError` — per-call failures inside the provider router
//! - `StageError` — per-stage failures inside the chapter orchestrator
//! - `WorkerError` — task-level failures inside the background runtime
//!
//! `StoreError` wraps persistence failures and is fatal for the stage that
//! observes it (the store retries internally). Every error maps to a stable
//! machine-readable [`ErrorKind`] for the user-facing surface; the mapping
//! never exposes provider names, credentials, or stack traces.

use std::time::Duration;
use thiserror::Error;

/// Errors from a single provider call, handled by the router.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Timeout, 5xx, or network failure. Retried with backoff, then the
    /// router falls through to the next provider in the chain.
    #[error("Transient provider failure: {message}")]
    Transient { message: String },

    /// HTTP 429. The router waits (Retry-After if given) and retries the
    /// same provider a bounded number of times before falling back.
    #[error("Provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Invalid or missing credentials. Stops the fallback chain immediately;
    /// this is a configuration error, not a capacity problem.
    #[error("Provider authentication failed: {message}")]
    Auth { message: String },

    /// The provider returned data that does not validate against the
    /// requested schema. Not retried on the same provider.
    #[error("Provider output failed {schema} validation: {message}")]
    SchemaViolation { schema: String, message: String },

    /// The provider does not advertise the capability this call requires.
    #[error("Provider {provider} lacks capability {capability}")]
    MissingCapability {
        provider: String,
        capability: String,
    },

    /// Every provider in the task chain was skipped (open breaker) or
    /// exhausted its attempts.
    #[error("No provider available for task {task}")]
    Unavailable { task: String },
}

impl ProviderError {
    /// Whether the router should try the next provider in the chain after
    /// this failure.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, ProviderError::Auth { .. })
    }
}

/// Persistence failures. The store is expected to retry internally, so the
/// core treats these as fatal for the current stage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflicting concurrent write: {0}")]
    Conflict(String),
}

/// Errors from a single stage execution inside the orchestrator.
#[derive(Debug, Error)]
pub enum StageError {
    /// User-visible input problem. Never retried.
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stage payload failed to parse at the orchestrator boundary. The
    /// router already validated the provider output, so this indicates a
    /// contract drift and is fatal.
    #[error("Stage {stage} payload failed to parse: {message}")]
    PayloadParse { stage: String, message: String },

    /// Cooperative cancellation. Not a failure for DLQ purposes.
    #[error("Cancelled")]
    Cancelled,

    /// An invariant check failed (stage regression, dimension mismatch).
    #[error("Integrity violation: {0}")]
    Integrity(String),
}

impl StageError {
    /// Whether the orchestrator retries this stage locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::Provider(ProviderError::Transient { .. })
                | StageError::Provider(ProviderError::RateLimited { .. })
        )
    }

    /// Whether a terminal failure of this kind is archived in the DLQ.
    /// Cancellation and provider-unavailable are deliberate exclusions.
    pub fn goes_to_dlq(&self) -> bool {
        !matches!(
            self,
            StageError::Cancelled | StageError::Provider(ProviderError::Unavailable { .. })
        )
    }
}

/// Errors from the background worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Queue {queue} is over capacity, retry later")]
    Backpressure { queue: String },

    #[error("Task {task_id} exhausted {attempts} attempts: {message}")]
    AttemptsExhausted {
        task_id: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    Stage(#[from] StageError),
}

/// Stable machine-readable failure kinds for the user-facing surface.
///
/// These are the only identifiers that cross the API boundary; everything
/// else (provider names, traces) stays in logs and the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ProviderTransient,
    ProviderAuth,
    ProviderSchemaViolation,
    ProviderUnavailable,
    StoreError,
    Cancelled,
    IntegrityViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderAuth => "provider_auth",
            ErrorKind::ProviderSchemaViolation => "provider_schema_violation",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::StoreError => "store_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IntegrityViolation => "integrity_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StageError {
    /// Map to the stable kind exposed to users and stored on failed chapters.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::InvalidInput { .. } => ErrorKind::InvalidInput,
            StageError::Provider(ProviderError::Auth { .. }) => ErrorKind::ProviderAuth,
            StageError::Provider(ProviderError::SchemaViolation { .. }) => {
                ErrorKind::ProviderSchemaViolation
            }
            StageError::Provider(ProviderError::Unavailable { .. }) => {
                ErrorKind::ProviderUnavailable
            }
            StageError::Provider(_) => ErrorKind::ProviderTransient,
            StageError::Store(_) => ErrorKind::StoreError,
            StageError::PayloadParse { .. } => ErrorKind::ProviderSchemaViolation,
            StageError::Cancelled => ErrorKind::Cancelled,
            StageError::Integrity(_) => ErrorKind::IntegrityViolation,
        }
    }

    /// Human-readable message safe to surface to users. Provider identities
    /// and internal traces are deliberately absent.
    pub fn user_message(&self) -> String {
        match self {
            StageError::InvalidInput { reason } => reason.clone(),
            StageError::Provider(ProviderError::Auth { .. }) => {
                "A language model provider is misconfigured".to_string()
            }
            StageError::Provider(ProviderError::Unavailable { .. }) => {
                "No language model provider is currently available".to_string()
            }
            StageError::Provider(_) => "A language model call failed after retries".to_string(),
            StageError::Store(_) => "A storage operation failed".to_string(),
            StageError::PayloadParse { stage, .. } => {
                format!("Stage {stage} produced an unreadable result")
            }
            StageError::Cancelled => "Generation was cancelled".to_string(),
            StageError::Integrity(_) => "An internal consistency check failed".to_string(),
        }
    }
}
