//! Multi-provider LLM access: the single API the orchestrator calls.
//!
//! The router owns task→provider-chain resolution, circuit-breaker
//! consultation, fallback, retry, schema enforcement, and cost accounting.
//! Providers themselves are thin clients behind the [`Provider`] trait.

pub mod cost;
pub mod http;
pub mod mock;
pub mod router;

pub use cost::{CallMetric, CostLedger};
pub use router::ProviderRouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;

/// What a provider can do. Schema-constrained calls are only routed to
/// providers advertising `TextWithSchema`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    TextWithSchema,
    Embedding,
    Vision,
}

/// The enumerated call sites, each with a configured fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    MetadataExtraction,
    ResearchPlanning,
    ContentGeneration,
    QualityAssessment,
    FactChecking,
    Review,
    Summarization,
    Embedding,
    Vision,
}

impl TaskKind {
    pub const ALL: [TaskKind; 9] = [
        TaskKind::MetadataExtraction,
        TaskKind::ResearchPlanning,
        TaskKind::ContentGeneration,
        TaskKind::QualityAssessment,
        TaskKind::FactChecking,
        TaskKind::Review,
        TaskKind::Summarization,
        TaskKind::Embedding,
        TaskKind::Vision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataExtraction => "metadata_extraction",
            Self::ResearchPlanning => "research_planning",
            Self::ContentGeneration => "content_generation",
            Self::QualityAssessment => "quality_assessment",
            Self::FactChecking => "fact_checking",
            Self::Review => "review",
            Self::Summarization => "summarization",
            Self::Embedding => "embedding",
            Self::Vision => "vision",
        }
    }

    /// The capability a call for this task requires from a provider.
    pub fn required_capability(&self, with_schema: bool) -> Capability {
        match self {
            Self::Embedding => Capability::Embedding,
            Self::Vision => Capability::Vision,
            _ if with_schema => Capability::TextWithSchema,
            _ => Capability::Text,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plain text generation request.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// A schema-constrained request; `schema` is a compiled JSON Schema and
/// `schema_name` its stable contract name.
#[derive(Debug, Clone)]
pub struct SchemaRequest {
    pub prompt: String,
    pub schema_name: String,
    pub schema: serde_json::Value,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone)]
pub struct TextResponse {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct SchemaResponse {
    /// Parsed JSON payload; the router validates it against the request
    /// schema before returning.
    pub data: serde_json::Value,
    pub raw_text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub image_bytes: Vec<u8>,
    pub prompt: String,
    pub schema_name: String,
    pub schema: serde_json::Value,
}

/// One reachable LLM/embedding service.
///
/// Implementations are thin transports: no retry, no fallback, no breaker
/// logic here. The router owns all failure policy.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used in config chains, breaker keys, and metrics.
    fn id(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }

    /// Embedding output dimension, for providers advertising `Embedding`.
    fn embedding_dim(&self) -> Option<usize> {
        None
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError>;

    async fn generate_with_schema(
        &self,
        request: &SchemaRequest,
    ) -> Result<SchemaResponse, ProviderError>;

    async fn generate_embedding(&self, text: &str) -> Result<EmbeddingResponse, ProviderError>;

    async fn analyze_image(
        &self,
        request: &VisionRequest,
    ) -> Result<SchemaResponse, ProviderError>;
}
