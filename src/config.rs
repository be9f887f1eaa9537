//! Unified configuration for Scribe.
//!
//! Settings load from `scribe.toml` in the working directory, layered
//! file → environment → CLI flags. Every subsystem gets its own section
//! with serde defaults, so an empty file (or no file) yields a fully
//! working single-node configuration with mock-friendly defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! parallel_section_generation = true
//! section_generation_batch_size = 5
//! block_on_fact_check_failure = false
//!
//! [research]
//! vector_dim = 1536
//! top_k = 20
//! similarity_threshold = 0.75
//! relevance_threshold = 0.75
//! dedup_fuzzy_threshold = 0.85
//!
//! [breaker]
//! failure_threshold = 5
//! window_seconds = 60
//! recovery_timeout_seconds = 60
//! half_open_success_threshold = 2
//!
//! [[provider]]
//! id = "apex"
//! base_url = "https://api.apex.example/v1"
//! api_key_env = "APEX_API_KEY"
//! model = "apex-large"
//! capabilities = ["text", "text_with_schema", "vision"]
//! rate_in_per_1k_usd = 0.01
//! rate_out_per_1k_usd = 0.03
//!
//! [tasks]
//! content_generation = ["apex", "structura", "brisk"]
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::providers::{Capability, TaskKind};

/// Orchestrator-level pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// If false, sections run sequentially with identical outputs.
    #[serde(default = "default_parallel_sections")]
    pub parallel_section_generation: bool,
    /// Max concurrent section bodies per batch.
    #[serde(default = "default_section_batch_size")]
    pub section_generation_batch_size: usize,
    /// Per-stage retry budget unless a stage overrides it.
    #[serde(default = "default_stage_max_attempts")]
    pub stage_max_attempts: u32,
    /// Exponential backoff base for stage retries, milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub stage_backoff_base_ms: u64,
    /// Backoff cap, milliseconds.
    #[serde(default = "default_backoff_cap_ms")]
    pub stage_backoff_cap_ms: u64,
    /// Deadline for a single stage body, seconds.
    #[serde(default = "default_stage_deadline_secs")]
    pub stage_deadline_secs: u64,
    /// When true a failed fact-check verdict fails the chapter at finalize
    /// instead of recording fail-soft.
    #[serde(default)]
    pub block_on_fact_check_failure: bool,
    /// Completeness below this, or any critical gap, or >2 high gaps,
    /// flags the chapter for user-initiated revision.
    #[serde(default = "default_revision_threshold")]
    pub gap_revision_threshold: f64,
}

fn default_parallel_sections() -> bool {
    true
}

fn default_section_batch_size() -> usize {
    5
}

fn default_stage_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_stage_deadline_secs() -> u64 {
    300
}

fn default_revision_threshold() -> f64 {
    0.75
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallel_section_generation: default_parallel_sections(),
            section_generation_batch_size: default_section_batch_size(),
            stage_max_attempts: default_stage_max_attempts(),
            stage_backoff_base_ms: default_backoff_base_ms(),
            stage_backoff_cap_ms: default_backoff_cap_ms(),
            stage_deadline_secs: default_stage_deadline_secs(),
            block_on_fact_check_failure: false,
            gap_revision_threshold: default_revision_threshold(),
        }
    }
}

/// Research-layer settings. `vector_dim` must equal the embedding model's
/// output dimension; changing it requires re-embedding the corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_vector_dim")]
    pub vector_dim: usize,
    /// Top-k per internal vector query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// AI relevance filter cut-off.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    /// Cosine similarity at or above which two sources are duplicates.
    #[serde(default = "default_fuzzy_threshold")]
    pub dedup_fuzzy_threshold: f64,
    /// Concurrent external API calls.
    #[serde(default = "default_external_concurrency")]
    pub external_concurrency: usize,
    /// Base URL of the external bibliographic API.
    #[serde(default = "default_external_base_url")]
    pub external_base_url: String,
}

fn default_vector_dim() -> usize {
    1536
}

fn default_top_k() -> usize {
    20
}

fn default_similarity_threshold() -> f64 {
    0.75
}

fn default_relevance_threshold() -> f64 {
    0.75
}

fn default_fuzzy_threshold() -> f64 {
    0.85
}

fn default_external_concurrency() -> usize {
    4
}

fn default_external_base_url() -> String {
    "https://api.crossref.org/works".to_string()
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            vector_dim: default_vector_dim(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            relevance_threshold: default_relevance_threshold(),
            dedup_fuzzy_threshold: default_fuzzy_threshold(),
            external_concurrency: default_external_concurrency(),
            external_base_url: default_external_base_url(),
        }
    }
}

/// Per-provider circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_successes")]
    pub half_open_success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_seconds() -> u64 {
    60
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_half_open_successes() -> u32 {
    2
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_seconds: default_window_seconds(),
            recovery_timeout_seconds: default_recovery_timeout(),
            half_open_success_threshold: default_half_open_successes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_days")]
    pub external_query_ttl_days: u32,
}

fn default_cache_ttl_days() -> u32 {
    7
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            external_query_ttl_days: default_cache_ttl_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_ttl_days")]
    pub ttl_days: u32,
}

fn default_checkpoint_ttl_days() -> u32 {
    7
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_checkpoint_ttl_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_dlq_retention_days")]
    pub retention_days: u32,
}

fn default_dlq_retention_days() -> u32 {
    30
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            retention_days: default_dlq_retention_days(),
        }
    }
}

/// Inbound sliding-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_requests")]
    pub requests_per_window: u32,
    #[serde(default = "default_rate_limit_window")]
    pub window_seconds: u64,
    /// Health and docs only; auth endpoints are deliberately not exempt.
    #[serde(default = "default_exempt_paths")]
    pub exempt_paths: Vec<String>,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_rate_limit_requests() -> u32 {
    60
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_exempt_paths() -> Vec<String> {
    vec!["/health".to_string(), "/docs".to_string()]
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            requests_per_window: default_rate_limit_requests(),
            window_seconds: default_rate_limit_window(),
            exempt_paths: default_exempt_paths(),
        }
    }
}

/// Background worker runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue depth above which new submissions are rejected retryably.
    #[serde(default = "default_high_watermark")]
    pub queue_high_watermark: usize,
    #[serde(default = "default_worker_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Concurrent task executions per queue class.
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
}

fn default_high_watermark() -> usize {
    256
}

fn default_worker_attempts() -> u32 {
    3
}

fn default_worker_concurrency() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_high_watermark: default_high_watermark(),
            max_attempts: default_worker_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            concurrency: default_worker_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Progress-channel heartbeat interval, seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// SQLite database path; ":memory:" for ephemeral runs.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8087".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_db_path() -> String {
    "scribe.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_secs: default_heartbeat_secs(),
            db_path: default_db_path(),
        }
    }
}

/// One configured provider. The API key is looked up from the named
/// environment variable at client construction, never stored in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    pub api_key_env: String,
    pub model: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub embedding_dim: Option<usize>,
    pub capabilities: Vec<Capability>,
    /// USD per 1000 input tokens.
    pub rate_in_per_1k_usd: f64,
    /// USD per 1000 output tokens.
    pub rate_out_per_1k_usd: f64,
    /// Whether the provider supports strict schema enforcement server-side.
    #[serde(default)]
    pub strict_schema: bool,
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_timeout_secs() -> u64 {
    120
}

/// Task-name → ordered provider-id fallback chain.
pub type TaskChains = BTreeMap<String, Vec<String>>;

/// The unified configuration root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScribeConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_providers", rename = "provider")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_task_chains")]
    pub tasks: TaskChains,
}

/// The shipped three-provider layout: a high-quality primary, a
/// schema-capable secondary, and a low-cost tertiary.
fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            id: "apex".to_string(),
            base_url: "https://api.apex.example/v1".to_string(),
            api_key_env: "APEX_API_KEY".to_string(),
            model: "apex-large".to_string(),
            embedding_model: None,
            embedding_dim: None,
            capabilities: vec![Capability::Text, Capability::TextWithSchema, Capability::Vision],
            rate_in_per_1k_usd: 0.010,
            rate_out_per_1k_usd: 0.030,
            strict_schema: true,
            timeout_secs: default_provider_timeout_secs(),
        },
        ProviderConfig {
            id: "structura".to_string(),
            base_url: "https://api.structura.example/v1".to_string(),
            api_key_env: "STRUCTURA_API_KEY".to_string(),
            model: "structura-pro".to_string(),
            embedding_model: Some("structura-embed".to_string()),
            embedding_dim: Some(default_vector_dim()),
            capabilities: vec![
                Capability::Text,
                Capability::TextWithSchema,
                Capability::Embedding,
            ],
            rate_in_per_1k_usd: 0.005,
            rate_out_per_1k_usd: 0.015,
            strict_schema: true,
            timeout_secs: default_provider_timeout_secs(),
        },
        ProviderConfig {
            id: "brisk".to_string(),
            base_url: "https://api.brisk.example/v1".to_string(),
            api_key_env: "BRISK_API_KEY".to_string(),
            model: "brisk-mini".to_string(),
            embedding_model: None,
            embedding_dim: None,
            capabilities: vec![Capability::Text],
            rate_in_per_1k_usd: 0.0005,
            rate_out_per_1k_usd: 0.0015,
            strict_schema: false,
            timeout_secs: default_provider_timeout_secs(),
        },
    ]
}

fn default_task_chains() -> TaskChains {
    let mut chains = BTreeMap::new();
    let mut insert = |task: TaskKind, chain: &[&str]| {
        chains.insert(
            task.as_str().to_string(),
            chain.iter().map(|s| s.to_string()).collect(),
        );
    };
    insert(TaskKind::MetadataExtraction, &["structura", "apex"]);
    insert(TaskKind::ResearchPlanning, &["apex", "structura"]);
    insert(TaskKind::ContentGeneration, &["apex", "structura", "brisk"]);
    insert(TaskKind::QualityAssessment, &["structura", "apex"]);
    insert(TaskKind::FactChecking, &["structura", "apex"]);
    insert(TaskKind::Review, &["apex", "structura"]);
    insert(TaskKind::Summarization, &["brisk", "structura"]);
    insert(TaskKind::Embedding, &["structura"]);
    insert(TaskKind::Vision, &["apex"]);
    chains
}

impl ScribeConfig {
    /// Load configuration from a file, falling back to defaults when the
    /// file is absent. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", p.display()))?
            }
            None => {
                let default_path = Path::new("scribe.toml");
                if default_path.exists() {
                    let raw = std::fs::read_to_string(default_path)
                        .context("Failed to read scribe.toml")?;
                    toml::from_str(&raw).context("Failed to parse scribe.toml")?
                } else {
                    Self::default_with_providers()
                }
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// `Default` leaves `providers`/`tasks` empty (serde only applies the
    /// field defaults when deserializing); this fills them in.
    pub fn default_with_providers() -> Self {
        Self {
            providers: default_providers(),
            tasks: default_task_chains(),
            ..Self::default()
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("SCRIBE_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("SCRIBE_DB_PATH") {
            self.server.db_path = path;
        }
        if let Ok(dim) = std::env::var("SCRIBE_VECTOR_DIM")
            && let Ok(parsed) = dim.parse::<usize>()
        {
            self.research.vector_dim = parsed;
        }
        if let Ok(v) = std::env::var("SCRIBE_PARALLEL_SECTIONS") {
            self.pipeline.parallel_section_generation = v != "false" && v != "0";
        }
    }

    /// Startup self-check. Hard failures abort; soft issues come back as
    /// warnings for the operator.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.providers.is_empty() {
            bail!("Integrity violation: no providers configured");
        }

        for (task, chain) in &self.tasks {
            if chain.is_empty() {
                bail!("Integrity violation: task {task} has an empty provider chain");
            }
            for provider_id in chain {
                if !self.providers.iter().any(|p| &p.id == provider_id) {
                    bail!(
                        "Integrity violation: task {task} references unknown provider {provider_id}"
                    );
                }
            }
        }
        for task in TaskKind::ALL {
            if !self.tasks.contains_key(task.as_str()) {
                bail!("Integrity violation: no provider chain configured for task {task}");
            }
        }

        // Embedding dimension must agree everywhere vectors flow.
        for provider in &self.providers {
            if provider.capabilities.contains(&Capability::Embedding) {
                match provider.embedding_dim {
                    Some(dim) if dim != self.research.vector_dim => {
                        bail!(
                            "Integrity violation: provider {} embeds at dimension {} but research.vector_dim is {}; re-embed the corpus or fix the config",
                            provider.id,
                            dim,
                            self.research.vector_dim
                        );
                    }
                    None => warnings.push(format!(
                        "provider {} advertises embeddings without a declared dimension",
                        provider.id
                    )),
                    _ => {}
                }
            }
        }

        // Schema tasks need at least one schema-capable provider in-chain.
        for task in [
            TaskKind::MetadataExtraction,
            TaskKind::FactChecking,
            TaskKind::ResearchPlanning,
        ] {
            let chain = &self.tasks[task.as_str()];
            let any_schema_capable = chain.iter().any(|id| {
                self.providers
                    .iter()
                    .any(|p| &p.id == id && p.capabilities.contains(&Capability::TextWithSchema))
            });
            if !any_schema_capable {
                bail!(
                    "Integrity violation: task {task} requires a schema-capable provider but its chain has none"
                );
            }
        }

        if !(0.0..=1.0).contains(&self.research.dedup_fuzzy_threshold) {
            bail!("Integrity violation: dedup_fuzzy_threshold must be in [0,1]");
        }
        if self.pipeline.section_generation_batch_size == 0 {
            bail!("Integrity violation: section_generation_batch_size must be at least 1");
        }
        if self.rate_limit.requests_per_window == 0 && self.rate_limit.enabled {
            warnings.push("rate limiting enabled with a zero budget; all requests will be limited".to_string());
        }

        Ok(warnings)
    }

    pub fn provider_config(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// The configured fallback chain for a task. Validation guarantees the
    /// chain exists and is non-empty.
    pub fn chain_for(&self, task: TaskKind) -> &[String] {
        self.tasks
            .get(task.as_str())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}
