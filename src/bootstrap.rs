//! Process wiring: build the dependency graph once at startup.
//!
//! Everything is injected here — providers, shared stores, the router,
//! research, worker runtime — so the rest of the crate never reaches for
//! a global. Tests assemble the same graph with mock providers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::cache::QueryCache;
use crate::config::ScribeConfig;
use crate::dlq::DeadLetterQueue;
use crate::errors::StageError;
use crate::ingest::{DocumentProcessor, IngestPipeline, IngestTaskHandler};
use crate::orchestrator::{ChapterRunner, GenerationService, StageDeps};
use crate::progress::ProgressHub;
use crate::providers::cost::CostLedger;
use crate::providers::http::HttpProvider;
use crate::providers::{Provider, ProviderRouter};
use crate::research::{ExternalSource, HttpBibliographicApi, ResearchLayer, SqliteVectorIndex};
use crate::store::{ChapterStore, KeyValueStore, MemoryKeyValueStore, MemorySortedSetStore};
use crate::worker::{TaskContext, TaskHandler, TaskSpec, WorkerRuntime};

pub struct App {
    pub config: ScribeConfig,
    pub deps: Arc<StageDeps>,
    pub service: Arc<GenerationService>,
    pub dlq: Arc<DeadLetterQueue>,
    pub runtime: Arc<WorkerRuntime>,
    pub kv: Arc<dyn KeyValueStore>,
    pub breaker: Arc<CircuitBreaker>,
}

/// Worker adapter so chapter runs can also execute as queued tasks
/// (fan-out and DLQ retry).
struct ChapterGenerationHandler {
    deps: Arc<StageDeps>,
}

#[async_trait]
impl TaskHandler for ChapterGenerationHandler {
    async fn handle(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<(), StageError> {
        let chapter_id =
            Uuid::parse_str(&task.task_id).map_err(|_| StageError::InvalidInput {
                reason: format!("task id {} is not a chapter id", task.task_id),
            })?;
        ChapterRunner::new(self.deps.clone())
            .run(chapter_id, ctx.cancel.clone())
            .await
    }
}

/// Build the full graph from already-constructed providers and external
/// collaborators.
pub fn build(
    config: ScribeConfig,
    providers: Vec<Arc<dyn Provider>>,
    external: Arc<dyn ExternalSource>,
    processor: Option<Arc<dyn DocumentProcessor>>,
) -> Result<App> {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
    let sorted = Arc::new(MemorySortedSetStore::new());

    let store = if config.server.db_path == ":memory:" {
        ChapterStore::new_in_memory()
    } else {
        ChapterStore::new(Path::new(&config.server.db_path))
    }
    .context("Failed to open the chapter store")?;
    let store = Arc::new(Mutex::new(store));

    let breaker = Arc::new(CircuitBreaker::new(kv.clone(), config.breaker.clone()));
    let ledger = Arc::new(CostLedger::new());
    let router = Arc::new(ProviderRouter::new(
        providers,
        &config,
        breaker.clone(),
        ledger,
    ));

    let index = Arc::new(SqliteVectorIndex::new(
        store.clone(),
        config.research.vector_dim,
    ));
    let research = Arc::new(ResearchLayer::new(
        router.clone(),
        index,
        external,
        QueryCache::new(kv.clone(), config.cache.external_query_ttl_days),
        config.research.clone(),
    ));

    let dlq = Arc::new(DeadLetterQueue::new(
        sorted,
        kv.clone(),
        config.dlq.retention_days,
    ));
    let progress = Arc::new(ProgressHub::new());

    let deps = Arc::new(StageDeps::new(
        config.clone(),
        router.clone(),
        research,
        store.clone(),
        kv.clone(),
        dlq.clone(),
        progress,
    ));
    let service = GenerationService::new(deps.clone());

    let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert(
        "chapter_generation".to_string(),
        Arc::new(ChapterGenerationHandler { deps: deps.clone() }),
    );
    if let Some(processor) = processor {
        let pipeline = Arc::new(IngestPipeline::new(
            store,
            router,
            processor,
            config.research.vector_dim,
        ));
        handlers.insert(
            "ingest_document".to_string(),
            Arc::new(IngestTaskHandler { pipeline }),
        );
    }
    let runtime = Arc::new(WorkerRuntime::start(
        handlers,
        kv.clone(),
        dlq.clone(),
        config.worker.clone(),
        config.checkpoint.ttl_days,
    ));

    Ok(App {
        config,
        deps,
        service,
        dlq,
        runtime,
        kv,
        breaker,
    })
}

/// Build with real HTTP providers and the bibliographic API, per config.
pub fn build_default(config: ScribeConfig) -> Result<App> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for provider_config in &config.providers {
        match HttpProvider::from_config(provider_config) {
            Ok(provider) => providers.push(Arc::new(provider)),
            Err(err) => {
                // A provider without credentials is left out of the pool;
                // the router's chains simply skip it.
                tracing::warn!(
                    provider = %provider_config.id,
                    error = %err,
                    "provider not available"
                );
            }
        }
    }
    if providers.is_empty() {
        anyhow::bail!(
            "no provider credentials found; set the api_key_env variables named in scribe.toml"
        );
    }
    let external: Arc<dyn ExternalSource> = Arc::new(
        HttpBibliographicApi::new(config.research.external_base_url.clone(), 20)
            .map_err(|e| anyhow::anyhow!("failed to build external API client: {e}"))?,
    );
    build(config, providers, external, None)
}
