//! End-to-end pipeline scenarios over the public API, with mock providers
//! and in-memory shared stores.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scribe::bootstrap::{self, App};
use scribe::breaker::CircuitState;
use scribe::checkpoint::Checkpoint;
use scribe::config::ScribeConfig;
use scribe::dlq::DlqFilter;
use scribe::errors::ProviderError;
use scribe::model::{
    Chapter, ChapterStatus, ChapterType, Chunk, Document, DocumentStatus, SourceOrigin, SourceRef,
    StageId, StagePayload,
};
use scribe::orchestrator::{ChapterRunner, GenerationOptions};
use scribe::progress::{EventKind, ProgressEvent};
use scribe::providers::mock::{FailAllMode, MockProvider, Scripted};
use scribe::providers::{Provider, TaskKind};
use scribe::research::ExternalSource;

const DIM: usize = 8;

/// Every task chain routed to the single "apex" provider.
fn single_provider_config() -> ScribeConfig {
    let mut config = test_config();
    for chain in config.tasks.values_mut() {
        *chain = vec!["apex".to_string()];
    }
    config
}

fn test_config() -> ScribeConfig {
    let mut config = ScribeConfig::default_with_providers();
    config.server.db_path = ":memory:".to_string();
    config.research.vector_dim = DIM;
    config.pipeline.stage_backoff_base_ms = 1;
    config.pipeline.stage_backoff_cap_ms = 5;
    config.worker.backoff_base_ms = 1;
    config.worker.backoff_cap_ms = 5;
    // Breakers recover immediately so sequential tests can heal providers.
    config.breaker.recovery_timeout_seconds = 0;
    config
}

/// Deterministic external bibliographic API: one recent publication per
/// query.
struct FakeBibliographicApi;

#[async_trait]
impl ExternalSource for FakeBibliographicApi {
    fn id(&self) -> &str {
        "fake-bib"
    }

    async fn search(
        &self,
        query: &str,
        _params: &serde_json::Value,
    ) -> Result<Vec<SourceRef>, ProviderError> {
        let slug: String = query
            .chars()
            .filter(|c| c.is_alphanumeric())
            .take(24)
            .collect();
        Ok(vec![SourceRef {
            origin: SourceOrigin::ExternalPub,
            stable_id: format!("10.1000/{slug}"),
            title: format!("Published evidence on {query}"),
            authors: vec!["Reviewer A".to_string()],
            year: Some(2024),
            abstract_text: Some("A recent peer-reviewed series.".to_string()),
            relevance_score: 0.85,
            ai_relevance_score: None,
            embedding: None,
        }])
    }
}

struct Harness {
    app: App,
    apex: Arc<MockProvider>,
    structura: Arc<MockProvider>,
}

fn harness_with(config: ScribeConfig, providers: Vec<Arc<MockProvider>>) -> Harness {
    let apex = providers
        .iter()
        .find(|p| p.id() == "apex")
        .cloned()
        .unwrap_or_else(|| Arc::new(MockProvider::full("apex").with_embedding_dim(DIM)));
    let structura = providers
        .iter()
        .find(|p| p.id() == "structura")
        .cloned()
        .unwrap_or_else(|| Arc::new(MockProvider::full("structura").with_embedding_dim(DIM)));
    let dyn_providers: Vec<Arc<dyn Provider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn Provider>)
        .collect();
    let app = bootstrap::build(config, dyn_providers, Arc::new(FakeBibliographicApi), None)
        .expect("failed to build test app");
    Harness {
        app,
        apex,
        structura,
    }
}

fn full_harness() -> Harness {
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    let structura = Arc::new(MockProvider::full("structura").with_embedding_dim(DIM));
    harness_with(test_config(), vec![apex, structura])
}

/// Index `count` committed documents whose chunks match the mock's
/// embedding for its auto vector query.
async fn seed_corpus(app: &App, count: usize) {
    let probe = MockProvider::full("probe").with_embedding_dim(DIM);
    let embedding = probe
        .generate_embedding("surgical anatomy of the region")
        .await
        .unwrap()
        .vector;
    for i in 0..count {
        let doc_id = format!("doc-{i}");
        app.deps
            .with_store(|store| {
                store.insert_document(&Document {
                    id: doc_id.clone(),
                    title: format!("Indexed monograph {i}"),
                    authors: vec!["Internal Author".to_string()],
                    year: Some(2024),
                    status: DocumentStatus::Committed,
                    citations: vec![],
                    created_at: chrono::Utc::now(),
                })?;
                store.insert_chunk(&Chunk {
                    id: format!("{doc_id}-c0"),
                    document_id: doc_id.clone(),
                    page: 1,
                    content: "glioma surgery corridor description".to_string(),
                    embedding: embedding.clone(),
                })
            })
            .unwrap();
    }
}

fn create_chapter(app: &App, topic: &str) -> Chapter {
    let chapter = Chapter::new("user-1", topic);
    app.deps
        .with_store(|store| store.create_chapter(&chapter))
        .unwrap();
    chapter
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn run_chapter(app: &App, chapter_id: Uuid) -> Result<(), scribe::errors::StageError> {
    ChapterRunner::new(app.deps.clone())
        .run(chapter_id, CancellationToken::new())
        .await
}

fn reload(app: &App, chapter_id: Uuid) -> Chapter {
    app.deps
        .with_store(|store| store.get_chapter(chapter_id))
        .unwrap()
        .unwrap()
}

// ── Scenario 1: happy path ───────────────────────────────────────────

#[tokio::test]
async fn happy_path_generation() {
    let harness = full_harness();
    seed_corpus(&harness.app, 3).await;

    let chapter = create_chapter(&harness.app, "Glioblastoma surgical management");
    let mut rx = harness.app.deps.progress.subscribe(chapter.id);
    run_chapter(&harness.app, chapter.id).await.unwrap();
    let events = drain_events(&mut rx);
    let chapter = reload(&harness.app, chapter.id);

    // Terminal state and classification.
    assert_eq!(chapter.status, ChapterStatus::Completed);
    let analysis = chapter.analysis().unwrap();
    assert_eq!(analysis.chapter_type, ChapterType::SurgicalDisease);

    // Section count within the surgical-disease bounds.
    assert!((80..=120).contains(&chapter.sections.len()));

    // All four quality scalars at or above 0.5.
    for (name, value) in [
        ("depth", chapter.quality.depth),
        ("coverage", chapter.quality.coverage),
        ("evidence", chapter.quality.evidence),
        ("currency", chapter.quality.currency),
    ] {
        assert!(value >= 0.5, "{name} was {value}");
    }

    // At least one section cites an internal document.
    assert!(
        chapter
            .sections
            .iter()
            .any(|s| s.source_ids.iter().any(|id| id.starts_with("doc-")))
    );

    // Fact-check payload present with non-empty claims.
    let Some(StagePayload::FactCheck(verdict)) = chapter.payload(StageId::FactCheck) else {
        panic!("fact check payload missing");
    };
    assert!(verdict.sections.iter().any(|s| !s.claims.is_empty()));

    // All fourteen payloads present on a completed chapter.
    for stage in StageId::ALL {
        assert!(
            chapter.payload(stage).is_some(),
            "missing payload for {stage}"
        );
    }
    assert!(chapter.version >= 1);

    // Stage events follow the canonical order, no repeats, no skips.
    let starts: Vec<String> = events
        .iter()
        .filter(|e| e.event == EventKind::StageStart)
        .filter_map(|e| e.stage.clone())
        .collect();
    let expected: Vec<String> = StageId::ALL.iter().map(|s| s.as_str().to_string()).collect();
    assert_eq!(starts, expected);

    // One section_ready per planned section.
    let ready = events
        .iter()
        .filter(|e| e.event == EventKind::SectionReady)
        .count();
    assert_eq!(ready, chapter.sections.len());
    assert!(events.iter().any(|e| e.event == EventKind::ChapterComplete));

    // Exactly one current version.
    let versions = harness
        .app
        .deps
        .with_store(|store| store.list_versions(chapter.id))
        .unwrap();
    assert_eq!(versions.iter().filter(|v| v.is_current).count(), 1);

    // Cost flowed through from the configured rates.
    assert!(chapter.total_cost_usd > 0.0);
}

// ── Scenario 2: provider fallback ────────────────────────────────────

#[tokio::test]
async fn provider_fallback_completes_on_secondary() {
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    // A rejected credential behaves as repeated call failures here so the
    // chain can demonstrate fallback; a hard auth error would stop the
    // chain by design.
    apex.fail_everything(FailAllMode::Transient);
    let structura = Arc::new(MockProvider::full("structura").with_embedding_dim(DIM));
    let mut config = test_config();
    // Keep the breaker open once it trips so the skip is observable.
    config.breaker.recovery_timeout_seconds = 600;
    let harness = harness_with(config, vec![apex.clone(), structura.clone()]);
    seed_corpus(&harness.app, 1).await;

    let chapter = create_chapter(&harness.app, "Glioblastoma surgical management");
    run_chapter(&harness.app, chapter.id).await.unwrap();
    let chapter = reload(&harness.app, chapter.id);
    assert_eq!(chapter.status, ChapterStatus::Completed);

    // LLM-backed stages record the secondary provider in their checkpoint
    // metadata.
    let checkpoint = Checkpoint::new(
        harness.app.kv.clone(),
        format!("chapter:{}", chapter.id),
        7,
    );
    for stage in ["input_valid", "context", "synthesis_plan", "review"] {
        let metadata = checkpoint.get_step_metadata(stage).await.unwrap().unwrap();
        assert_eq!(
            metadata["provider"], "structura",
            "stage {stage} did not fall back"
        );
    }

    // The primary's breaker opened within its first five failures.
    let stats = harness.app.breaker.get_stats("apex").await.unwrap();
    assert_eq!(stats.state, CircuitState::Open);
    assert!(stats.total_failures >= 5);

    // Fallback is not a terminal failure: no DLQ entry.
    assert!(
        harness
            .app
            .dlq
            .list(&DlqFilter::default(), 10, 0)
            .await
            .unwrap()
            .is_empty()
    );
}

// ── Scenario 3: empty internal corpus ────────────────────────────────

#[tokio::test]
async fn empty_internal_corpus_still_completes() {
    let harness = full_harness();
    // No documents indexed at all.

    let chapter = create_chapter(&harness.app, "Cervical spine anatomy");
    run_chapter(&harness.app, chapter.id).await.unwrap();
    let chapter = reload(&harness.app, chapter.id);

    assert_eq!(chapter.status, ChapterStatus::Completed);
    let Some(StagePayload::ResearchInternal(internal)) =
        chapter.payload(StageId::ResearchInternal)
    else {
        panic!("internal research payload missing");
    };
    assert!(internal.is_empty());

    let Some(StagePayload::ResearchExternal(external)) =
        chapter.payload(StageId::ResearchExternal)
    else {
        panic!("external research payload missing");
    };
    assert!(!external.is_empty());
    assert!(external.iter().all(|s| s.ai_relevance_score.is_some()));

    let analysis = chapter.analysis().unwrap();
    assert_eq!(analysis.chapter_type, ChapterType::PureAnatomy);
    assert!((48..=80).contains(&chapter.sections.len()));
}

// ── Scenario 4: crash and resume ─────────────────────────────────────

#[tokio::test]
async fn resume_skips_completed_sections() {
    // Single provider so an injected outage cannot fall back.
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    let harness = harness_with(single_provider_config(), vec![apex.clone()]);
    seed_corpus(&harness.app, 1).await;

    // Fifty sections succeed, then the provider goes down. The failing
    // batch of five is retried across the stage's three attempts.
    for _ in 0..50 {
        apex.push_text(Scripted::Text(format!(
            "Generated passage. {}",
            vec!["detail"; 150].join(" ")
        )));
    }
    for _ in 0..15 {
        apex.push_text(Scripted::Fail(ProviderError::Transient {
            message: "simulated outage".to_string(),
        }));
    }

    let chapter = create_chapter(&harness.app, "Glioblastoma surgical management");
    let err = run_chapter(&harness.app, chapter.id).await.unwrap_err();
    assert!(matches!(
        err,
        scribe::errors::StageError::Provider(ProviderError::Transient { .. })
    ));

    let failed = reload(&harness.app, chapter.id);
    assert_eq!(failed.status, ChapterStatus::Failed);
    assert_eq!(failed.current_stage, StageId::SectionGeneration);
    assert_eq!(failed.sections.len(), 50);
    let first_run: BTreeMap<usize, (chrono::DateTime<chrono::Utc>, f64)> = failed
        .sections
        .iter()
        .map(|s| (s.index, (s.generated_at, s.generation_cost_usd)))
        .collect();

    // "Restart": a fresh run against the same chapter id.
    run_chapter(&harness.app, chapter.id).await.unwrap();
    let resumed = reload(&harness.app, chapter.id);
    assert_eq!(resumed.status, ChapterStatus::Completed);
    assert_eq!(resumed.sections.len(), 100);
    assert!(resumed.version >= 1);

    // Sections 0..49 were not regenerated: identical timestamps and no
    // additional cost recorded against them.
    for section in resumed.sections.iter().filter(|s| s.index < 50) {
        let (generated_at, cost) = first_run[&section.index];
        assert_eq!(section.generated_at, generated_at);
        assert_eq!(section.generation_cost_usd, cost);
    }
}

// ── Scenario 5: breaker opens and recovers ───────────────────────────

#[tokio::test]
async fn breaker_opens_then_recovers_through_half_open() {
    // Part one: a slow-recovery breaker demonstrates the skip.
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    apex.fail_everything(FailAllMode::Transient);
    let mut config = test_config();
    config.breaker.recovery_timeout_seconds = 600;
    let harness = harness_with(config, vec![apex.clone()]);

    for _ in 0..5 {
        let err = harness
            .app
            .deps
            .router
            .generate_text("probe", TaskKind::ContentGeneration, None, 128, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
    }
    assert_eq!(
        harness.app.breaker.get_stats("apex").await.unwrap().state,
        CircuitState::Open
    );

    // Open breaker: the provider is skipped, not called.
    let calls_before = apex.counts().text;
    let err = harness
        .app
        .deps
        .router
        .generate_text("probe", TaskKind::ContentGeneration, None, 128, 0.7)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
    assert_eq!(apex.counts().text, calls_before);

    // Part two: with the recovery timeout elapsed (zero here), the next
    // check half-opens and two successes close the breaker.
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    apex.fail_everything(FailAllMode::Transient);
    let harness = harness_with(test_config(), vec![apex.clone()]);
    for _ in 0..5 {
        let _ = harness
            .app
            .deps
            .router
            .generate_text("probe", TaskKind::ContentGeneration, None, 128, 0.7)
            .await;
    }
    apex.heal();
    for _ in 0..2 {
        harness
            .app
            .deps
            .router
            .generate_text("probe", TaskKind::ContentGeneration, None, 128, 0.7)
            .await
            .unwrap();
    }
    assert_eq!(
        harness.app.breaker.get_stats("apex").await.unwrap().state,
        CircuitState::Closed
    );
}

// ── Scenario 6: cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancellation_mid_generation() {
    let apex = Arc::new(
        MockProvider::full("apex")
            .with_embedding_dim(DIM)
            .with_latency(Duration::from_millis(5)),
    );
    let harness = harness_with(single_provider_config(), vec![apex]);
    seed_corpus(&harness.app, 1).await;

    let chapter_id = harness
        .app
        .service
        .start_generation(
            "user-1",
            "Glioblastoma surgical management",
            GenerationOptions::default(),
        )
        .unwrap();
    let mut rx = harness.app.service.subscribe(chapter_id);

    // Wait for section generation to be visibly in flight.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for section_ready")
            .unwrap();
        if event.event == EventKind::SectionReady {
            break;
        }
    }
    harness.app.service.cancel(chapter_id).unwrap();

    // chapter_failed with kind=cancelled arrives within two seconds.
    let mut tail = Vec::new();
    let failed_event = loop {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no chapter_failed within 2s")
            .unwrap();
        if event.event == EventKind::ChapterFailed {
            break event;
        }
        tail.push(event);
    };
    assert_eq!(
        failed_event.data.as_ref().unwrap()["kind"],
        serde_json::json!("cancelled")
    );

    // Nothing further is emitted after the failure event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain_events(&mut rx).is_empty());

    // Wait for the spawned run to fully wind down.
    for _ in 0..100 {
        if !harness.app.service.is_running(chapter_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // No DLQ entry for a cancellation, and the stage is preserved for a
    // later resume.
    assert!(
        harness
            .app
            .dlq
            .list(&DlqFilter::default(), 10, 0)
            .await
            .unwrap()
            .is_empty()
    );
    let chapter = reload(&harness.app, chapter_id);
    assert_eq!(chapter.status, ChapterStatus::Failed);
    assert_eq!(chapter.current_stage, StageId::SectionGeneration);
}

// ── Idempotence & independence ───────────────────────────────────────

#[tokio::test]
async fn repeated_topics_get_independent_chapters() {
    let harness = full_harness();
    let a = harness
        .app
        .service
        .start_generation("user-1", "Cervical spine anatomy", GenerationOptions::default())
        .unwrap();
    let b = harness
        .app
        .service
        .start_generation("user-1", "Cervical spine anatomy", GenerationOptions::default())
        .unwrap();
    assert_ne!(a, b);

    for id in [a, b] {
        for _ in 0..2000 {
            if !harness.app.service.is_running(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reload(&harness.app, id).status, ChapterStatus::Completed);
    }
}

#[tokio::test]
async fn rerunning_a_completed_chapter_executes_nothing() {
    let harness = full_harness();
    let chapter = create_chapter(&harness.app, "Cervical spine anatomy");
    run_chapter(&harness.app, chapter.id).await.unwrap();

    let before = reload(&harness.app, chapter.id);
    let apex_calls = harness.apex.counts();
    let structura_calls = harness.structura.counts();

    run_chapter(&harness.app, chapter.id).await.unwrap();
    let after = reload(&harness.app, chapter.id);

    assert_eq!(harness.apex.counts().text, apex_calls.text);
    assert_eq!(harness.apex.counts().schema, apex_calls.schema);
    assert_eq!(harness.structura.counts().schema, structura_calls.schema);
    assert_eq!(
        serde_json::to_value(&before.stage_payloads).unwrap(),
        serde_json::to_value(&after.stage_payloads).unwrap()
    );
}

#[tokio::test]
async fn sequential_mode_produces_identical_sections() {
    let mut sequential_config = test_config();
    sequential_config.pipeline.parallel_section_generation = false;

    let parallel = full_harness();
    let sequential = harness_with(sequential_config, vec![
        Arc::new(MockProvider::full("apex").with_embedding_dim(DIM)),
        Arc::new(MockProvider::full("structura").with_embedding_dim(DIM)),
    ]);

    let chapter_p = create_chapter(&parallel.app, "Cervical spine anatomy");
    run_chapter(&parallel.app, chapter_p.id).await.unwrap();
    let chapter_s = create_chapter(&sequential.app, "Cervical spine anatomy");
    run_chapter(&sequential.app, chapter_s.id).await.unwrap();

    let content = |c: &Chapter| -> Vec<(String, String)> {
        c.sections
            .iter()
            .map(|s| (s.title.clone(), s.content.clone()))
            .collect()
    };
    assert_eq!(
        content(&reload(&parallel.app, chapter_p.id)),
        content(&reload(&sequential.app, chapter_s.id))
    );
}

#[tokio::test]
async fn regenerate_section_bumps_version_with_snapshot() {
    let harness = full_harness();
    seed_corpus(&harness.app, 1).await;
    let chapter = create_chapter(&harness.app, "Cervical spine anatomy");
    run_chapter(&harness.app, chapter.id).await.unwrap();
    let completed = reload(&harness.app, chapter.id);
    let old_section = completed.sections[3].clone();

    let new_version = harness
        .app
        .service
        .regenerate_section(
            chapter.id,
            3,
            vec![],
            Some("Emphasize complication avoidance".to_string()),
        )
        .await
        .unwrap();

    let updated = reload(&harness.app, chapter.id);
    assert_eq!(new_version, completed.version + 1);
    assert_eq!(updated.version, new_version);
    assert_eq!(updated.status, ChapterStatus::Completed);
    assert!(updated.sections[3].generated_at > old_section.generated_at);

    let versions = harness
        .app
        .deps
        .with_store(|store| store.list_versions(chapter.id))
        .unwrap();
    assert_eq!(versions.len(), 2);
    let current: Vec<u32> = versions
        .iter()
        .filter(|v| v.is_current)
        .map(|v| v.version)
        .collect();
    assert_eq!(current, vec![new_version]);
}

#[tokio::test]
async fn terminal_failure_produces_exactly_one_dlq_entry() {
    // Every provider in the input_valid chain (metadata_extraction:
    // structura then apex) violates the schema, which is terminal for the
    // stage and archived exactly once.
    let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(DIM));
    let structura = Arc::new(MockProvider::full("structura").with_embedding_dim(DIM));
    structura.push_schema(Scripted::Json(serde_json::json!({"bogus": 1})));
    apex.push_schema(Scripted::Json(serde_json::json!({"bogus": 2})));
    let harness = harness_with(test_config(), vec![apex, structura]);

    let chapter = create_chapter(&harness.app, "Glioblastoma surgical management");
    let err = run_chapter(&harness.app, chapter.id).await.unwrap_err();
    assert!(matches!(
        err,
        scribe::errors::StageError::Provider(ProviderError::SchemaViolation { .. })
    ));

    let failed = reload(&harness.app, chapter.id);
    assert_eq!(failed.status, ChapterStatus::Failed);
    assert_eq!(
        failed.failure_kind,
        Some(scribe::errors::ErrorKind::ProviderSchemaViolation)
    );

    let entries = harness
        .app
        .dlq
        .list(&DlqFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, chapter.id.to_string());
    assert_eq!(entries[0].task_name, "chapter_generation");
}

#[tokio::test]
async fn open_breakers_do_not_reach_the_dlq() {
    // All providers force-opened: generation fails as provider-unavailable
    // and is deliberately not archived.
    let mut config = test_config();
    config.breaker.recovery_timeout_seconds = 600;
    let harness = harness_with(config, vec![
        Arc::new(MockProvider::full("apex").with_embedding_dim(DIM)),
        Arc::new(MockProvider::full("structura").with_embedding_dim(DIM)),
    ]);
    for provider in ["apex", "structura"] {
        harness.app.breaker.force_open(provider).await.unwrap();
    }

    let chapter = create_chapter(&harness.app, "Glioblastoma surgical management");
    let err = run_chapter(&harness.app, chapter.id).await.unwrap_err();
    assert!(matches!(
        err,
        scribe::errors::StageError::Provider(ProviderError::Unavailable { .. })
    ));
    assert!(
        harness
            .app
            .dlq
            .list(&DlqFilter::default(), 10, 0)
            .await
            .unwrap()
            .is_empty()
    );
}
