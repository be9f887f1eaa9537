//! Document ingestion: five checkpointed phases per document.
//!
//! Phase order: extract text chunks, extract images, analyze images via
//! the vision chain, compute embeddings at the configured dimension, and
//! extract citation references. Each phase is a checkpoint step, so a
//! retried task resumes where the previous attempt stopped. A document
//! becomes visible to research only when the final commit flips its
//! status to `committed`.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, Mutex};

use crate::checkpoint::Checkpoint;
use crate::errors::{StageError, StoreError};
use crate::model::{Chunk, DocumentStatus, ImageRecord};
use crate::providers::ProviderRouter;
use crate::schemas::ImageAnalysis;
use crate::store::ChapterStore;
use crate::worker::{TaskContext, TaskHandler, TaskSpec};

/// Raw material pulled from the original file (external collaborator:
/// PDF byte extraction and OCR live behind this trait).
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Text split into page-attributed chunks.
    async fn extract_text(&self, document_id: &str) -> Result<Vec<(u32, String)>, StageError>;

    /// Images as (page, stored-bytes path).
    async fn extract_images(&self, document_id: &str) -> Result<Vec<(u32, String)>, StageError>;

    /// Raw bytes for one extracted image.
    async fn image_bytes(&self, bytes_path: &str) -> Result<Vec<u8>, StageError>;
}

pub struct IngestPipeline {
    store: Arc<Mutex<ChapterStore>>,
    router: Arc<ProviderRouter>,
    processor: Arc<dyn DocumentProcessor>,
    vector_dim: usize,
}

const PHASES: [&str; 5] = [
    "extract_text",
    "extract_images",
    "analyze_images",
    "compute_embeddings",
    "extract_citations",
];

impl IngestPipeline {
    pub fn new(
        store: Arc<Mutex<ChapterStore>>,
        router: Arc<ProviderRouter>,
        processor: Arc<dyn DocumentProcessor>,
        vector_dim: usize,
    ) -> Self {
        Self {
            store,
            router,
            processor,
            vector_dim,
        }
    }

    /// Run all five phases for one document, skipping completed ones.
    pub async fn ingest(
        &self,
        document_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), StageError> {
        self.with_store(|store| store.set_document_status(document_id, DocumentStatus::Processing))?;

        if !checkpoint.is_step_complete(PHASES[0]).await? {
            self.phase_extract_text(document_id).await?;
            checkpoint.mark_step_complete(PHASES[0], None).await?;
        }
        if !checkpoint.is_step_complete(PHASES[1]).await? {
            self.phase_extract_images(document_id).await?;
            checkpoint.mark_step_complete(PHASES[1], None).await?;
        }
        if !checkpoint.is_step_complete(PHASES[2]).await? {
            self.phase_analyze_images(document_id).await?;
            checkpoint.mark_step_complete(PHASES[2], None).await?;
        }
        if !checkpoint.is_step_complete(PHASES[3]).await? {
            self.phase_compute_embeddings(document_id).await?;
            checkpoint.mark_step_complete(PHASES[3], None).await?;
        }
        if !checkpoint.is_step_complete(PHASES[4]).await? {
            self.phase_extract_citations(document_id).await?;
            checkpoint.mark_step_complete(PHASES[4], None).await?;
        }

        self.with_store(|store| store.set_document_status(document_id, DocumentStatus::Committed))?;
        tracing::info!(document_id, "document committed");
        Ok(())
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&ChapterStore) -> Result<T, StoreError>,
    ) -> Result<T, StageError> {
        let store = self.store.lock().expect("chapter store lock poisoned");
        f(&store).map_err(StageError::Store)
    }

    async fn phase_extract_text(&self, document_id: &str) -> Result<(), StageError> {
        let pages = self.processor.extract_text(document_id).await?;
        self.with_store(|store| {
            for (i, (page, content)) in pages.iter().enumerate() {
                store.insert_chunk(&Chunk {
                    id: format!("{document_id}-chunk-{i}"),
                    document_id: document_id.to_string(),
                    page: *page,
                    content: content.clone(),
                    // Filled by the embedding phase.
                    embedding: Vec::new(),
                })?;
            }
            Ok(())
        })
    }

    async fn phase_extract_images(&self, document_id: &str) -> Result<(), StageError> {
        let images = self.processor.extract_images(document_id).await?;
        self.with_store(|store| {
            for (i, (page, bytes_path)) in images.iter().enumerate() {
                store.insert_image(&ImageRecord {
                    id: format!("{document_id}-img-{i}"),
                    document_id: document_id.to_string(),
                    page: *page,
                    bytes_path: bytes_path.clone(),
                    analysis: None,
                    relevance: 0.0,
                })?;
            }
            Ok(())
        })
    }

    async fn phase_analyze_images(&self, document_id: &str) -> Result<(), StageError> {
        let images = self.with_store(|store| store.images_for_document(document_id))?;
        for image in images {
            let bytes = self.processor.image_bytes(&image.bytes_path).await?;
            let analysis = self
                .router
                .analyze_image::<ImageAnalysis>(
                    &bytes,
                    "Describe this figure for a surgical reference chapter.",
                )
                .await?;
            self.with_store(|store| {
                store.update_image_analysis(&image.id, &analysis.data, 0.5)
            })?;
        }
        Ok(())
    }

    async fn phase_compute_embeddings(&self, document_id: &str) -> Result<(), StageError> {
        let chunks = self.with_store(|store| store.chunks_for_document(document_id))?;
        for chunk in chunks {
            if !chunk.embedding.is_empty() {
                continue;
            }
            let embedding = self.router.generate_embedding(&chunk.content).await?;
            if embedding.vector.len() != self.vector_dim {
                return Err(StageError::Integrity(format!(
                    "embedding dimension {} disagrees with configured vector_dim {}",
                    embedding.vector.len(),
                    self.vector_dim
                )));
            }
            self.with_store(|store| store.update_chunk_embedding(&chunk.id, &embedding.vector))?;
        }
        Ok(())
    }

    async fn phase_extract_citations(&self, document_id: &str) -> Result<(), StageError> {
        let chunks = self.with_store(|store| store.chunks_for_document(document_id))?;
        let text: String = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let citations = extract_citations(&text);
        self.with_store(|store| store.set_document_citations(document_id, &citations))
    }
}

/// Deterministic citation extraction: DOIs and "Author et al. (year)".
pub fn extract_citations(text: &str) -> Vec<String> {
    let doi = Regex::new(r"10\.\d{4,9}/[-._;()/:A-Za-z0-9]+").expect("static regex");
    let narrative = Regex::new(r"[A-Z][A-Za-z-]+ et al\.? \((19|20)\d{2}\)").expect("static regex");

    let mut citations: Vec<String> = Vec::new();
    for m in doi.find_iter(text).chain(narrative.find_iter(text)) {
        let mut citation = m.as_str().trim_end_matches(['.', ';', ',']).to_string();
        // DOIs swallow a closing paren from surrounding prose; strip any
        // unbalanced trailing ones.
        while citation.ends_with(')')
            && citation.matches('(').count() < citation.matches(')').count()
        {
            citation.pop();
        }
        if !citations.contains(&citation) {
            citations.push(citation);
        }
    }
    citations
}

/// Worker-runtime adapter: payload carries `{"document_id": ...}`.
pub struct IngestTaskHandler {
    pub pipeline: Arc<IngestPipeline>,
}

#[async_trait]
impl TaskHandler for IngestTaskHandler {
    async fn handle(&self, task: &TaskSpec, ctx: &TaskContext) -> Result<(), StageError> {
        let document_id = task
            .payload
            .get("document_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StageError::InvalidInput {
                reason: "ingest task payload is missing document_id".to_string(),
            })?;
        if ctx.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }
        self.pipeline.ingest(document_id, &ctx.checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::{BreakerConfig, ScribeConfig};
    use crate::model::Document;
    use crate::providers::Provider;
    use crate::providers::cost::CostLedger;
    use crate::providers::mock::MockProvider;
    use crate::store::MemoryKeyValueStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeProcessor {
        text_extractions: AtomicU32,
    }

    #[async_trait]
    impl DocumentProcessor for FakeProcessor {
        async fn extract_text(&self, _id: &str) -> Result<Vec<(u32, String)>, StageError> {
            self.text_extractions.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                (1, "The tentorial incisura transmits the brainstem. Smith et al. (2019) described the corridor.".to_string()),
                (2, "Outcomes were reported under doi 10.1000/j.spine.2021.004 in a large series.".to_string()),
            ])
        }

        async fn extract_images(&self, _id: &str) -> Result<Vec<(u32, String)>, StageError> {
            Ok(vec![(1, "/blobs/img-0".to_string())])
        }

        async fn image_bytes(&self, _path: &str) -> Result<Vec<u8>, StageError> {
            Ok(vec![0u8; 16])
        }
    }

    fn pipeline(dim: usize) -> (IngestPipeline, Arc<Mutex<ChapterStore>>, Arc<FakeProcessor>) {
        let store = Arc::new(Mutex::new(ChapterStore::new_in_memory().unwrap()));
        store
            .lock()
            .unwrap()
            .insert_document(&Document {
                id: "doc-1".to_string(),
                title: "Skull base atlas".to_string(),
                authors: vec![],
                year: Some(2021),
                status: DocumentStatus::Pending,
                citations: vec![],
                created_at: Utc::now(),
            })
            .unwrap();

        let mut config = ScribeConfig::default_with_providers();
        config.research.vector_dim = dim;
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryKeyValueStore::new()),
            BreakerConfig::default(),
        ));
        let apex = Arc::new(MockProvider::full("apex").with_embedding_dim(dim));
        let structura = Arc::new(MockProvider::full("structura").with_embedding_dim(dim));
        let router = Arc::new(ProviderRouter::new(
            vec![apex as Arc<dyn Provider>, structura as Arc<dyn Provider>],
            &config,
            breaker,
            Arc::new(CostLedger::new()),
        ));
        let processor = Arc::new(FakeProcessor {
            text_extractions: AtomicU32::new(0),
        });
        (
            IngestPipeline::new(store.clone(), router, processor.clone(), dim),
            store,
            processor,
        )
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(Arc::new(MemoryKeyValueStore::new()), "ingest:doc-1", 7)
    }

    #[tokio::test]
    async fn full_ingest_commits_the_document() {
        let (pipeline, store, _) = pipeline(8);
        pipeline.ingest("doc-1", &checkpoint()).await.unwrap();

        let store = store.lock().unwrap();
        let document = store.get_document("doc-1").unwrap().unwrap();
        assert_eq!(document.status, DocumentStatus::Committed);
        assert!(document.citations.iter().any(|c| c.contains("10.1000")));
        assert!(document.citations.iter().any(|c| c.contains("Smith et al")));

        let chunks = store.committed_chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.embedding.len() == 8));
    }

    #[tokio::test]
    async fn completed_phases_are_skipped_on_retry() {
        let (pipeline, _, processor) = pipeline(8);
        let cp = checkpoint();
        pipeline.ingest("doc-1", &cp).await.unwrap();
        assert_eq!(processor.text_extractions.load(Ordering::SeqCst), 1);

        // Re-running with the same checkpoint re-executes nothing.
        pipeline.ingest("doc-1", &cp).await.unwrap();
        assert_eq!(processor.text_extractions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_ingestion() {
        // Mock embeds at 16 while the pipeline is configured for 8.
        let (pipeline, store, _) = {
            let (p, s, proc_) = pipeline(16);
            (
                IngestPipeline::new(p.store.clone(), p.router.clone(), proc_, 8),
                s,
                (),
            )
        };
        let err = pipeline.ingest("doc-1", &checkpoint()).await.unwrap_err();
        assert!(matches!(err, StageError::Integrity(_)));
        let store = store.lock().unwrap();
        let document = store.get_document("doc-1").unwrap().unwrap();
        assert_ne!(document.status, DocumentStatus::Committed);
    }

    #[test]
    fn citation_extraction_is_deterministic_and_deduplicated() {
        let text = "As shown (10.1000/abc.123), and again 10.1000/abc.123; \
                    Jones et al. (2020) agreed. Brown et al (2018) differed.";
        let citations = extract_citations(text);
        assert_eq!(
            citations,
            vec![
                "10.1000/abc.123".to_string(),
                "Jones et al. (2020)".to_string(),
                "Brown et al (2018)".to_string(),
            ]
        );
    }
}
