//! Internal corpus retrieval: per-query embedding + vector similarity
//! search over committed document chunks.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Datelike;

use crate::config::ResearchConfig;
use crate::errors::{StageError, StoreError};
use crate::model::{Chunk, Document, SourceOrigin, SourceRef, cosine_similarity, recency_weight};
use crate::providers::ProviderRouter;
use crate::store::ChapterStore;

/// One similarity hit joined with its document metadata.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk: Chunk,
    pub document: Document,
    pub similarity: f64,
}

/// Vector-similarity engine over the chunk corpus (external collaborator;
/// the crate ships a brute-force implementation).
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The dimension every stored vector must have.
    fn dimension(&self) -> usize;

    /// Top-k chunks by cosine similarity, descending, at or above
    /// `threshold`. Only committed documents participate.
    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ChunkHit>, StoreError>;
}

/// Brute-force in-memory index for tests and small corpora.
pub struct MemoryVectorIndex {
    dimension: usize,
    entries: Mutex<Vec<(Chunk, Document)>>,
}

impl MemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, chunk: Chunk, document: Document) {
        self.entries.lock().unwrap().push((chunk, document));
    }
}

fn rank_hits(
    pairs: impl Iterator<Item = (Chunk, Document)>,
    embedding: &[f32],
    top_k: usize,
    threshold: f64,
) -> Vec<ChunkHit> {
    let mut hits: Vec<ChunkHit> = pairs
        .filter_map(|(chunk, document)| {
            let similarity = cosine_similarity(&chunk.embedding, embedding);
            (similarity >= threshold).then_some(ChunkHit {
                chunk,
                document,
                similarity,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    hits.truncate(top_k);
    hits
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let entries = self.entries.lock().unwrap().clone();
        Ok(rank_hits(entries.into_iter(), embedding, top_k, threshold))
    }
}

/// Index over the SQLite chunk table; brute-force cosine in process.
pub struct SqliteVectorIndex {
    store: Arc<Mutex<ChapterStore>>,
    dimension: usize,
}

impl SqliteVectorIndex {
    pub fn new(store: Arc<Mutex<ChapterStore>>, dimension: usize) -> Self {
        Self { store, dimension }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let store = self.store.lock().expect("chapter store lock poisoned");
        let chunks = store.committed_chunks()?;
        let mut documents: BTreeMap<String, Document> = BTreeMap::new();
        let mut pairs = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let document = match documents.get(&chunk.document_id) {
                Some(doc) => doc.clone(),
                None => {
                    let Some(doc) = store.get_document(&chunk.document_id)? else {
                        continue;
                    };
                    documents.insert(chunk.document_id.clone(), doc.clone());
                    doc
                }
            };
            pairs.push((chunk, document));
        }
        Ok(rank_hits(pairs.into_iter(), embedding, top_k, threshold))
    }
}

/// Runs the vector queries concurrently and re-ranks globally.
pub struct InternalResearch {
    router: Arc<ProviderRouter>,
    index: Arc<dyn VectorIndex>,
    config: ResearchConfig,
}

impl InternalResearch {
    pub fn new(
        router: Arc<ProviderRouter>,
        index: Arc<dyn VectorIndex>,
        config: ResearchConfig,
    ) -> Self {
        Self {
            router,
            index,
            config,
        }
    }

    /// Ranked internal sources across all queries. One SourceRef per
    /// document, carrying the best chunk similarity as its relevance.
    pub async fn search(&self, queries: &[String]) -> Result<Vec<SourceRef>, StageError> {
        if self.index.dimension() != self.config.vector_dim {
            return Err(StageError::Integrity(format!(
                "vector index dimension {} disagrees with configured vector_dim {}",
                self.index.dimension(),
                self.config.vector_dim
            )));
        }

        let searches = queries.iter().map(|query| {
            let router = self.router.clone();
            let index = self.index.clone();
            let top_k = self.config.top_k;
            let threshold = self.config.similarity_threshold;
            async move {
                let embedding = router.generate_embedding(query).await?;
                let hits = index
                    .search(&embedding.vector, top_k, threshold)
                    .await
                    .map_err(StageError::Store)?;
                Ok::<_, StageError>(hits)
            }
        });
        let per_query: Vec<Vec<ChunkHit>> = try_join_all(searches).await?;

        // Collapse chunk hits to one candidate per document, keeping the
        // best similarity seen for that document.
        let current_year = chrono::Utc::now().year();
        let mut best: BTreeMap<String, SourceRef> = BTreeMap::new();
        for hit in per_query.into_iter().flatten() {
            let blended = hit.similarity * recency_weight(hit.document.year, current_year);
            match best.get(&hit.document.id) {
                Some(existing) if existing.relevance_score >= blended => {}
                _ => {
                    best.insert(
                        hit.document.id.clone(),
                        SourceRef {
                            origin: SourceOrigin::InternalDoc,
                            stable_id: hit.document.id.clone(),
                            title: hit.document.title.clone(),
                            authors: hit.document.authors.clone(),
                            year: hit.document.year,
                            abstract_text: None,
                            relevance_score: blended,
                            ai_relevance_score: None,
                            embedding: Some(hit.chunk.embedding.clone()),
                        },
                    );
                }
            }
        }

        // Stable global order: score descending, document id ascending.
        let mut ranked: Vec<SourceRef> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.stable_id.cmp(&b.stable_id))
        });
        Ok(ranked)
    }
}
