//! Research layer: ranked, deduplicated, relevance-filtered sources.
//!
//! Internal retrieval embeds each query and searches the chunk index;
//! external retrieval hits the bibliographic API through the shared cache.
//! Candidates then pass the AI relevance filter and deduplication before
//! the orchestrator persists them as stage payloads.

pub mod dedup;
pub mod external;
pub mod internal;
pub mod relevance;

pub use dedup::{DedupStrategy, deduplicate};
pub use external::{ExternalResearch, ExternalSource, HttpBibliographicApi};
pub use internal::{InternalResearch, MemoryVectorIndex, SqliteVectorIndex, VectorIndex};
pub use relevance::RelevanceFilter;

use std::sync::Arc;

use crate::config::ResearchConfig;
use crate::errors::StageError;
use crate::model::SourceRef;
use crate::providers::ProviderRouter;

/// Facade the orchestrator holds; composes the four research parts.
pub struct ResearchLayer {
    pub internal: InternalResearch,
    pub external: ExternalResearch,
    pub relevance: RelevanceFilter,
    config: ResearchConfig,
}

impl ResearchLayer {
    pub fn new(
        router: Arc<ProviderRouter>,
        index: Arc<dyn VectorIndex>,
        external_source: Arc<dyn ExternalSource>,
        cache: crate::cache::QueryCache,
        config: ResearchConfig,
    ) -> Self {
        Self {
            internal: InternalResearch::new(router.clone(), index, config.clone()),
            external: ExternalResearch::new(external_source, cache, config.clone()),
            relevance: RelevanceFilter::new(router, config.relevance_threshold),
            config,
        }
    }

    /// Internal vector retrieval across all queries, globally re-ranked.
    pub async fn search_internal(&self, queries: &[String]) -> Result<Vec<SourceRef>, StageError> {
        self.internal.search(queries).await
    }

    /// Cached external retrieval, relevance-filtered and deduplicated.
    pub async fn search_external(
        &self,
        queries: &[String],
        topic: &str,
        known: &[SourceRef],
    ) -> Result<Vec<SourceRef>, StageError> {
        let candidates = self.external.search(queries).await?;
        let filtered = self.relevance.filter(candidates, topic).await?;

        // Dedup within the external set and against already-known internal
        // sources, then return only the surviving external additions.
        let mut combined: Vec<SourceRef> = known.to_vec();
        combined.extend(filtered);
        let deduped = deduplicate(
            combined,
            DedupStrategy::Fuzzy,
            self.config.dedup_fuzzy_threshold,
        );
        Ok(deduped
            .into_iter()
            .filter(|s| !known.iter().any(|k| k.stable_id == s.stable_id))
            .collect())
    }
}
