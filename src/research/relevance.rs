//! AI relevance filter: score each research candidate against the user's
//! topic and drop the ones below threshold.

use futures::StreamExt;
use std::sync::Arc;

use crate::errors::StageError;
use crate::model::SourceRef;
use crate::providers::{ProviderRouter, TaskKind};
use crate::schemas::SourceRelevance;

/// Concurrent scoring calls in flight.
const SCORING_CONCURRENCY: usize = 8;

pub struct RelevanceFilter {
    router: Arc<ProviderRouter>,
    threshold: f64,
}

impl RelevanceFilter {
    pub fn new(router: Arc<ProviderRouter>, threshold: f64) -> Self {
        Self { router, threshold }
    }

    /// Score every candidate and keep those at or above the threshold,
    /// preserving input order. An empty input returns an empty output
    /// immediately, with no provider calls and no proportion logging.
    pub async fn filter(
        &self,
        candidates: Vec<SourceRef>,
        topic: &str,
    ) -> Result<Vec<SourceRef>, StageError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let total = candidates.len();

        let scored: Vec<Result<SourceRef, StageError>> = futures::stream::iter(
            candidates.into_iter().map(|candidate| {
                let router = self.router.clone();
                let topic = topic.to_string();
                async move {
                    let prompt = relevance_prompt(&topic, &candidate);
                    let scored = router
                        .generate_with_schema::<SourceRelevance>(
                            &prompt,
                            TaskKind::MetadataExtraction,
                            0.1,
                        )
                        .await?;
                    let mut candidate = candidate;
                    candidate.ai_relevance_score = Some(scored.data.relevance_score);
                    Ok(candidate)
                }
            }),
        )
        .buffered(SCORING_CONCURRENCY)
        .collect()
        .await;

        let mut kept = Vec::with_capacity(total);
        for result in scored {
            let candidate = result?;
            if candidate.ai_relevance_score.unwrap_or(0.0) >= self.threshold {
                kept.push(candidate);
            }
        }
        tracing::debug!(
            kept = kept.len(),
            total,
            share = kept.len() as f64 / total as f64,
            "relevance filter applied"
        );
        Ok(kept)
    }
}

fn relevance_prompt(topic: &str, candidate: &SourceRef) -> String {
    let mut prompt = format!(
        "Chapter topic: {topic}\n\nCandidate source:\nTitle: {}\n",
        candidate.title
    );
    if !candidate.authors.is_empty() {
        prompt.push_str(&format!("Authors: {}\n", candidate.authors.join(", ")));
    }
    if let Some(year) = candidate.year {
        prompt.push_str(&format!("Year: {year}\n"));
    }
    if let Some(abstract_text) = &candidate.abstract_text {
        prompt.push_str(&format!("Abstract: {abstract_text}\n"));
    }
    prompt.push_str(
        "\nScore how relevant this source is to the chapter topic on [0,1] \
         and explain the score in one sentence.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::{BreakerConfig, ScribeConfig};
    use crate::model::SourceOrigin;
    use crate::providers::Provider;
    use crate::providers::cost::CostLedger;
    use crate::providers::mock::{MockProvider, Scripted};
    use crate::store::MemoryKeyValueStore;

    fn filter_with(mock: Arc<MockProvider>, threshold: f64) -> RelevanceFilter {
        let config = ScribeConfig::default_with_providers();
        let breaker = Arc::new(CircuitBreaker::new(
            Arc::new(MemoryKeyValueStore::new()),
            BreakerConfig::default(),
        ));
        let router = Arc::new(ProviderRouter::new(
            vec![mock as Arc<dyn Provider>],
            &config,
            breaker,
            Arc::new(CostLedger::new()),
        ));
        RelevanceFilter::new(router, threshold)
    }

    fn candidate(id: &str) -> SourceRef {
        SourceRef {
            origin: SourceOrigin::ExternalPub,
            stable_id: id.to_string(),
            title: format!("Candidate {id}"),
            authors: vec![],
            year: Some(2020),
            abstract_text: None,
            relevance_score: 0.7,
            ai_relevance_score: None,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn empty_input_returns_empty_without_provider_calls() {
        let mock = Arc::new(MockProvider::full("structura"));
        let filter = filter_with(mock.clone(), 0.75);
        let out = filter.filter(Vec::new(), "Cervical spine anatomy").await.unwrap();
        assert!(out.is_empty());
        assert_eq!(mock.counts().schema, 0);
    }

    #[tokio::test]
    async fn candidates_below_threshold_are_dropped() {
        let mock = Arc::new(MockProvider::full("structura"));
        mock.push_schema(Scripted::Json(serde_json::json!({
            "relevance_score": 0.95, "reason": "on topic"
        })));
        mock.push_schema(Scripted::Json(serde_json::json!({
            "relevance_score": 0.3, "reason": "tangential"
        })));
        let filter = filter_with(mock, 0.75);
        let out = filter
            .filter(vec![candidate("a"), candidate("b")], "topic")
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stable_id, "a");
        assert_eq!(out[0].ai_relevance_score, Some(0.95));
    }

    #[tokio::test]
    async fn output_preserves_input_order() {
        let mock = Arc::new(MockProvider::full("structura"));
        let filter = filter_with(mock, 0.5);
        let input: Vec<SourceRef> = (0..6).map(|i| candidate(&format!("s{i}"))).collect();
        let out = filter.filter(input, "topic").await.unwrap();
        let ids: Vec<&str> = out.iter().map(|s| s.stable_id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4", "s5"]);
    }
}
