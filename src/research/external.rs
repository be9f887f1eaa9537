//! External bibliographic retrieval with shared-cache reads and a
//! semaphore-bounded parallel fan-out.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::cache::QueryCache;
use crate::config::ResearchConfig;
use crate::errors::{ProviderError, StageError};
use crate::model::{SourceOrigin, SourceRef};

/// Same-query retries after an external rate limit.
const RATE_LIMIT_RETRIES: u32 = 3;
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(500);

/// The external bibliographic API (external collaborator).
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// Stable identifier used in cache keys.
    fn id(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        params: &serde_json::Value,
    ) -> Result<Vec<SourceRef>, ProviderError>;
}

/// Crossref-style works API over HTTP.
pub struct HttpBibliographicApi {
    base_url: String,
    client: reqwest::Client,
    rows: u32,
}

impl HttpBibliographicApi {
    pub fn new(base_url: impl Into<String>, rows: u32) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transient {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.into(),
            client,
            rows,
        })
    }

    fn parse_items(body: &serde_json::Value) -> Vec<SourceRef> {
        let Some(items) = body
            .pointer("/message/items")
            .and_then(|v| v.as_array())
        else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| {
                let doi = item.get("DOI")?.as_str()?.to_string();
                let title = item
                    .get("title")
                    .and_then(|t| t.as_array())
                    .and_then(|t| t.first())
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                if title.is_empty() {
                    return None;
                }
                let authors = item
                    .get("author")
                    .and_then(|a| a.as_array())
                    .map(|authors| {
                        authors
                            .iter()
                            .filter_map(|a| {
                                let family = a.get("family")?.as_str()?;
                                let given = a.get("given").and_then(|g| g.as_str()).unwrap_or("");
                                Some(format!("{given} {family}").trim().to_string())
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let year = item
                    .pointer("/issued/date-parts/0/0")
                    .and_then(|y| y.as_i64())
                    .map(|y| y as i32);
                let score = item
                    .get("score")
                    .and_then(|s| s.as_f64())
                    .map(|s| (s / 100.0).clamp(0.0, 1.0))
                    .unwrap_or(0.5);
                Some(SourceRef {
                    origin: SourceOrigin::ExternalPub,
                    stable_id: doi,
                    title,
                    authors,
                    year,
                    abstract_text: item
                        .get("abstract")
                        .and_then(|a| a.as_str())
                        .map(|a| a.to_string()),
                    relevance_score: score,
                    ai_relevance_score: None,
                    embedding: None,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ExternalSource for HttpBibliographicApi {
    fn id(&self) -> &str {
        "crossref"
    }

    async fn search(
        &self,
        query: &str,
        params: &serde_json::Value,
    ) -> Result<Vec<SourceRef>, ProviderError> {
        let rows = params
            .get("rows")
            .and_then(|r| r.as_u64())
            .unwrap_or(self.rows as u64);
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("query", query), ("rows", &rows.to_string())])
            .send()
            .await
            .map_err(|e| ProviderError::Transient {
                message: format!("external API transport error: {e}"),
            })?;

        match response.status().as_u16() {
            200 => {
                let body: serde_json::Value =
                    response.json().await.map_err(|e| ProviderError::Transient {
                        message: format!("unparseable external API body: {e}"),
                    })?;
                Ok(Self::parse_items(&body))
            }
            429 => Err(ProviderError::RateLimited { retry_after: None }),
            status if status >= 500 => Err(ProviderError::Transient {
                message: format!("external API returned {status}"),
            }),
            status => Err(ProviderError::Transient {
                message: format!("external API unexpected status {status}"),
            }),
        }
    }
}

/// Parallel, cached external retrieval.
pub struct ExternalResearch {
    source: Arc<dyn ExternalSource>,
    cache: QueryCache,
    budget: Arc<Semaphore>,
    config: ResearchConfig,
}

impl ExternalResearch {
    pub fn new(source: Arc<dyn ExternalSource>, cache: QueryCache, config: ResearchConfig) -> Self {
        Self {
            source,
            cache,
            budget: Arc::new(Semaphore::new(config.external_concurrency.max(1))),
            config,
        }
    }

    /// All queries in parallel under the provider budget; per-query cache
    /// consult first, rate-limit retries with exponential backoff.
    pub async fn search(&self, queries: &[String]) -> Result<Vec<SourceRef>, StageError> {
        let params = serde_json::json!({"rows": self.config.top_k});
        let searches = queries.iter().map(|query| self.search_one(query, &params));
        let per_query = futures::future::try_join_all(searches).await?;
        Ok(per_query.into_iter().flatten().collect())
    }

    async fn search_one(
        &self,
        query: &str,
        params: &serde_json::Value,
    ) -> Result<Vec<SourceRef>, StageError> {
        if let Some(cached) = self
            .cache
            .get(self.source.id(), query, params)
            .await
            .map_err(StageError::Store)?
        {
            let sources: Vec<SourceRef> =
                serde_json::from_value(cached).map_err(|e| StageError::PayloadParse {
                    stage: "research_external".to_string(),
                    message: e.to_string(),
                })?;
            tracing::debug!(query, hits = sources.len(), "external cache hit");
            return Ok(sources);
        }

        // Budget acquired only for the actual network call.
        let mut attempt = 0;
        let sources = loop {
            let permit = self
                .budget
                .acquire()
                .await
                .expect("external budget semaphore closed");
            let result = self.source.search(query, params).await;
            drop(permit);

            match result {
                Ok(sources) => break sources,
                Err(ProviderError::RateLimited { retry_after }) if attempt < RATE_LIMIT_RETRIES => {
                    attempt += 1;
                    let wait = retry_after.unwrap_or(RATE_LIMIT_BACKOFF * 2u32.pow(attempt - 1));
                    tracing::debug!(query, attempt, ?wait, "external API rate limited");
                    tokio::time::sleep(wait).await;
                }
                Err(err) => return Err(StageError::Provider(err)),
            }
        };

        self.cache
            .put(
                self.source.id(),
                query,
                params,
                serde_json::to_value(&sources).map_err(|e| StageError::PayloadParse {
                    stage: "research_external".to_string(),
                    message: e.to_string(),
                })?,
            )
            .await
            .map_err(StageError::Store)?;
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        rate_limit_first: AtomicU32,
    }

    impl CountingSource {
        fn new(rate_limit_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                rate_limit_first: AtomicU32::new(rate_limit_first),
            }
        }
    }

    #[async_trait]
    impl ExternalSource for CountingSource {
        fn id(&self) -> &str {
            "counting"
        }

        async fn search(
            &self,
            query: &str,
            _params: &serde_json::Value,
        ) -> Result<Vec<SourceRef>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limit_first.load(Ordering::SeqCst) > 0 {
                self.rate_limit_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::RateLimited {
                    retry_after: Some(Duration::from_millis(1)),
                });
            }
            Ok(vec![SourceRef {
                origin: SourceOrigin::ExternalPub,
                stable_id: format!("10.1000/{query}"),
                title: format!("Publication about {query}"),
                authors: vec!["Author A".to_string()],
                year: Some(2023),
                abstract_text: None,
                relevance_score: 0.8,
                ai_relevance_score: None,
                embedding: None,
            }])
        }
    }

    fn external_with(source: Arc<dyn ExternalSource>) -> ExternalResearch {
        let cache = QueryCache::new(Arc::new(MemoryKeyValueStore::new()), 7);
        ExternalResearch::new(source, cache, ResearchConfig::default())
    }

    #[tokio::test]
    async fn second_search_hits_the_cache() {
        let source = Arc::new(CountingSource::new(0));
        let external = external_with(source.clone());
        let queries = vec!["glioblastoma".to_string()];

        let first = external.search(&queries).await.unwrap();
        let second = external.search(&queries).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_backs_off_then_succeeds() {
        let source = Arc::new(CountingSource::new(2));
        let external = external_with(source.clone());
        let sources = external
            .search(&["meningioma".to_string()])
            .await
            .unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn queries_fan_out_and_concatenate() {
        let source = Arc::new(CountingSource::new(0));
        let external = external_with(source.clone());
        let queries = vec![
            "query one".to_string(),
            "query two".to_string(),
            "query three".to_string(),
        ];
        let sources = external.search(&queries).await.unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn crossref_items_parse_into_source_refs() {
        let body = serde_json::json!({
            "message": {
                "items": [
                    {
                        "DOI": "10.1000/xyz",
                        "title": ["Outcome after resection"],
                        "author": [{"given": "Ana", "family": "Silva"}],
                        "issued": {"date-parts": [[2022, 5]]},
                        "score": 85.0
                    },
                    {
                        "DOI": "10.1000/untitled",
                        "title": []
                    }
                ]
            }
        });
        let sources = HttpBibliographicApi::parse_items(&body);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].stable_id, "10.1000/xyz");
        assert_eq!(sources[0].authors, vec!["Ana Silva".to_string()]);
        assert_eq!(sources[0].year, Some(2022));
        assert!((sources[0].relevance_score - 0.85).abs() < 1e-9);
    }
}
