//! Task-aware provider routing with fallback, breaker consultation, and
//! schema enforcement.
//!
//! For a task with chain [P1..Pk] the router walks the chain in order,
//! skipping providers whose breaker is open or that lack the required
//! capability. Auth failures stop the walk (configuration problem); rate
//! limits retry the same provider a bounded number of times; everything
//! else falls through to the next provider. Schema-constrained responses
//! are validated here, so callers never see malformed structured output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::config::ScribeConfig;
use crate::errors::ProviderError;
use crate::schemas::{SchemaContract, validate_and_parse};

use super::cost::{CallMetric, CostLedger, TokenRates};
use super::{
    Capability, Provider, SchemaRequest, SchemaResponse, TaskKind, TextRequest, TextResponse,
    VisionRequest,
};

/// Same-provider retries after a rate-limit response.
const RATE_LIMIT_RETRIES: u32 = 2;
/// Backoff base when the provider gave no Retry-After.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(500);

/// Result of a routed plain-text call.
#[derive(Debug, Clone)]
pub struct RoutedText {
    pub text: String,
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Result of a routed schema-constrained call; `data` is guaranteed to
/// validate against `T`'s schema.
#[derive(Debug, Clone)]
pub struct RoutedData<T> {
    pub data: T,
    pub raw_text: String,
    pub provider: String,
    pub cost_usd: f64,
    pub schema_name: &'static str,
}

#[derive(Debug, Clone)]
pub struct RoutedEmbedding {
    pub vector: Vec<f32>,
    pub provider: String,
    pub tokens: u64,
    pub cost_usd: f64,
}

pub struct ProviderRouter {
    providers: BTreeMap<String, Arc<dyn Provider>>,
    chains: BTreeMap<TaskKind, Vec<String>>,
    rates: BTreeMap<String, TokenRates>,
    breaker: Arc<CircuitBreaker>,
    ledger: Arc<CostLedger>,
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        config: &ScribeConfig,
        breaker: Arc<CircuitBreaker>,
        ledger: Arc<CostLedger>,
    ) -> Self {
        let rates = config
            .providers
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    TokenRates {
                        in_per_1k_usd: p.rate_in_per_1k_usd,
                        out_per_1k_usd: p.rate_out_per_1k_usd,
                    },
                )
            })
            .collect();
        let chains = TaskKind::ALL
            .iter()
            .map(|task| (*task, config.chain_for(*task).to_vec()))
            .collect();
        Self {
            providers: providers.into_iter().map(|p| (p.id().to_string(), p)).collect(),
            chains,
            rates,
            breaker,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    fn chain(&self, task: TaskKind) -> &[String] {
        self.chains.get(&task).map(|c| c.as_slice()).unwrap_or(&[])
    }

    fn rates_for(&self, provider: &str) -> TokenRates {
        self.rates.get(provider).copied().unwrap_or(TokenRates {
            in_per_1k_usd: 0.0,
            out_per_1k_usd: 0.0,
        })
    }

    fn record_metric(
        &self,
        provider: &str,
        task: TaskKind,
        usage: super::TokenUsage,
        started: Instant,
    ) -> f64 {
        let cost_usd = self.rates_for(provider).cost_of(usage);
        self.ledger.record(CallMetric {
            provider: provider.to_string(),
            task,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_usd,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        cost_usd
    }

    /// Walk the chain, applying the per-failure-kind policy. `attempt` runs
    /// one call against one provider and reports the result to the breaker.
    async fn route<T, F>(
        &self,
        task: TaskKind,
        capability: Capability,
        attempt: F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(
            Arc<dyn Provider>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T, ProviderError>> + Send>,
        >,
    {
        let chain = self.chain(task);
        if chain.is_empty() {
            return Err(ProviderError::Unavailable {
                task: task.as_str().to_string(),
            });
        }

        // Distinguish "every breaker was open" (provider-unavailable, not
        // archived) from "providers were attempted and failed" (the last
        // real failure surfaces so the caller's retry/DLQ policy applies).
        let mut last_error: Option<ProviderError> = None;

        for provider_id in chain {
            let Some(provider) = self.providers.get(provider_id) else {
                tracing::warn!(provider = %provider_id, "chain references unknown provider");
                continue;
            };
            if !provider.has_capability(capability) {
                continue;
            }
            if !self.breaker.is_call_allowed(provider_id).await.unwrap_or(true) {
                tracing::debug!(provider = %provider_id, task = %task, "breaker open, skipping");
                continue;
            }

            let mut rate_limit_attempts = 0;
            loop {
                match attempt(provider.clone()).await {
                    Ok(value) => {
                        let _ = self.breaker.record_success(provider_id).await;
                        return Ok(value);
                    }
                    Err(err) => {
                        let _ = self.breaker.record_failure(provider_id).await;
                        match err {
                            ProviderError::Auth { .. } => {
                                // Configuration error: do not fall back.
                                tracing::error!(provider = %provider_id, "auth failure, stopping chain");
                                return Err(err);
                            }
                            ProviderError::RateLimited { retry_after }
                                if rate_limit_attempts < RATE_LIMIT_RETRIES =>
                            {
                                rate_limit_attempts += 1;
                                let wait = retry_after.unwrap_or(
                                    RATE_LIMIT_BACKOFF * 2u32.pow(rate_limit_attempts - 1),
                                );
                                tracing::debug!(
                                    provider = %provider_id,
                                    attempt = rate_limit_attempts,
                                    ?wait,
                                    "rate limited, retrying same provider"
                                );
                                tokio::time::sleep(wait).await;
                                continue;
                            }
                            _ => {
                                // Transient, schema violation, or exhausted
                                // rate-limit budget: fall through the chain.
                                tracing::debug!(
                                    provider = %provider_id,
                                    task = %task,
                                    error = %err,
                                    "provider failed, falling back"
                                );
                                last_error = Some(err);
                                break;
                            }
                        }
                    }
                }
            }
        }

        Err(last_error.unwrap_or(ProviderError::Unavailable {
            task: task.as_str().to_string(),
        }))
    }

    /// Plain text generation via the task's chain.
    pub async fn generate_text(
        &self,
        prompt: &str,
        task: TaskKind,
        system_prompt: Option<&str>,
        max_tokens: u32,
        temperature: f64,
    ) -> Result<RoutedText, ProviderError> {
        let request = TextRequest {
            prompt: prompt.to_string(),
            system_prompt: system_prompt.map(|s| s.to_string()),
            max_tokens,
            temperature,
        };
        let started = Instant::now();
        let (provider_id, response): (String, TextResponse) = self
            .route(task, Capability::Text, move |provider| {
                let request = request.clone();
                Box::pin(async move {
                    let response = provider.generate_text(&request).await?;
                    Ok((provider.id().to_string(), response))
                })
            })
            .await?;
        let cost_usd = self.record_metric(&provider_id, task, response.usage, started);
        Ok(RoutedText {
            text: response.text,
            provider: provider_id,
            tokens_in: response.usage.tokens_in,
            tokens_out: response.usage.tokens_out,
            cost_usd,
        })
    }

    /// Schema-constrained generation. Only providers advertising
    /// `text_with_schema` are eligible; the returned payload has already
    /// been validated against `T`'s schema.
    pub async fn generate_with_schema<T: SchemaContract>(
        &self,
        prompt: &str,
        task: TaskKind,
        temperature: f64,
    ) -> Result<RoutedData<T>, ProviderError> {
        let request = SchemaRequest {
            prompt: prompt.to_string(),
            schema_name: T::NAME.to_string(),
            schema: <T as SchemaContract>::json_schema(),
            temperature,
        };
        let started = Instant::now();
        let (provider_id, parsed, response): (String, T, SchemaResponse) = self
            .route(task, Capability::TextWithSchema, move |provider| {
                let request = request.clone();
                Box::pin(async move {
                    let response = provider.generate_with_schema(&request).await?;
                    // An invalid payload is a provider failure for breaker and
                    // fallback purposes, caught here inside the chain walk.
                    let parsed = validate_and_parse::<T>(&response.data)?;
                    Ok((provider.id().to_string(), parsed, response))
                })
            })
            .await?;
        let cost_usd = self.record_metric(&provider_id, task, response.usage, started);
        Ok(RoutedData {
            data: parsed,
            raw_text: response.raw_text,
            provider: provider_id,
            cost_usd,
            schema_name: T::NAME,
        })
    }

    /// Embedding generation via the embedding chain.
    pub async fn generate_embedding(&self, text: &str) -> Result<RoutedEmbedding, ProviderError> {
        let started = Instant::now();
        let owned = text.to_string();
        let (provider_id, response) = self
            .route(TaskKind::Embedding, Capability::Embedding, |provider| {
                let owned = &owned;
                Box::pin(async move {
                    let response = provider.generate_embedding(owned).await?;
                    Ok((provider.id().to_string(), response))
                })
            })
            .await?;
        let usage = super::TokenUsage {
            tokens_in: response.tokens,
            tokens_out: 0,
        };
        let cost_usd = self.record_metric(&provider_id, TaskKind::Embedding, usage, started);
        Ok(RoutedEmbedding {
            vector: response.vector,
            provider: provider_id,
            tokens: response.tokens,
            cost_usd,
        })
    }

    /// Vision analysis; the result validates against `T`.
    pub async fn analyze_image<T: SchemaContract>(
        &self,
        image_bytes: &[u8],
        prompt: &str,
    ) -> Result<RoutedData<T>, ProviderError> {
        let request = VisionRequest {
            image_bytes: image_bytes.to_vec(),
            prompt: prompt.to_string(),
            schema_name: T::NAME.to_string(),
            schema: <T as SchemaContract>::json_schema(),
        };
        let started = Instant::now();
        let (provider_id, parsed, response): (String, T, SchemaResponse) = self
            .route(TaskKind::Vision, Capability::Vision, |provider| {
                let request = &request;
                Box::pin(async move {
                    let response = provider.analyze_image(request).await?;
                    let parsed = validate_and_parse::<T>(&response.data)?;
                    Ok((provider.id().to_string(), parsed, response))
                })
            })
            .await?;
        let cost_usd = self.record_metric(&provider_id, TaskKind::Vision, response.usage, started);
        Ok(RoutedData {
            data: parsed,
            raw_text: response.raw_text,
            provider: provider_id,
            cost_usd,
            schema_name: T::NAME,
        })
    }
}
