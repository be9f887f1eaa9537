//! HTTP provider client over an OpenAI-compatible wire format.
//!
//! One thin transport per configured provider; the router owns every retry
//! and fallback decision, so this client maps each HTTP outcome onto the
//! provider error taxonomy and nothing more:
//! 401/403 → auth, 429 → rate-limited (honoring Retry-After), 5xx and
//! transport errors → transient, unparseable structured output → schema
//! violation.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use std::time::Duration;

use super::{
    Capability, EmbeddingResponse, Provider, SchemaRequest, SchemaResponse, TextRequest,
    TextResponse, TokenUsage, VisionRequest,
};
use crate::config::ProviderConfig;
use crate::errors::ProviderError;

pub struct HttpProvider {
    id: String,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: Option<String>,
    embedding_dim: Option<usize>,
    capabilities: Vec<Capability>,
    strict_schema: bool,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingCompletion {
    data: Vec<WireEmbedding>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl HttpProvider {
    /// Build from config; the API key is read from the named environment
    /// variable and never logged.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| ProviderError::Auth {
            message: format!("environment variable {} is not set", config.api_key_env),
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Transient {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dim: config.embedding_dim,
            capabilities: config.capabilities.clone(),
            strict_schema: config.strict_schema,
            client,
        })
    }

    fn classify_transport(err: reqwest::Error) -> ProviderError {
        ProviderError::Transient {
            message: if err.is_timeout() {
                "request timed out".to_string()
            } else {
                format!("transport error: {err}")
            },
        }
    }

    /// Map a non-success status onto the error taxonomy.
    fn classify_status(status: reqwest::StatusCode, retry_after: Option<Duration>) -> ProviderError {
        match status.as_u16() {
            401 | 403 => ProviderError::Auth {
                message: format!("provider rejected credentials ({status})"),
            },
            429 => ProviderError::RateLimited { retry_after },
            code if code >= 500 => ProviderError::Transient {
                message: format!("provider returned {status}"),
            },
            _ => ProviderError::Transient {
                message: format!("unexpected status {status}"),
            },
        }
    }

    fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }

    async fn post_chat(
        &self,
        body: serde_json::Value,
    ) -> Result<ChatCompletion, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            let retry_after = Self::parse_retry_after(&response);
            return Err(Self::classify_status(response.status(), retry_after));
        }
        response
            .json::<ChatCompletion>()
            .await
            .map_err(|e| ProviderError::Transient {
                message: format!("unparseable completion body: {e}"),
            })
    }

    fn first_choice(completion: &ChatCompletion) -> Result<&str, ProviderError> {
        completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ProviderError::Transient {
                message: "completion contained no choices".to_string(),
            })
    }

    fn usage_of(completion: &ChatCompletion) -> TokenUsage {
        let usage = completion.usage.as_ref();
        TokenUsage {
            tokens_in: usage.map(|u| u.prompt_tokens).unwrap_or(0),
            tokens_out: usage.map(|u| u.completion_tokens).unwrap_or(0),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn embedding_dim(&self) -> Option<usize> {
        self.embedding_dim
    }

    async fn generate_text(&self, request: &TextRequest) -> Result<TextResponse, ProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));

        let completion = self
            .post_chat(serde_json::json!({
                "model": self.model,
                "messages": messages,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
            }))
            .await?;

        Ok(TextResponse {
            text: Self::first_choice(&completion)?.to_string(),
            usage: Self::usage_of(&completion),
        })
    }

    async fn generate_with_schema(
        &self,
        request: &SchemaRequest,
    ) -> Result<SchemaResponse, ProviderError> {
        let response_format = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "schema": request.schema,
                "strict": self.strict_schema,
            }
        });
        let completion = self
            .post_chat(serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": request.prompt}],
                "temperature": request.temperature,
                "response_format": response_format,
            }))
            .await?;

        let raw_text = Self::first_choice(&completion)?.to_string();
        let data: serde_json::Value =
            serde_json::from_str(&raw_text).map_err(|e| ProviderError::SchemaViolation {
                schema: request.schema_name.clone(),
                message: format!("response is not JSON: {e}"),
            })?;
        Ok(SchemaResponse {
            data,
            raw_text,
            usage: Self::usage_of(&completion),
        })
    }

    async fn generate_embedding(&self, text: &str) -> Result<EmbeddingResponse, ProviderError> {
        let model = self
            .embedding_model
            .as_ref()
            .ok_or_else(|| ProviderError::MissingCapability {
                provider: self.id.clone(),
                capability: "embedding".to_string(),
            })?;
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({"model": model, "input": text}))
            .send()
            .await
            .map_err(Self::classify_transport)?;

        if !response.status().is_success() {
            let retry_after = Self::parse_retry_after(&response);
            return Err(Self::classify_status(response.status(), retry_after));
        }
        let completion: EmbeddingCompletion =
            response.json().await.map_err(|e| ProviderError::Transient {
                message: format!("unparseable embedding body: {e}"),
            })?;
        let vector = completion
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| ProviderError::Transient {
                message: "embedding response contained no vectors".to_string(),
            })?;
        Ok(EmbeddingResponse {
            vector,
            tokens: completion.usage.map(|u| u.prompt_tokens).unwrap_or(0),
        })
    }

    async fn analyze_image(
        &self,
        request: &VisionRequest,
    ) -> Result<SchemaResponse, ProviderError> {
        let data = BASE64.encode(&request.image_bytes);
        let content = serde_json::json!([
            {"type": "text", "text": request.prompt},
            {"type": "image_url", "image_url": {
                "url": format!("data:image/png;base64,{data}")
            }}
        ]);
        let response_format = serde_json::json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema_name,
                "schema": request.schema,
                "strict": self.strict_schema,
            }
        });
        let completion = self
            .post_chat(serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": content}],
                "response_format": response_format,
            }))
            .await?;
        let raw_text = Self::first_choice(&completion)?.to_string();
        let data: serde_json::Value =
            serde_json::from_str(&raw_text).map_err(|e| ProviderError::SchemaViolation {
                schema: request.schema_name.clone(),
                message: format!("response is not JSON: {e}"),
            })?;
        Ok(SchemaResponse {
            data,
            raw_text,
            usage: Self::usage_of(&completion),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_the_taxonomy() {
        assert!(matches!(
            HttpProvider::classify_status(reqwest::StatusCode::UNAUTHORIZED, None),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            HttpProvider::classify_status(reqwest::StatusCode::FORBIDDEN, None),
            ProviderError::Auth { .. }
        ));
        match HttpProvider::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
        ) {
            ProviderError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)));
            }
            other => panic!("Expected RateLimited, got {other:?}"),
        }
        assert!(matches!(
            HttpProvider::classify_status(reqwest::StatusCode::BAD_GATEWAY, None),
            ProviderError::Transient { .. }
        ));
    }

    #[test]
    fn from_config_requires_the_api_key_env() {
        let config = ProviderConfig {
            id: "apex".to_string(),
            base_url: "https://api.apex.example/v1/".to_string(),
            api_key_env: "SCRIBE_TEST_DEFINITELY_UNSET_KEY".to_string(),
            model: "apex-large".to_string(),
            embedding_model: None,
            embedding_dim: None,
            capabilities: vec![Capability::Text],
            rate_in_per_1k_usd: 0.01,
            rate_out_per_1k_usd: 0.03,
            strict_schema: true,
            timeout_secs: 5,
        };
        let err = HttpProvider::from_config(&config).unwrap_err();
        assert!(matches!(err, ProviderError::Auth { .. }));
    }
}
