//! Ollama embedding gateway
//!
//! Calls `POST /api/embeddings` for vectors and `GET /api/tags` as the
//! health probe.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::config::OllamaConfig;
use crate::errors::{EmbedError, ProviderError, Result};
use crate::provider::{Embedding, EmbeddingProvider};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// HTTP client for the Ollama embeddings API
pub struct OllamaProvider {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|e| EmbedError::Config(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(
            target: "embedline.provider",
            base_url = %config.base_url,
            model = %config.model,
            timeout_ms = config.timeout_ms,
            "initialized Ollama embedding provider"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn embed(&self, text: &str) -> std::result::Result<Embedding, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::Permanent("cannot embed blank text".to_string()));
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("Failed to parse response: {}", e)))?;

        if parsed.embedding.is_empty() {
            return Err(ProviderError::Permanent(format!(
                "Ollama returned an empty embedding for model '{}'",
                self.model
            )));
        }

        tracing::debug!(
            target: "embedline.provider",
            model = %self.model,
            dimensions = parsed.embedding.len(),
            "generated embedding"
        );

        Ok(Embedding {
            vector: parsed.embedding,
            model: self.model.clone(),
        })
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(
                    target: "embedline.provider",
                    error = %e,
                    "Ollama health check failed"
                );
                false
            }
        }
    }
}

fn classify_request_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderError::Transient(format!("Failed to connect to Ollama: {}", err))
    } else {
        ProviderError::Permanent(format!("Ollama request failed: {}", err))
    }
}

/// 429 and 5xx may clear up on their own; any other error status will not
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = if body.trim().is_empty() {
        format!("Ollama API error: {}", status)
    } else {
        format!("Ollama API error: {}: {}", status, body.trim())
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> OllamaConfig {
        OllamaConfig {
            enabled: true,
            base_url: "http://127.0.0.1:9/".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_ms: 2_000,
        }
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "oops").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "model not found").is_transient());
    }

    #[test]
    fn test_status_message_includes_body() {
        let err = classify_status(StatusCode::NOT_FOUND, " model 'x' not found ");
        assert!(err.message().ends_with("model 'x' not found"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = OllamaProvider::new(&unreachable_config()).unwrap();
        assert_eq!(provider.base_url, "http://127.0.0.1:9");
        assert_eq!(provider.model(), "nomic-embed-text");
    }

    #[tokio::test]
    async fn test_blank_text_is_permanent() {
        let provider = OllamaProvider::new(&unreachable_config()).unwrap();
        let err = provider.embed("   ").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let provider = OllamaProvider::new(&unreachable_config()).unwrap();
        let err = provider.embed("hello").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(!provider.health_check().await);
    }
}
