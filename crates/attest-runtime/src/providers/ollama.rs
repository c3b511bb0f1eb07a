//! Ollama local inference provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{factory::ProviderFactory, send_json, LlmProvider, ProviderConfig, ProviderError};
use attest_core::ProviderKind;

/// Model used when the payload does not name one.
pub const OLLAMA_DEFAULT_MODEL: &str = "llama3";

/// Provider for an Ollama-style `/api/generate` endpoint. No credential.
#[derive(Debug)]
pub struct OllamaProvider {
    name: String,
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn from_config(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name().to_string(),
            base_url: config
                .base_url()
                .unwrap_or("http://localhost:11434")
                .to_string(),
            model: config
                .descriptor
                .model
                .clone()
                .unwrap_or_else(|| OLLAMA_DEFAULT_MODEL.to_string()),
            timeout: config.timeout,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let body = send_json(
            self.client
                .post(format!("{}/api/generate", self.base_url))
                .json(&request),
            self.timeout,
        )
        .await?;

        let parsed: GenerateResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(parsed.response)
    }

    async fn health_check(&self) -> bool {
        !self.base_url.is_empty()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for Ollama providers.
pub struct OllamaProviderFactory;

impl ProviderFactory for OllamaProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn create(
        &self,
        config: &ProviderConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OllamaProvider::from_config(config, client.clone())))
    }

    fn default_model(&self) -> Option<&'static str> {
        Some(OLLAMA_DEFAULT_MODEL)
    }

    fn description(&self) -> &'static str {
        "Ollama local inference provider"
    }
}
