//! Anthropic messages API provider.
//!
//! ## Security
//!
//! This provider uses the centralized [`ApiCredential`] system for secure
//! credential handling. See the [`secrets`](super::secrets) module for details.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{
    factory::ProviderFactory, require_credential, send_json, ApiCredential, LlmProvider,
    ProviderConfig, ProviderError,
};
use attest_core::ProviderKind;

/// Model used when the payload does not name one.
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const MAX_TOKENS: u32 = 1024;

/// Anthropic provider.
///
/// # Security
///
/// The API key is stored using [`ApiCredential`] which:
/// - Cannot be accidentally printed via `Debug` or `Display`
/// - Is zeroed on drop
/// - Must be explicitly exposed via `.expose()` when needed
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    model: String,
    credential: Option<ApiCredential>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn from_config(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name().to_string(),
            base_url: config
                .base_url()
                .unwrap_or("https://api.anthropic.com/v1")
                .to_string(),
            model: config
                .descriptor
                .model
                .clone()
                .unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
            credential: config.credential.clone(),
            timeout: config.timeout,
            client,
        }
    }
}

/// Anthropic API request format.
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Anthropic API response format.
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlockResponse>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockResponse {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let credential = require_credential(self.credential.as_ref(), "Anthropic")?;

        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
        };

        // SECURITY: Only expose the credential here, at the point of use
        let body = send_json(
            self.client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", credential.expose())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request),
            self.timeout,
        )
        .await?;

        let parsed: AnthropicResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let texts: Vec<String> = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();
        if texts.is_empty() {
            return Err(ProviderError::ParseError(
                "response has no text blocks".to_string(),
            ));
        }
        Ok(texts.join(""))
    }

    async fn health_check(&self) -> bool {
        // Verify the key is set without logging the value
        self.credential.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for creating Anthropic providers from configuration.
///
/// ## Configuration Format
/// ```json
/// {
///   "type": "anthropic",
///   "api_key": "sk-ant-...",     // Optional, falls back to ANTHROPIC_API_KEY env
///   "base_url": "https://...",   // Optional, custom API endpoint
///   "model": "claude-3-5-haiku-latest"
/// }
/// ```
pub struct AnthropicProviderFactory;

impl ProviderFactory for AnthropicProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn create(
        &self,
        config: &ProviderConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(AnthropicProvider::from_config(config, client.clone())))
    }

    fn default_model(&self) -> Option<&'static str> {
        Some(ANTHROPIC_DEFAULT_MODEL)
    }

    fn description(&self) -> &'static str {
        "Anthropic messages API provider"
    }
}
