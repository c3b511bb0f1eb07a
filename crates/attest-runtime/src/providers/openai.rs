//! OpenAI-compatible chat completions provider.
//!
//! Also serves the `hosted-api` alias: any endpoint speaking the
//! `/chat/completions` wire format with a bearer credential.

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
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI chat completions provider.
pub struct OpenAiProvider {
    name: String,
    base_url: String,
    model: String,
    credential: Option<ApiCredential>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn from_config(config: &ProviderConfig, client: reqwest::Client) -> Self {
        Self {
            name: config.name().to_string(),
            base_url: config
                .base_url()
                .unwrap_or("https://api.openai.com/v1")
                .to_string(),
            model: config
                .descriptor
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            credential: config.credential.clone(),
            timeout: config.timeout,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let credential = require_credential(self.credential.as_ref(), "OpenAI")?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        // SECURITY: Only expose the credential here, at the point of use
        let body = send_json(
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(credential.expose())
                .json(&request),
            self.timeout,
        )
        .await?;

        let parsed: ChatResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::ParseError("response has no message content".to_string()))
    }

    async fn health_check(&self) -> bool {
        self.credential.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for OpenAI-compatible providers.
pub struct OpenAiProviderFactory;

impl ProviderFactory for OpenAiProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn create(
        &self,
        config: &ProviderConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(OpenAiProvider::from_config(config, client.clone())))
    }

    fn default_model(&self) -> Option<&'static str> {
        Some(OPENAI_DEFAULT_MODEL)
    }

    fn description(&self) -> &'static str {
        "OpenAI-compatible chat completions provider"
    }
}
