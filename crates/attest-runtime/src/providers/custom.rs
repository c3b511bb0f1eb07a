//! Provider for arbitrary HTTP endpoints.
//!
//! No auth scheme is assumed. When the payload carries an `api_key` it is
//! sent as a bearer token. The request body is `{model, prompt}` and the
//! text is read from the first string field among `text`, `response`,
//! `output` and `content`, then from `choices[0].message.content`.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

use super::{
    factory::ProviderFactory, send_json, ApiCredential, LlmProvider, ProviderConfig, ProviderError,
};
use attest_core::ProviderKind;

const TEXT_FIELDS: [&str; 4] = ["text", "response", "output", "content"];

pub struct CustomProvider {
    name: String,
    url: String,
    model: Option<String>,
    credential: Option<ApiCredential>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for CustomProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomProvider")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("credential", &self.credential)
            .finish()
    }
}

impl CustomProvider {
    pub fn from_config(config: &ProviderConfig, client: reqwest::Client) -> Result<Self, ProviderError> {
        let url = config
            .descriptor
            .base_url
            .clone()
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!(
                    "custom provider '{}' has no base_url",
                    config.name()
                ))
            })?;
        Ok(Self {
            name: config.name().to_string(),
            url,
            model: config.descriptor.model.clone(),
            credential: config.credential.clone(),
            timeout: config.timeout,
            client,
        })
    }
}

#[derive(Debug, Serialize)]
struct CustomRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
}

/// Pull the completion text out of an unknown response shape.
fn extract_text(body: &JsonValue) -> Option<String> {
    TEXT_FIELDS
        .iter()
        .find_map(|field| body[*field].as_str())
        .or_else(|| body.pointer("/choices/0/message/content").and_then(JsonValue::as_str))
        .map(str::to_string)
}

#[async_trait]
impl LlmProvider for CustomProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut request = self.client.post(&self.url).json(&CustomRequest {
            model: self.model.as_deref(),
            prompt,
        });
        if let Some(credential) = self.credential.as_ref().filter(|c| !c.is_empty()) {
            request = request.bearer_auth(credential.expose());
        }

        let body = send_json(request, self.timeout).await?;
        extract_text(&body).ok_or_else(|| {
            ProviderError::ParseError("response carries no recognised text field".to_string())
        })
    }

    async fn health_check(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Factory for custom endpoint providers.
pub struct CustomProviderFactory;

impl ProviderFactory for CustomProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn create(
        &self,
        config: &ProviderConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(CustomProvider::from_config(config, client.clone())?))
    }

    fn validate_config(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        match config.descriptor.base_url.as_deref() {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
            Some(_) => Err(ProviderError::NotConfigured(
                "base_url must start with http:// or https://".to_string(),
            )),
            None => Err(ProviderError::NotConfigured(
                "custom provider requires base_url".to_string(),
            )),
        }
    }

    fn description(&self) -> &'static str {
        "Custom HTTP endpoint provider"
    }
}
