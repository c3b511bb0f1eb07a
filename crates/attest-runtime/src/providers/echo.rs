//! Offline provider that echoes the prompt.
//!
//! Used as the default provider so the engine works with no network and no
//! credentials.

use async_trait::async_trait;
use std::sync::Arc;

use super::{factory::ProviderFactory, LlmProvider, ProviderConfig, ProviderError};
use attest_core::ProviderKind;

#[derive(Debug, Clone)]
pub struct EchoProvider {
    name: String,
}

impl EchoProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        Ok(format!("echo: {}", prompt))
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct EchoProviderFactory;

impl ProviderFactory for EchoProviderFactory {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Echo
    }

    fn create(
        &self,
        config: &ProviderConfig,
        _client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        Ok(Arc::new(EchoProvider::new(config.name())))
    }

    fn description(&self) -> &'static str {
        "Offline echo provider"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_prefixes_prompt() {
        let provider = EchoProvider::new("echo");
        assert_eq!(provider.complete("hello").await.unwrap(), "echo: hello");
        assert_eq!(provider.estimate_tokens("echo: hello"), 3);
    }
}
