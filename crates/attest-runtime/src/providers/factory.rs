//! Provider factory pattern for provider construction.
//!
//! Each [`ProviderKind`] has a factory that builds a provider from a parsed
//! [`ProviderConfig`]. The registry shares one `reqwest::Client` across all
//! providers it creates so connections are pooled per process.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ProviderRegistry::with_defaults();
//! let handle = registry.create(config)?;
//! let response = handle.invoke("Is water wet?").await;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use attest_core::ProviderKind;

use super::{LlmProvider, ProviderConfig, ProviderError, ProviderHandle};

/// Factory for creating providers of one kind.
pub trait ProviderFactory: Send + Sync {
    /// Kind this factory builds.
    fn kind(&self) -> ProviderKind;

    /// Create a provider instance from its configuration.
    fn create(
        &self,
        config: &ProviderConfig,
        client: &reqwest::Client,
    ) -> Result<Arc<dyn LlmProvider>, ProviderError>;

    /// Validate configuration without creating a provider.
    fn validate_config(&self, _config: &ProviderConfig) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Model used when the payload does not name one.
    fn default_model(&self) -> Option<&'static str> {
        None
    }

    /// Human-readable description of this provider.
    fn description(&self) -> &'static str {
        "Answer provider"
    }
}

/// Registry of available provider factories.
pub struct ProviderRegistry {
    factories: BTreeMap<ProviderKind, Arc<dyn ProviderFactory>>,
    client: reqwest::Client,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            factories: BTreeMap::new(),
            client,
        }
    }

    /// Register a provider factory, replacing any factory of the same kind.
    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Build a callable handle for `config`.
    pub fn create(&self, config: ProviderConfig) -> Result<ProviderHandle, ProviderError> {
        let factory = self.factories.get(&config.kind()).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "Unknown provider type: '{}'. Available: {:?}",
                config.kind(),
                self.available_kinds()
            ))
        })?;
        factory.validate_config(&config)?;
        let provider = factory.create(&config, &self.client)?;
        Ok(ProviderHandle::new(config, provider))
    }

    /// Validate configuration for its provider kind.
    pub fn validate(&self, config: &ProviderConfig) -> Result<(), ProviderError> {
        self.factories
            .get(&config.kind())
            .ok_or_else(|| {
                ProviderError::NotConfigured(format!("Unknown provider type: '{}'", config.kind()))
            })?
            .validate_config(config)
    }

    /// List registered kinds.
    pub fn available_kinds(&self) -> Vec<&'static str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }

    pub fn has_provider(&self, kind: ProviderKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn get_factory(&self, kind: ProviderKind) -> Option<&Arc<dyn ProviderFactory>> {
        self.factories.get(&kind)
    }

    /// Shared HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Create a registry with all built-in providers registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::OpenAiProviderFactory));
        registry.register(Arc::new(super::AnthropicProviderFactory));
        registry.register(Arc::new(super::OllamaProviderFactory));
        registry.register(Arc::new(super::CustomProviderFactory));
        registry.register(Arc::new(super::EchoProviderFactory));
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.available_kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct MockProvider {
        name: String,
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn complete(&self, _prompt: &str) -> Result<String, ProviderError> {
            Ok("mock response".to_string())
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    struct MockProviderFactory;

    impl ProviderFactory for MockProviderFactory {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Custom
        }

        fn create(
            &self,
            config: &ProviderConfig,
            _client: &reqwest::Client,
        ) -> Result<Arc<dyn LlmProvider>, ProviderError> {
            Ok(Arc::new(MockProvider {
                name: config.name().to_string(),
            }))
        }

        fn description(&self) -> &'static str {
            "Mock provider for testing"
        }
    }

    fn config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig::new(kind, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_registry_register_and_create() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProviderFactory));

        assert!(registry.has_provider(ProviderKind::Custom));
        assert!(!registry.has_provider(ProviderKind::OpenAi));

        let handle = registry.create(config(ProviderKind::Custom)).unwrap();
        assert_eq!(handle.name(), "custom");
        assert_eq!(handle.invoke("x").await.output, "mock response");
    }

    #[test]
    fn test_registry_unknown_provider() {
        let registry = ProviderRegistry::new();
        match registry.create(config(ProviderKind::Echo)) {
            Err(ProviderError::NotConfigured(msg)) => {
                assert!(msg.contains("Unknown provider type"));
            }
            other => panic!("Expected NotConfigured error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_with_defaults_covers_every_kind() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.available_kinds(),
            vec!["openai", "anthropic", "ollama", "custom", "echo"]
        );
        assert!(registry.validate(&config(ProviderKind::Echo)).is_ok());
    }

    #[test]
    fn test_factory_descriptions() {
        let registry = ProviderRegistry::with_defaults();
        let factory = registry.get_factory(ProviderKind::Anthropic).unwrap();
        assert!(factory.description().contains("Anthropic"));
        assert!(factory.default_model().is_some());
    }
}
