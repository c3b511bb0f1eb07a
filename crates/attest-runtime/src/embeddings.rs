//! Remote embedders and the embedding service.
//!
//! The local `embedding` method runs synchronously inside attest-core.
//! `embed-openai` and `embed-ollama` call out over HTTP, so building their
//! index goes through the store's plan/commit split: the plan is taken under
//! the collection's read lock, vectors are fetched with no lock held, and
//! the commit only touches entries whose text did not change meanwhile.
//!
//! Query embeddings for remote methods are cached in a moka cache keyed by
//! `(method, text)`.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use attest_core::{EngineError, EngineResult, GuidelineStore, HashingEmbedder, ScoringMethod};

use crate::config::{EmbeddingConfig, QueryCacheConfig};
use crate::providers::{
    require_credential, send_json, ApiCredential, CredentialSource, ProviderError,
    OPENAI_API_KEY_ENV,
};

/// Async text embedder backed by a network service.
#[async_trait]
pub trait RemoteEmbedder: Send + Sync {
    /// Method tag recorded on collections embedded by this embedder.
    fn method(&self) -> ScoringMethod;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// OpenAI-compatible `/embeddings` client.
pub struct OpenAiEmbedder {
    base_url: String,
    model: String,
    credential: Option<ApiCredential>,
    timeout: Duration,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("credential", &self.credential)
            .finish()
    }
}

impl OpenAiEmbedder {
    pub fn from_config(config: &EmbeddingConfig, client: reqwest::Client) -> Self {
        let credential = match &config.openai_api_key {
            Some(key) => Some(ApiCredential::new(
                key.as_str(),
                CredentialSource::Config,
                "OpenAI API key",
            )),
            None => ApiCredential::from_env(OPENAI_API_KEY_ENV, "OpenAI API key").ok(),
        };
        Self {
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            model: config.openai_model.clone(),
            credential,
            timeout: config.timeout,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl RemoteEmbedder for OpenAiEmbedder {
    fn method(&self) -> ScoringMethod {
        ScoringMethod::EmbedOpenAi
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::ParseError("no embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let credential = require_credential(self.credential.as_ref(), "OpenAI embeddings")?;
        let body = send_json(
            self.client
                .post(format!("{}/embeddings", self.base_url))
                .bearer_auth(credential.expose())
                .json(&OpenAiEmbeddingRequest {
                    model: &self.model,
                    input: texts,
                }),
            self.timeout,
        )
        .await?;

        let parsed: OpenAiEmbeddingResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        if parsed.data.len() != texts.len() {
            return Err(ProviderError::ParseError(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Ollama `/api/embeddings` client.
#[derive(Debug)]
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn from_config(config: &EmbeddingConfig, client: reqwest::Client) -> Self {
        Self {
            base_url: config.ollama_base_url.trim_end_matches('/').to_string(),
            model: config.ollama_model.clone(),
            timeout: config.timeout,
            client,
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl RemoteEmbedder for OllamaEmbedder {
    fn method(&self) -> ScoringMethod {
        ScoringMethod::EmbedOllama
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = send_json(
            self.client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&OllamaEmbeddingRequest {
                    model: &self.model,
                    prompt: text,
                }),
            self.timeout,
        )
        .await?;
        let parsed: OllamaEmbeddingResponse =
            serde_json::from_value(body).map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(parsed.embedding)
    }
}

type QueryKey = (ScoringMethod, String);

/// Routes embedding work to the local or a remote embedder.
pub struct EmbeddingService {
    remotes: HashMap<ScoringMethod, Arc<dyn RemoteEmbedder>>,
    cache: Cache<QueryKey, Arc<Vec<f32>>>,
}

impl std::fmt::Debug for EmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&str> = self.remotes.keys().map(|m| m.as_str()).collect();
        methods.sort_unstable();
        f.debug_struct("EmbeddingService")
            .field("remotes", &methods)
            .field("cached_queries", &self.cache.entry_count())
            .finish()
    }
}

impl EmbeddingService {
    /// Service with no remote embedders.
    pub fn new(cache: &QueryCacheConfig) -> Self {
        Self {
            remotes: HashMap::new(),
            cache: Cache::builder()
                .max_capacity(cache.max_entries)
                .time_to_live(cache.ttl)
                .build(),
        }
    }

    /// Service with the OpenAI and Ollama embedders registered.
    pub fn from_config(
        embedding: &EmbeddingConfig,
        cache: &QueryCacheConfig,
        client: reqwest::Client,
    ) -> Self {
        let mut service = Self::new(cache);
        service.register(Arc::new(OpenAiEmbedder::from_config(embedding, client.clone())));
        service.register(Arc::new(OllamaEmbedder::from_config(embedding, client)));
        service
    }

    pub fn register(&mut self, embedder: Arc<dyn RemoteEmbedder>) {
        self.remotes.insert(embedder.method(), embedder);
    }

    fn remote(&self, method: ScoringMethod) -> EngineResult<&Arc<dyn RemoteEmbedder>> {
        self.remotes.get(&method).ok_or_else(|| {
            EngineError::new(
                attest_core::ErrorCode::GuideMethod,
                format!("no embedder registered for method '{}'", method),
            )
        })
    }

    /// Query vector for a remote method, served from cache when possible.
    pub async fn query_embedding(&self, method: ScoringMethod, text: &str) -> EngineResult<Vec<f32>> {
        let key = (method, text.to_string());
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(hit.as_ref().clone());
        }
        let vector = self.remote(method)?.embed(text).await.map_err(|e| {
            tracing::warn!(method = %method, error = %e, "Query embedding failed");
            EngineError::from(e)
        })?;
        self.cache.insert(key, Arc::new(vector.clone())).await;
        Ok(vector)
    }

    /// Build or refresh the embeddings of one collection.
    ///
    /// Returns the number of entries newly embedded.
    pub async fn build(
        &self,
        store: &GuidelineStore,
        collection: &str,
        method: ScoringMethod,
    ) -> EngineResult<usize> {
        if !method.is_remote() {
            // Rejects non-embedding methods before touching the local embedder.
            store.embedding_plan(collection, method)?;
            return store.build_embeddings(collection, &HashingEmbedder::default());
        }

        let plan = store.embedding_plan(collection, method)?;
        if plan.is_empty() && !plan.replaces_method {
            return Ok(0);
        }
        let texts: Vec<String> = plan.entries.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.remote(method)?.embed_batch(&texts).await.map_err(|e| {
            tracing::warn!(collection, method = %method, error = %e, "Embedding build failed");
            EngineError::from(e)
        })?;
        let stored = store.commit_embeddings(plan, vectors)?;
        tracing::debug!(collection, method = %method, stored, "Committed remote embeddings");
        Ok(stored)
    }

    pub fn cached_queries(&self) -> u64 {
        self.cache.entry_count()
    }
}
