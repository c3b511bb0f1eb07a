//! Node.js addon exposing the attest engine.
//!
//! Async operations return promises. Structured results are JSON strings;
//! failures reject with `Error("CODE: message")`.

#![deny(clippy::all)]

use attest_core::{EngineError, ErrorCode};
use attest_runtime::{Engine, RuntimeConfig};
use napi::bindgen_prelude::*;
use napi_derive::napi;
use serde::Serialize;
use std::sync::Arc;

fn to_napi(err: EngineError) -> Error {
    Error::from_reason(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| to_napi(e.into()))
}

fn non_negative(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        to_napi(EngineError::new(
            ErrorCode::MalformedInput,
            format!("{} must be non-negative", field),
        ))
    })
}

#[napi]
pub struct AttestEngine {
    inner: Arc<Engine>,
}

#[napi]
impl AttestEngine {
    /// `config` is a JSON or YAML document; defaults apply when omitted.
    #[napi(constructor)]
    pub fn new(config: Option<String>) -> Result<Self> {
        let config = match config.as_deref() {
            Some(text) if text.trim_start().starts_with('{') => RuntimeConfig::from_json(text),
            Some(text) => RuntimeConfig::from_yaml(text),
            None => Ok(RuntimeConfig::default()),
        }
        .map_err(|e| to_napi(e.into()))?;
        let engine = Engine::new(config).map_err(|e| to_napi(e.into()))?;
        Ok(Self {
            inner: Arc::new(engine),
        })
    }

    /// 0 on first initialisation, 1 when already initialised.
    #[napi]
    pub fn initialize(&self) -> Result<u32> {
        self.inner
            .initialize()
            .map(|s| s.code() as u32)
            .map_err(to_napi)
    }

    #[napi]
    pub async fn generate(&self, prompt: String) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        engine.generate(&prompt).await.map_err(to_napi)
    }

    #[napi]
    pub async fn validate(&self, prompt: String) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        to_json(&engine.validate(&prompt).await.map_err(to_napi)?)
    }

    #[napi]
    pub async fn validate_multi(&self, prompt: String, providers: String) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let verdict = engine
            .validate_multi(&prompt, &providers)
            .await
            .map_err(to_napi)?;
        to_json(&verdict)
    }

    #[napi]
    pub async fn validate_multi_with_proof(
        &self,
        prompt: String,
        providers: String,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let proven = engine
            .validate_multi_with_proof(&prompt, &providers)
            .await
            .map_err(to_napi)?;
        to_json(&proven)
    }

    #[napi]
    pub async fn validate_custom(
        &self,
        prompt: String,
        providers: String,
        guidelines: String,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let verdict = engine
            .validate_custom(&prompt, &providers, &guidelines)
            .await
            .map_err(to_napi)?;
        to_json(&verdict)
    }

    #[napi]
    pub async fn validate_custom_with_proof(
        &self,
        prompt: String,
        providers: String,
        guidelines: String,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let proven = engine
            .validate_custom_with_proof(&prompt, &providers, &guidelines)
            .await
            .map_err(to_napi)?;
        to_json(&proven)
    }

    /// `options` is `{"reference"?, "threshold"?, "salt"?}`. An empty
    /// `providers` means the default provider.
    #[napi]
    pub async fn validate_with_options(
        &self,
        prompt: String,
        providers: Option<String>,
        guidelines: Option<String>,
        options: Option<String>,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let verdict = engine
            .validate_with_options(
                &prompt,
                providers.as_deref().unwrap_or(""),
                guidelines.as_deref().unwrap_or(""),
                options.as_deref().unwrap_or(""),
            )
            .await
            .map_err(to_napi)?;
        to_json(&verdict)
    }

    #[napi]
    pub async fn validate_with_options_and_proof(
        &self,
        prompt: String,
        providers: Option<String>,
        guidelines: Option<String>,
        options: Option<String>,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let proven = engine
            .validate_with_options_and_proof(
                &prompt,
                providers.as_deref().unwrap_or(""),
                guidelines.as_deref().unwrap_or(""),
                options.as_deref().unwrap_or(""),
            )
            .await
            .map_err(to_napi)?;
        to_json(&proven)
    }

    #[napi]
    pub fn verify_proof(&self, proven: String) -> Result<bool> {
        self.inner.verify_proof(&proven).map_err(to_napi)
    }

    #[napi]
    pub fn metrics_bleu(&self, reference: String, candidate: String) -> f64 {
        self.inner.metrics_bleu(&reference, &candidate)
    }

    #[napi]
    pub fn token_count(&self, text: String) -> u32 {
        self.inner.token_count(&text).min(u32::MAX as usize) as u32
    }

    #[napi]
    pub fn calculate_cost(
        &self,
        tokens_in: i64,
        tokens_out: i64,
        provider: String,
        rules: String,
    ) -> Result<f64> {
        let tokens_in = non_negative(tokens_in, "tokens_in")?;
        let tokens_out = non_negative(tokens_out, "tokens_out")?;
        self.inner
            .calculate_cost(tokens_in, tokens_out, &provider, &rules)
            .map_err(to_napi)
    }

    #[napi]
    pub fn metrics_rouge_l(&self, reference: String, candidate: String) -> f64 {
        self.inner.metrics_rouge_l(&reference, &candidate)
    }

    #[napi]
    pub fn metrics_accuracy(&self, expected: String, generated: String) -> f64 {
        self.inner.metrics_accuracy(&expected, &generated)
    }

    #[napi]
    pub fn metrics_fact_coverage(&self, facts: String, candidate: String) -> Result<f64> {
        self.inner
            .metrics_fact_coverage(&facts, &candidate)
            .map_err(to_napi)
    }

    #[napi]
    pub fn metrics_coherence(&self, text: String) -> f64 {
        self.inner.metrics_coherence(&text)
    }

    #[napi]
    pub fn metrics_diversity(&self, samples: String) -> Result<f64> {
        self.inner.metrics_diversity(&samples).map_err(to_napi)
    }

    #[napi]
    pub fn metrics_fluency(&self, text: String) -> f64 {
        self.inner.metrics_fluency(&text)
    }

    /// JSON `{score, coverage, contradiction_rate}`.
    #[napi]
    pub fn metrics_factcheck_adv(&self, facts: String, candidate: String) -> Result<String> {
        to_json(
            &self
                .inner
                .metrics_factcheck_adv(&facts, &candidate)
                .map_err(to_napi)?,
        )
    }

    #[napi]
    pub fn metrics_plagiarism(&self, corpus: String, candidate: String) -> Result<f64> {
        self.inner
            .metrics_plagiarism(&corpus, &candidate)
            .map_err(to_napi)
    }

    #[napi]
    pub fn metrics_plagiarism_ngram(&self, corpus: String, candidate: String, n: u32) -> Result<f64> {
        self.inner
            .metrics_plagiarism_ngram(&corpus, &candidate, n as usize)
            .map_err(to_napi)
    }

    /// JSON `{group_counts, bias_score}`.
    #[napi]
    pub fn detect_bias(&self, samples: String) -> Result<String> {
        to_json(&self.inner.detect_bias(&samples).map_err(to_napi)?)
    }

    #[napi]
    pub fn detect_drift(&self, previous: String, current: String) -> Result<f64> {
        self.inner
            .detect_drift(&previous, &current)
            .map_err(to_napi)
    }

    #[napi]
    pub fn guidelines_ingest(&self, collection: String) -> Result<String> {
        to_json(&self.inner.guidelines_ingest(&collection).map_err(to_napi)?)
    }

    #[napi]
    pub async fn guidelines_scores(
        &self,
        query: String,
        top_k: u32,
        method: Option<String>,
    ) -> Result<String> {
        let engine = Arc::clone(&self.inner);
        let matches = engine
            .guidelines_scores(&query, top_k as usize, method.as_deref())
            .await
            .map_err(to_napi)?;
        to_json(&matches)
    }

    #[napi]
    pub fn guidelines_save(&self, name: String, collection: Option<String>) -> Result<()> {
        self.inner
            .guidelines_save(&name, collection.as_deref().unwrap_or(""))
            .map_err(to_napi)
    }

    #[napi]
    pub fn guidelines_load(&self, name: String) -> Result<u32> {
        self.inner
            .guidelines_load(&name)
            .map(|n| n as u32)
            .map_err(to_napi)
    }

    #[napi]
    pub async fn guidelines_build_embeddings(&self, method: String) -> Result<u32> {
        let engine = Arc::clone(&self.inner);
        engine
            .guidelines_build_embeddings(&method)
            .await
            .map(|n| n as u32)
            .map_err(to_napi)
    }

    #[napi]
    pub fn record_metric(&self, name: String, value: f64) -> Result<()> {
        self.inner.record_metric(&name, value).map_err(to_napi)
    }

    #[napi]
    pub fn metric_history(&self, name: String) -> Result<String> {
        to_json(&self.inner.metric_history(&name).map_err(to_napi)?)
    }

    #[napi]
    pub fn list_metrics(&self) -> Result<String> {
        to_json(&self.inner.list_metrics().map_err(to_napi)?)
    }

    #[napi]
    pub fn export_metrics(&self, format: Option<String>) -> Result<String> {
        self.inner
            .export_metrics(format.as_deref().unwrap_or("json"))
            .map_err(to_napi)
    }

    #[napi]
    pub fn list_storage_items(&self) -> Result<String> {
        to_json(&self.inner.list_storage_items().map_err(to_napi)?)
    }

    #[napi]
    pub fn get_logs(&self) -> Result<String> {
        to_json(&self.inner.get_logs().map_err(to_napi)?)
    }

    #[napi]
    pub fn get_recent_logs(&self, n: Option<u32>) -> Result<String> {
        to_json(
            &self
                .inner
                .get_recent_logs(n.map(|n| n as usize))
                .map_err(to_napi)?,
        )
    }

    #[napi]
    pub fn version(&self) -> String {
        self.inner.version().to_string()
    }
}
