//! The engine facade behind the CLI and the language bindings.
//!
//! Every operation takes scalars or JSON strings and returns a scalar, a
//! serialisable value, or an [`EngineError`]. Stateless operations (metrics,
//! tokens, cost, version, proof verification) work before
//! [`Engine::initialize`]; everything else fails with `ERR_INIT` until then.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::{Arc, OnceLock};

use attest_core::metrics::{self, BiasReport, CostRules, FactCheck};
use attest_core::{
    EngineError, EngineResult, ErrorCode, FileStore, GuidelineBatch, GuidelineMatch,
    GuidelineStore, InMemoryStore, IngestReport, KeyValueStore, PayloadSchema, ProofGenerator,
    ResponseStatus, ScoringMethod, ValidationProof, ValidationRequest, ValidationVerdict,
};

use crate::config::{ConfigError, RuntimeConfig, StorageConfig};
use crate::logs::{LogBuffer, DEFAULT_RECENT_LOGS};
use crate::orchestrator::{GuidelineSource, Orchestrator, ValidationJob};
use crate::providers::{parse_provider_value, parse_providers, ProviderConfig, ProviderRegistry};
use crate::telemetry::{ExportFormat, InMemoryMetrics, MetricHistory, MetricSample, MetricsSink};

/// Outcome of [`Engine::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Initialized,
    AlreadyInitialized,
}

impl InitStatus {
    /// `0` for a fresh initialisation, `1` when already initialised.
    pub fn code(&self) -> i32 {
        match self {
            InitStatus::Initialized => 0,
            InitStatus::AlreadyInitialized => 1,
        }
    }
}

/// A verdict together with the request it answers and its proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenVerdict {
    pub request: ValidationRequest,
    pub verdict: ValidationVerdict,
    pub proof: ValidationProof,
}

/// Optional inputs of a validation call beyond prompt, providers and
/// guidelines. Parsed from `{"reference"?, "threshold"?, "salt"?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationOptions {
    /// Reference answer that providers are scored against.
    #[serde(default)]
    pub reference: Option<String>,
    /// Pass threshold in `[0, 1]`, overriding the configured one.
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Mixed into the proof's request hash.
    #[serde(default)]
    pub salt: Option<String>,
}

impl ValidationOptions {
    /// An empty string or `null` yields the defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: JsonValue = serde_json::from_str(json)?;
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value)?)
    }

    fn apply(self, mut job: ValidationJob) -> ValidationJob {
        if let Some(reference) = self.reference {
            job = job.with_reference(reference);
        }
        if let Some(threshold) = self.threshold {
            job = job.with_threshold(threshold);
        }
        if let Some(salt) = self.salt {
            job = job.with_salt(salt);
        }
        job
    }
}

struct EngineState {
    orchestrator: Orchestrator,
    storage: Arc<dyn KeyValueStore>,
    history: MetricHistory,
    default_provider: ProviderConfig,
}

/// Process-level engine.
pub struct Engine {
    config: RuntimeConfig,
    registry: Arc<ProviderRegistry>,
    storage_override: Option<Arc<dyn KeyValueStore>>,
    logs: Arc<LogBuffer>,
    metrics: Arc<InMemoryMetrics>,
    proofs: ProofGenerator,
    init_lock: Mutex<()>,
    state: OnceLock<EngineState>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("initialized", &self.is_initialized())
            .field("registry", &self.registry)
            .finish()
    }
}

impl Engine {
    /// Engine with all built-in providers.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, ProviderRegistry::with_defaults())
    }

    pub fn with_registry(
        config: RuntimeConfig,
        registry: ProviderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            logs: Arc::new(LogBuffer::new(config.log_capacity)),
            config,
            registry: Arc::new(registry),
            storage_override: None,
            metrics: Arc::new(InMemoryMetrics::new()),
            proofs: ProofGenerator::new(),
            init_lock: Mutex::new(()),
            state: OnceLock::new(),
        })
    }

    /// Use `storage` instead of the configured backend. Only effective
    /// before [`Engine::initialize`].
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStore>) -> Self {
        self.storage_override = Some(storage);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Buffer backing `get_logs`; attach a [`crate::LogCaptureLayer`] to it.
    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.logs)
    }

    pub fn telemetry(&self) -> Arc<InMemoryMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().is_some()
    }

    fn note(&self, op: &str) {
        self.logs.push(op.to_string());
    }

    fn state(&self) -> EngineResult<&EngineState> {
        self.state.get().ok_or_else(EngineError::not_initialized)
    }

    fn open_storage(&self) -> EngineResult<Arc<dyn KeyValueStore>> {
        if let Some(storage) = &self.storage_override {
            return Ok(Arc::clone(storage));
        }
        match &self.config.storage {
            StorageConfig::Memory => Ok(Arc::new(InMemoryStore::new())),
            StorageConfig::File { path } => {
                let store = FileStore::open(path).map_err(|e| {
                    EngineError::new(
                        ErrorCode::Init,
                        format!("cannot open storage at {}: {}", path.display(), e),
                    )
                })?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Set up storage, the guideline store and the orchestrator.
    pub fn initialize(&self) -> EngineResult<InitStatus> {
        let _guard = self.init_lock.lock();
        if self.state.get().is_some() {
            self.note("initialize:already");
            return Ok(InitStatus::AlreadyInitialized);
        }

        let storage = self.open_storage()?;
        let default_provider =
            parse_provider_value(self.config.default_provider.clone(), self.config.provider_timeout)
                .and_then(|mut providers| {
                    providers.pop().ok_or_else(|| {
                        EngineError::malformed("default_provider must name one provider")
                    })
                })
                .map_err(|e| EngineError::new(ErrorCode::Init, e.message))?;

        let orchestrator = Orchestrator::builder()
            .registry(Arc::clone(&self.registry))
            .store(Arc::new(GuidelineStore::new()))
            .metrics(self.metrics.clone() as Arc<dyn MetricsSink>)
            .config(self.config.clone())
            .build()?;

        let state = EngineState {
            orchestrator,
            history: MetricHistory::new(Arc::clone(&storage)),
            storage,
            default_provider,
        };
        if self.state.set(state).is_err() {
            return Ok(InitStatus::AlreadyInitialized);
        }
        tracing::info!(version = attest_core::VERSION, "Engine initialized");
        self.note("initialize");
        Ok(InitStatus::Initialized)
    }

    // ==================== Providers & validation ====================

    /// Completion text from the default provider.
    pub async fn generate(&self, prompt: &str) -> EngineResult<String> {
        let state = self.state()?;
        self.note("generate");
        let config = state.default_provider.clone();
        let handle = state
            .orchestrator
            .registry()
            .create(config)
            .map_err(EngineError::from)?;
        let response = handle.invoke(prompt).await;
        match response.status {
            ResponseStatus::Ok => Ok(response.output),
            status => {
                let code = if status == ResponseStatus::AuthError {
                    ErrorCode::ProviderAuth
                } else {
                    ErrorCode::ProviderTransport
                };
                Err(EngineError::new(
                    code,
                    response
                        .error
                        .unwrap_or_else(|| format!("provider returned {}", status.as_str())),
                ))
            }
        }
    }

    /// Validate against the default provider only.
    pub async fn validate(&self, prompt: &str) -> EngineResult<ValidationVerdict> {
        let state = self.state()?;
        self.note("validate");
        let job = ValidationJob::new(prompt, vec![state.default_provider.clone()]);
        Ok(state.orchestrator.run(job).await?.verdict)
    }

    pub async fn validate_multi(
        &self,
        prompt: &str,
        providers_json: &str,
    ) -> EngineResult<ValidationVerdict> {
        self.note("validate_multi");
        let job = self.job(prompt, providers_json, None, ValidationOptions::default())?;
        Ok(self.state()?.orchestrator.run(job).await?.verdict)
    }

    pub async fn validate_multi_with_proof(
        &self,
        prompt: &str,
        providers_json: &str,
    ) -> EngineResult<ProvenVerdict> {
        self.note("validate_multi_with_proof");
        let job = self.job(prompt, providers_json, None, ValidationOptions::default())?;
        self.prove(job).await
    }

    pub async fn validate_custom(
        &self,
        prompt: &str,
        providers_json: &str,
        guidelines_json: &str,
    ) -> EngineResult<ValidationVerdict> {
        self.note("validate_custom");
        let job = self.job(
            prompt,
            providers_json,
            Some(guidelines_json),
            ValidationOptions::default(),
        )?;
        Ok(self.state()?.orchestrator.run(job).await?.verdict)
    }

    pub async fn validate_custom_with_proof(
        &self,
        prompt: &str,
        providers_json: &str,
        guidelines_json: &str,
    ) -> EngineResult<ProvenVerdict> {
        self.note("validate_custom_with_proof");
        let job = self.job(
            prompt,
            providers_json,
            Some(guidelines_json),
            ValidationOptions::default(),
        )?;
        self.prove(job).await
    }

    /// Validate with a reference answer, threshold or proof salt.
    ///
    /// An empty `providers_json` means the default provider and an empty
    /// `guidelines_json` skips guideline scoring.
    pub async fn validate_with_options(
        &self,
        prompt: &str,
        providers_json: &str,
        guidelines_json: &str,
        options_json: &str,
    ) -> EngineResult<ValidationVerdict> {
        self.note("validate_with_options");
        let options = ValidationOptions::from_json(options_json)?;
        let job = self.job(prompt, providers_json, Some(guidelines_json), options)?;
        Ok(self.state()?.orchestrator.run(job).await?.verdict)
    }

    pub async fn validate_with_options_and_proof(
        &self,
        prompt: &str,
        providers_json: &str,
        guidelines_json: &str,
        options_json: &str,
    ) -> EngineResult<ProvenVerdict> {
        self.note("validate_with_options_and_proof");
        let options = ValidationOptions::from_json(options_json)?;
        let job = self.job(prompt, providers_json, Some(guidelines_json), options)?;
        self.prove(job).await
    }

    async fn prove(&self, job: ValidationJob) -> EngineResult<ProvenVerdict> {
        let outcome = self.state()?.orchestrator.run_with_proof(job).await?;
        let proof = outcome.proof.ok_or_else(|| {
            EngineError::new(ErrorCode::Init, "orchestrator returned no proof")
        })?;
        Ok(ProvenVerdict {
            request: outcome.request,
            verdict: outcome.verdict,
            proof,
        })
    }

    fn job(
        &self,
        prompt: &str,
        providers_json: &str,
        guidelines_json: Option<&str>,
        options: ValidationOptions,
    ) -> EngineResult<ValidationJob> {
        let state = self.state()?;
        let providers = if providers_json.trim().is_empty() {
            vec![state.default_provider.clone()]
        } else {
            parse_providers(providers_json, self.config.provider_timeout)?
        };
        let mut job = options.apply(ValidationJob::new(prompt, providers));
        if let Some(json) = guidelines_json {
            let (source, top_k) = self.guideline_source(json)?;
            if let Some(source) = source {
                job = job.with_guidelines(source);
            }
            if let Some(top_k) = top_k {
                job = job.with_top_k(top_k);
            }
        }
        Ok(job)
    }

    fn method_or_default(&self, tag: Option<&str>) -> EngineResult<ScoringMethod> {
        match tag {
            Some(tag) if !tag.is_empty() => tag.parse(),
            _ => self.config.default_method().map_err(EngineError::from),
        }
    }

    /// Interpret the guidelines argument of `validate_custom`.
    ///
    /// `{"collection": name, "method"?, "top_k"?}` references a stored
    /// collection. Anything else is an inline collection in ingest shape.
    fn guideline_source(
        &self,
        json: &str,
    ) -> EngineResult<(Option<GuidelineSource>, Option<usize>)> {
        if json.trim().is_empty() {
            return Ok((None, None));
        }
        let value: JsonValue = serde_json::from_str(json)?;
        if value.is_null() {
            return Ok((None, None));
        }
        let method_tag = value.get("method").and_then(JsonValue::as_str);

        let is_reference = value.get("collection").is_some() && value.get("guidelines").is_none();
        if is_reference {
            attest_core::schema::check(PayloadSchema::GuidelineReference, &value)?;
            let method = self.method_or_default(method_tag)?;
            let collection = value["collection"].as_str().unwrap_or_default().to_string();
            let top_k = match value.get("top_k") {
                None | Some(JsonValue::Null) => None,
                Some(k) => Some(whole_number(k, "top_k")?),
            };
            return Ok((Some(GuidelineSource::Stored { collection, method }), top_k));
        }

        let method = self.method_or_default(method_tag)?;
        let batch = GuidelineBatch::from_value(&value)?;
        if batch.is_empty() {
            return Ok((None, None));
        }
        let scratch = GuidelineStore::new();
        let report = scratch.ingest(&batch)?;
        let collection = scratch.snapshot(&report.collection)?;
        Ok((Some(GuidelineSource::Inline { collection, method }), None))
    }

    /// Check a `{request, verdict, proof}` document.
    ///
    /// `Ok(false)` means the document parsed but the proof does not match.
    pub fn verify_proof(&self, proven_json: &str) -> EngineResult<bool> {
        self.note("verify_proof");
        let proven: ProvenVerdict = serde_json::from_str(proven_json)?;
        match self
            .proofs
            .verify(&proven.proof, &proven.request, &proven.verdict)
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::info!(error = %e, "Proof verification failed");
                Ok(false)
            }
        }
    }

    // ==================== Metrics kit ====================

    pub fn metrics_bleu(&self, reference: &str, candidate: &str) -> f64 {
        self.note("metrics_bleu");
        metrics::bleu_score(reference, candidate)
    }

    pub fn token_count(&self, text: &str) -> usize {
        self.note("token_count");
        metrics::count_tokens(text)
    }

    pub fn calculate_cost(
        &self,
        tokens_in: u64,
        tokens_out: u64,
        provider_name: &str,
        cost_rules_json: &str,
    ) -> EngineResult<f64> {
        self.note("calculate_cost");
        let rules = CostRules::from_json(cost_rules_json)?;
        metrics::calculate_cost(tokens_in, tokens_out, provider_name, &rules)
    }

    pub fn metrics_rouge_l(&self, reference: &str, candidate: &str) -> f64 {
        self.note("metrics_rouge_l");
        metrics::rouge_l(reference, candidate)
    }

    pub fn metrics_accuracy(&self, expected: &str, generated: &str) -> f64 {
        self.note("metrics_accuracy");
        metrics::accuracy(expected, generated)
    }

    /// `facts_json` is a JSON array of expected terms.
    pub fn metrics_fact_coverage(&self, facts_json: &str, candidate: &str) -> EngineResult<f64> {
        self.note("metrics_fact_coverage");
        let facts = string_list(facts_json, "facts")?;
        Ok(metrics::fact_coverage(&facts, candidate))
    }

    pub fn metrics_coherence(&self, text: &str) -> f64 {
        self.note("metrics_coherence");
        metrics::coherence(text)
    }

    /// `samples_json` is a JSON array of texts.
    pub fn metrics_diversity(&self, samples_json: &str) -> EngineResult<f64> {
        self.note("metrics_diversity");
        let samples = string_list(samples_json, "samples")?;
        Ok(metrics::diversity(&samples))
    }

    pub fn metrics_fluency(&self, text: &str) -> f64 {
        self.note("metrics_fluency");
        metrics::fluency(text)
    }

    /// Fact coverage with a penalty for negated facts.
    pub fn metrics_factcheck_adv(
        &self,
        facts_json: &str,
        candidate: &str,
    ) -> EngineResult<FactCheck> {
        self.note("metrics_factcheck_adv");
        let facts = string_list(facts_json, "facts")?;
        Ok(metrics::factcheck_adv(&facts, candidate))
    }

    /// Trigram overlap with the closest corpus document.
    pub fn metrics_plagiarism(&self, corpus_json: &str, candidate: &str) -> EngineResult<f64> {
        self.note("metrics_plagiarism");
        let corpus = string_list(corpus_json, "corpus")?;
        Ok(metrics::plagiarism(&corpus, candidate))
    }

    pub fn metrics_plagiarism_ngram(
        &self,
        corpus_json: &str,
        candidate: &str,
        n: usize,
    ) -> EngineResult<f64> {
        self.note("metrics_plagiarism_ngram");
        if n == 0 {
            return Err(EngineError::malformed("ngram size must be at least 1"));
        }
        let corpus = string_list(corpus_json, "corpus")?;
        Ok(metrics::plagiarism_ngram(&corpus, candidate, n))
    }

    pub fn detect_bias(&self, samples_json: &str) -> EngineResult<BiasReport> {
        self.note("detect_bias");
        let samples = string_list(samples_json, "samples")?;
        Ok(metrics::detect_bias(&samples))
    }

    /// Word-distribution drift between two sample sets.
    pub fn detect_drift(&self, previous_json: &str, current_json: &str) -> EngineResult<f64> {
        self.note("detect_drift");
        let previous = string_list(previous_json, "previous")?;
        let current = string_list(current_json, "current")?;
        Ok(metrics::detect_drift(&previous, &current))
    }

    // ==================== Guidelines ====================

    pub fn guidelines_ingest(&self, collection_json: &str) -> EngineResult<IngestReport> {
        let state = self.state()?;
        self.note("guidelines_ingest");
        let batch = GuidelineBatch::from_json(collection_json)?;
        state.orchestrator.store().ingest(&batch)
    }

    /// Rank the active collection against `query`.
    pub async fn guidelines_scores(
        &self,
        query: &str,
        top_k: usize,
        method: Option<&str>,
    ) -> EngineResult<Vec<GuidelineMatch>> {
        let state = self.state()?;
        self.note("guidelines_scores");
        let method = self.method_or_default(method)?;
        let store = state.orchestrator.store();
        let name = store.require_active()?;

        let query_vector = if method.is_remote() && store.uses_stored_embeddings(&name, method)? {
            Some(
                state
                    .orchestrator
                    .embeddings()
                    .query_embedding(method, query)
                    .await?,
            )
        } else {
            None
        };
        store.score(&name, query, top_k, method, query_vector.as_deref())
    }

    /// Persist collection `name`, ingesting `collection_json` into it first
    /// when that is non-empty.
    pub fn guidelines_save(&self, name: &str, collection_json: &str) -> EngineResult<()> {
        let state = self.state()?;
        self.note("guidelines_save");
        if name.trim().is_empty() {
            return Err(EngineError::malformed("collection name must not be empty"));
        }
        let store = state.orchestrator.store();
        if !collection_json.trim().is_empty() {
            let mut batch = GuidelineBatch::from_json(collection_json)?;
            if !batch.is_empty() {
                batch.collection = Some(name.to_string());
                store.ingest(&batch)?;
            }
        }
        store.save(name, state.storage.as_ref())
    }

    pub fn guidelines_load(&self, name: &str) -> EngineResult<usize> {
        let state = self.state()?;
        self.note("guidelines_load");
        state
            .orchestrator
            .store()
            .load(name, state.storage.as_ref())
    }

    /// Embed the active collection with `method`.
    pub async fn guidelines_build_embeddings(&self, method: &str) -> EngineResult<usize> {
        let state = self.state()?;
        self.note("guidelines_build_embeddings");
        let method: ScoringMethod = method.parse()?;
        let store = state.orchestrator.store();
        let name = store.require_active()?;
        state.orchestrator.embeddings().build(store, &name, method).await
    }

    // ==================== Telemetry, storage & logs ====================

    pub fn record_metric(&self, name: &str, value: f64) -> EngineResult<()> {
        let state = self.state()?;
        self.logs.push(format!("record_metric:{}", name));
        state
            .history
            .record(name, value, chrono::Utc::now().timestamp_millis())?;
        self.metrics.inc_counter(name, value);
        self.metrics.observe_histogram(name, value);
        Ok(())
    }

    pub fn metric_history(&self, name: &str) -> EngineResult<Vec<MetricSample>> {
        let state = self.state()?;
        self.note("metric_history");
        state.history.history(name)
    }

    pub fn list_metrics(&self) -> EngineResult<Vec<String>> {
        let state = self.state()?;
        self.note("list_metrics");
        state.history.list()
    }

    /// Every recorded sample as `"json"` or `"csv"`.
    pub fn export_metrics(&self, format: &str) -> EngineResult<String> {
        let state = self.state()?;
        self.note("export_metrics");
        let format: ExportFormat = format.parse()?;
        state.history.export(format)
    }

    pub fn list_storage_items(&self) -> EngineResult<Vec<String>> {
        let state = self.state()?;
        self.note("list_storage_items");
        Ok(state.storage.keys()?)
    }

    pub fn get_logs(&self) -> EngineResult<Vec<String>> {
        self.state()?;
        Ok(self.logs.all())
    }

    /// The last `n` log lines; 50 when `n` is `None`.
    pub fn get_recent_logs(&self, n: Option<usize>) -> EngineResult<Vec<String>> {
        self.state()?;
        Ok(self.logs.recent(n.unwrap_or(DEFAULT_RECENT_LOGS)))
    }

    pub fn version(&self) -> &'static str {
        attest_core::VERSION
    }
}

/// A non-negative whole JSON number; `2.0` is accepted, `2.5` is not.
fn whole_number(value: &JsonValue, field: &str) -> EngineResult<usize> {
    match value.as_f64() {
        Some(n) if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= usize::MAX as f64 => {
            Ok(n as usize)
        }
        _ => Err(EngineError::malformed(format!(
            "{} must be a non-negative whole number, got {}",
            field, value
        ))),
    }
}

fn string_list(json: &str, field: &str) -> EngineResult<Vec<String>> {
    serde_json::from_str(json).map_err(|e| {
        EngineError::malformed(format!("{} must be a JSON array of strings: {}", field, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::VerdictState;

    fn engine() -> Engine {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        assert_eq!(engine.initialize().unwrap(), InitStatus::Initialized);
        engine
    }

    const GEO: &str = r#"{"name": "geo", "guidelines": [
        {"id": "g1", "text": "Name the capital city", "expected_terms": ["Paris"]},
        {"id": "g2", "text": "Cite an atlas or encyclopedia"}
    ]}"#;

    #[test]
    fn test_initialize_reports_status_codes() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        assert_eq!(engine.initialize().unwrap().code(), 0);
        assert_eq!(engine.initialize().unwrap().code(), 1);
    }

    #[test]
    fn test_stateless_ops_work_before_initialize() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        assert_eq!(engine.metrics_bleu("the cat sat", "the cat sat"), 1.0);
        assert_eq!(engine.token_count("Hello, world!"), 4);
        assert_eq!(engine.version(), "0.1.0");
        let cost = engine
            .calculate_cost(
                100,
                50,
                "acme",
                r#"{"acme": {"rate_in": 0.002, "rate_out": 0.004}}"#,
            )
            .unwrap();
        assert!((cost - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_stateful_ops_require_initialize() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        let err = engine.guidelines_ingest(GEO).unwrap_err();
        assert_eq!(err.code, ErrorCode::Init);
        assert_eq!(engine.list_storage_items().unwrap_err().code, ErrorCode::Init);
    }

    #[test]
    fn test_cost_rule_missing() {
        let engine = engine();
        let err = engine
            .calculate_cost(1, 1, "unknown", r#"{"acme": {"rate_in": 0.1, "rate_out": 0.1}}"#)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CostRule);
    }

    #[tokio::test]
    async fn test_generate_uses_echo_default() {
        let engine = engine();
        assert_eq!(engine.generate("hi").await.unwrap(), "echo: hi");
    }

    #[tokio::test]
    async fn test_validate_with_default_provider() {
        let engine = engine();
        let verdict = engine.validate("hello").await.unwrap();
        assert_eq!(verdict.state, VerdictState::VerdictReady);
        assert_eq!(verdict.responses.len(), 1);
        assert!((verdict.aggregate_score - 1.0).abs() < 1e-9);
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn test_validate_multi_rejects_duplicate_names() {
        let engine = engine();
        let err = engine
            .validate_multi("q", r#"[{"type": "echo"}, {"type": "echo"}]"#)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[tokio::test]
    async fn test_validate_custom_with_stored_reference() {
        let engine = engine();
        engine.guidelines_ingest(GEO).unwrap();
        let verdict = engine
            .validate_custom(
                "capital city of France",
                r#"[{"type": "echo", "name": "e1"}, {"type": "echo", "name": "e2"}]"#,
                r#"{"collection": "geo", "method": "hybrid", "top_k": 1}"#,
            )
            .await
            .unwrap();
        assert_eq!(verdict.guideline_matches.len(), 1);
        assert_eq!(verdict.guideline_matches[0].id, "g1");
        assert_eq!(verdict.assessments.len(), 2);
    }

    #[tokio::test]
    async fn test_validate_custom_unknown_method_rejected_before_dispatch() {
        let engine = engine();
        engine.guidelines_ingest(GEO).unwrap();
        let err = engine
            .validate_custom(
                "q",
                r#"{"type": "echo"}"#,
                r#"{"collection": "geo", "method": "semantic"}"#,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideMethod);
        assert_eq!(engine.telemetry().counter_value("attest.validate.runs"), 0.0);
    }

    #[tokio::test]
    async fn test_validate_custom_inline_is_not_stored() {
        let engine = engine();
        let verdict = engine
            .validate_custom("capital", r#"{"type": "echo"}"#, GEO)
            .await
            .unwrap();
        assert_eq!(verdict.guideline_matches.len(), 2);
        assert!(engine.guidelines_load("geo").is_err());
        let err = engine.guidelines_scores("capital", 3, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideNotFound);
    }

    #[tokio::test]
    async fn test_proof_round_trips_through_json() {
        let engine = engine();
        let proven = engine
            .validate_multi_with_proof("q", r#"[{"type": "echo"}]"#)
            .await
            .unwrap();
        let json = serde_json::to_string(&proven).unwrap();
        assert!(engine.verify_proof(&json).unwrap());

        let mut tampered = proven.clone();
        tampered.verdict.passed = !tampered.verdict.passed;
        let json = serde_json::to_string(&tampered).unwrap();
        assert!(!engine.verify_proof(&json).unwrap());

        assert_eq!(
            engine.verify_proof("not json").unwrap_err().code,
            ErrorCode::MalformedInput
        );
    }

    #[tokio::test]
    async fn test_proofs_are_deterministic_across_runs() {
        let engine = engine();
        let providers = r#"[{"type": "echo", "name": "a"}, {"type": "echo", "name": "b"}]"#;
        let first = engine.validate_multi_with_proof("q", providers).await.unwrap();
        let second = engine.validate_multi_with_proof("q", providers).await.unwrap();
        assert_eq!(first.proof, second.proof);
    }

    #[tokio::test]
    async fn test_guideline_lifecycle() {
        let engine = engine();
        let report = engine.guidelines_ingest(GEO).unwrap();
        assert_eq!(report.count, 2);

        let top = engine
            .guidelines_scores("capital city", 1, Some("lexical"))
            .await
            .unwrap();
        assert_eq!(top[0].id, "g1");

        assert_eq!(engine.guidelines_build_embeddings("embedding").await.unwrap(), 2);
        assert_eq!(engine.guidelines_build_embeddings("embedding").await.unwrap(), 0);
        assert_eq!(
            engine
                .guidelines_build_embeddings("lexical")
                .await
                .unwrap_err()
                .code,
            ErrorCode::GuideMethod
        );

        engine.guidelines_save("geo", "").unwrap();
        assert_eq!(engine.list_storage_items().unwrap(), vec!["guidelines:geo"]);
        assert_eq!(engine.guidelines_load("geo").unwrap(), 2);
        assert_eq!(
            engine.guidelines_load("missing").unwrap_err().code,
            ErrorCode::GuideNotFound
        );
    }

    #[test]
    fn test_save_with_payload_ingests_into_named_collection() {
        let engine = engine();
        engine
            .guidelines_save("rules", r#"[{"id": "r1", "text": "Be brief"}]"#)
            .unwrap();

        let fresh = Engine::new(RuntimeConfig::default())
            .unwrap()
            .with_storage(engine.state().unwrap().storage.clone());
        fresh.initialize().unwrap();
        assert_eq!(fresh.guidelines_load("rules").unwrap(), 1);
    }

    #[test]
    fn test_file_storage_survives_engine_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            storage: StorageConfig::File {
                path: dir.path().to_path_buf(),
            },
            ..RuntimeConfig::default()
        };

        let first = Engine::new(config.clone()).unwrap();
        first.initialize().unwrap();
        first.guidelines_ingest(GEO).unwrap();
        first.guidelines_save("geo", "").unwrap();
        first.record_metric("quality", 0.75).unwrap();

        let second = Engine::new(config).unwrap();
        second.initialize().unwrap();
        assert_eq!(second.guidelines_load("geo").unwrap(), 2);
        assert_eq!(second.metric_history("quality").unwrap()[0].value, 0.75);
    }

    #[test]
    fn test_record_metric_feeds_sink_history_and_logs() {
        let engine = engine();
        engine.record_metric("latency", 10.0).unwrap();
        engine.record_metric("latency", 20.0).unwrap();
        assert_eq!(engine.get_recent_logs(Some(1)).unwrap(), vec!["record_metric:latency"]);

        assert_eq!(engine.telemetry().counter_value("latency"), 30.0);
        assert_eq!(engine.telemetry().histogram_values("latency"), vec![10.0, 20.0]);
        assert_eq!(engine.metric_history("latency").unwrap().len(), 2);
        assert_eq!(engine.list_metrics().unwrap(), vec!["latency"]);
        assert!(engine
            .export_metrics("csv")
            .unwrap()
            .starts_with("name,value,timestamp_ms\n"));
        assert!(engine
            .get_logs()
            .unwrap()
            .contains(&"record_metric:latency".to_string()));
    }

    #[test]
    fn test_concurrent_record_metric_keeps_every_sample() {
        let engine = Arc::new(engine());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        engine.record_metric("lat", i as f64).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(engine.metric_history("lat").unwrap().len(), 400);
        assert_eq!(engine.list_metrics().unwrap(), vec!["lat"]);
        assert_eq!(engine.telemetry().histogram_values("lat").len(), 400);
    }

    #[tokio::test]
    async fn test_reference_option_fills_quality() {
        let engine = engine();
        let verdict = engine
            .validate_with_options(
                "Capital of France?",
                r#"{"type": "echo"}"#,
                "",
                r#"{"reference": "Paris is the capital of France"}"#,
            )
            .await
            .unwrap();
        assert!(verdict.metrics.quality.is_some());

        let plain = engine
            .validate_multi("Capital of France?", r#"{"type": "echo"}"#)
            .await
            .unwrap();
        assert!(plain.metrics.quality.is_none());
    }

    #[tokio::test]
    async fn test_threshold_option_decides_pass() {
        let engine = engine();
        let run = |threshold: f64| {
            let options = format!(
                r#"{{"reference": "Paris is the capital of France", "threshold": {}}}"#,
                threshold
            );
            let engine = &engine;
            async move {
                engine
                    .validate_with_options("Capital of France?", "", "", &options)
                    .await
                    .unwrap()
            }
        };
        let lenient = run(0.0).await;
        let strict = run(1.0).await;
        assert!(lenient.passed);
        assert!(!strict.passed);
        assert_eq!(strict.threshold, 1.0);
        assert_eq!(lenient.aggregate_score, strict.aggregate_score);
    }

    #[tokio::test]
    async fn test_bad_options_rejected_before_dispatch() {
        let engine = engine();
        for options in [
            r#"{"threshold": 1.5}"#,
            r#"{"reference": "x", "colour": "blue"}"#,
            r#"[1, 2]"#,
        ] {
            let err = engine
                .validate_with_options("q", "", "", options)
                .await
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::MalformedInput, "options {}", options);
        }
        assert_eq!(engine.telemetry().counter_value("attest.validate.runs"), 0.0);
    }

    #[tokio::test]
    async fn test_salted_proof_verifies_and_differs() {
        let engine = engine();
        let salted = engine
            .validate_with_options_and_proof("q", "", "", r#"{"salt": "tenant-42"}"#)
            .await
            .unwrap();
        let plain = engine.validate_multi_with_proof("q", r#"{"type": "echo"}"#).await.unwrap();

        assert_eq!(salted.request.salt.as_deref(), Some("tenant-42"));
        assert_ne!(salted.proof.request_hash, plain.proof.request_hash);
        let json = serde_json::to_string(&salted).unwrap();
        assert!(engine.verify_proof(&json).unwrap());

        let stripped = json.replace(r#","salt":"tenant-42""#, "");
        assert_ne!(stripped, json);
        assert!(!engine.verify_proof(&stripped).unwrap());
    }

    #[tokio::test]
    async fn test_reference_top_k_accepts_whole_floats() {
        let engine = engine();
        engine.guidelines_ingest(GEO).unwrap();
        let verdict = engine
            .validate_custom(
                "capital city of France",
                r#"{"type": "echo"}"#,
                r#"{"collection": "geo", "method": "hybrid", "top_k": 1.0}"#,
            )
            .await
            .unwrap();
        assert_eq!(verdict.guideline_matches.len(), 1);

        let err = engine
            .validate_custom(
                "q",
                r#"{"type": "echo"}"#,
                r#"{"collection": "geo", "top_k": 1.5}"#,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_whole_number_rules() {
        assert_eq!(whole_number(&serde_json::json!(3), "k").unwrap(), 3);
        assert_eq!(whole_number(&serde_json::json!(2.0), "k").unwrap(), 2);
        assert!(whole_number(&serde_json::json!(2.5), "k").is_err());
        assert!(whole_number(&serde_json::json!(-1), "k").is_err());
        assert!(whole_number(&serde_json::json!("2"), "k").is_err());
    }

    #[test]
    fn test_integrity_metrics_before_initialize() {
        let engine = Engine::new(RuntimeConfig::default()).unwrap();
        let check = engine
            .metrics_factcheck_adv(r#"["insulin"]"#, "Never use insulin here")
            .unwrap();
        assert_eq!(check.coverage, 1.0);
        assert_eq!(check.contradiction_rate, 1.0);

        let corpus = r#"["the quick brown fox jumps"]"#;
        assert_eq!(
            engine.metrics_plagiarism(corpus, "the quick brown fox jumps").unwrap(),
            1.0
        );
        assert_eq!(
            engine
                .metrics_plagiarism_ngram(corpus, "fox brown quick", 1)
                .unwrap(),
            0.6
        );
        assert_eq!(
            engine
                .metrics_plagiarism_ngram(corpus, "x", 0)
                .unwrap_err()
                .code,
            ErrorCode::MalformedInput
        );

        let report = engine.detect_bias(r#"["he said", "she said", "he left"]"#).unwrap();
        assert_eq!(report.group_counts.get("male"), Some(&2));
        assert!((report.bias_score - 0.5).abs() < 1e-9);
        assert_eq!(engine.detect_drift(r#"["a b"]"#, r#"["a b"]"#).unwrap(), 0.0);
        assert_eq!(
            engine.detect_bias("not json").unwrap_err().code,
            ErrorCode::MalformedInput
        );
    }

    #[test]
    fn test_bad_default_provider_fails_initialize() {
        let config = RuntimeConfig {
            default_provider: serde_json::json!({"type": "carrier-pigeon"}),
            ..RuntimeConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        assert_eq!(engine.initialize().unwrap_err().code, ErrorCode::Init);
        assert!(!engine.is_initialized());
    }
}
