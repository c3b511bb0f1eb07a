//! Validation orchestrator.
//!
//! Runs one validation request through its state machine:
//!
//! ```text
//! received -> dispatching -> aggregating -> verdict-ready
//!                                        \-> partial-failure
//! ```
//!
//! - Pre-dispatch checks reject a bad request before any provider is called
//! - Parallel fan-out: one tokio task per provider, joined with guideline
//!   scoring via `tokio::join!`
//! - Every provider task is awaited to a terminal state; no early return,
//!   no retries
//! - Deterministic fan-in through the [`Aggregator`]

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use attest_core::{
    Aggregator, EngineError, EngineResult, ErrorCode, GuidelineCollection, GuidelineMatch,
    GuidelineStore, ProofGenerator, ProviderResponse, ResponseStatus, ScoringMethod,
    ValidationProof, ValidationRequest, ValidationVerdict, VerdictState,
};

use crate::config::{ConfigError, RuntimeConfig};
use crate::embeddings::EmbeddingService;
use crate::providers::{construction_failure, ProviderConfig, ProviderRegistry};
use crate::telemetry::{MetricsSink, NoopMetrics};

/// Stage of a single validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Received,
    Dispatching,
    Aggregating,
    VerdictReady,
    PartialFailure,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Received => "received",
            RunState::Dispatching => "dispatching",
            RunState::Aggregating => "aggregating",
            RunState::VerdictReady => "verdict-ready",
            RunState::PartialFailure => "partial-failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::VerdictReady | RunState::PartialFailure)
    }
}

/// Guidelines consulted by a run.
#[derive(Debug, Clone)]
pub enum GuidelineSource {
    /// A collection held by the engine's store.
    Stored {
        collection: String,
        method: ScoringMethod,
    },
    /// A collection supplied with the request, scored once and discarded.
    Inline {
        collection: GuidelineCollection,
        method: ScoringMethod,
    },
}

impl GuidelineSource {
    pub fn collection_name(&self) -> &str {
        match self {
            GuidelineSource::Stored { collection, .. } => collection,
            GuidelineSource::Inline { collection, .. } => &collection.name,
        }
    }

    pub fn method(&self) -> ScoringMethod {
        match self {
            GuidelineSource::Stored { method, .. } | GuidelineSource::Inline { method, .. } => {
                *method
            }
        }
    }
}

/// A validation run before submission. Unlike [`ValidationRequest`] it
/// carries provider credentials.
#[derive(Debug, Clone)]
pub struct ValidationJob {
    pub prompt: String,
    pub providers: Vec<ProviderConfig>,
    pub guidelines: Option<GuidelineSource>,
    pub reference: Option<String>,
    pub threshold: Option<f64>,
    /// Guideline matches kept; the orchestrator default when unset.
    pub top_k: Option<usize>,
    pub salt: Option<String>,
}

impl ValidationJob {
    pub fn new(prompt: impl Into<String>, providers: Vec<ProviderConfig>) -> Self {
        Self {
            prompt: prompt.into(),
            providers,
            guidelines: None,
            reference: None,
            threshold: None,
            top_k: None,
            salt: None,
        }
    }

    pub fn with_guidelines(mut self, source: GuidelineSource) -> Self {
        self.guidelines = Some(source);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Salt mixed into the request hash of a proof.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    /// The credential-free request this job submits.
    pub fn request(&self) -> ValidationRequest {
        ValidationRequest {
            prompt: self.prompt.clone(),
            providers: self.providers.iter().map(|p| p.descriptor.clone()).collect(),
            guideline_collection: self
                .guidelines
                .as_ref()
                .map(|g| g.collection_name().to_string()),
            guideline_method: self
                .guidelines
                .as_ref()
                .map(|g| g.method().as_str().to_string()),
            reference: self.reference.clone(),
            threshold: self.threshold,
            salt: self.salt.clone(),
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub request: ValidationRequest,
    pub verdict: ValidationVerdict,
    /// States visited, in order.
    pub trace: Vec<RunState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<ValidationProof>,
}

impl RunOutcome {
    pub fn final_state(&self) -> RunState {
        self.trace.last().copied().unwrap_or(RunState::Received)
    }
}

enum Dispatched {
    Running {
        provider: String,
        started: Instant,
        task: JoinHandle<ProviderResponse>,
    },
    Settled(ProviderResponse),
}

/// The orchestrator runs validation requests against providers and guidelines.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    store: Arc<GuidelineStore>,
    embeddings: Arc<EmbeddingService>,
    metrics: Arc<dyn MetricsSink>,
    aggregator: Aggregator,
    proofs: ProofGenerator,
    top_k: usize,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("policy", self.aggregator.policy())
            .field("top_k", &self.top_k)
            .finish()
    }
}

fn advance(trace: &mut Vec<RunState>, state: RunState) {
    tracing::debug!(state = state.as_str(), "Validation state");
    trace.push(state);
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    pub fn store(&self) -> &Arc<GuidelineStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Run a job and return its verdict.
    pub async fn run(&self, job: ValidationJob) -> EngineResult<RunOutcome> {
        let mut trace = Vec::with_capacity(4);
        advance(&mut trace, RunState::Received);

        self.check(&job)?;
        let query_vector = self.query_vector(&job).await?;
        let request = job.request();

        advance(&mut trace, RunState::Dispatching);
        self.metrics.inc_counter("attest.validate.runs", 1.0);

        let dispatched = self.spawn_providers(&job);
        let (responses, matches) = tokio::join!(
            self.collect(dispatched),
            self.score_guidelines(&job, query_vector)
        );
        let matches = matches?;

        for response in &responses {
            self.metrics.inc_counter(
                &format!("attest.provider.status.{}", response.status.as_str()),
                1.0,
            );
            self.metrics
                .observe_histogram("attest.provider.latency_ms", response.latency_ms as f64);
        }

        advance(&mut trace, RunState::Aggregating);
        let verdict = self.aggregator.aggregate(&request, responses, matches);

        let terminal = match verdict.state {
            VerdictState::VerdictReady => RunState::VerdictReady,
            VerdictState::PartialFailure => RunState::PartialFailure,
        };
        advance(&mut trace, terminal);

        if verdict.all_failed {
            self.metrics.inc_counter("attest.validate.all_failed", 1.0);
        }
        self.metrics
            .observe_histogram("attest.validate.score", verdict.aggregate_score);
        tracing::info!(
            providers = request.providers.len(),
            ok = verdict.ok_count(),
            score = verdict.aggregate_score,
            passed = verdict.passed,
            "Validation finished"
        );

        Ok(RunOutcome {
            request,
            verdict,
            trace,
            proof: None,
        })
    }

    /// Run a job and attach a proof over the returned request and verdict.
    pub async fn run_with_proof(&self, job: ValidationJob) -> EngineResult<RunOutcome> {
        let mut outcome = self.run(job).await?;
        outcome.proof = Some(self.proofs.generate(&outcome.request, &outcome.verdict));
        Ok(outcome)
    }

    /// Pre-dispatch checks. Nothing has been called when these fail.
    fn check(&self, job: &ValidationJob) -> EngineResult<()> {
        if job.providers.is_empty() {
            return Err(EngineError::malformed(
                "at least one provider is required",
            ));
        }

        let mut seen = HashSet::new();
        for provider in &job.providers {
            if !seen.insert(provider.name()) {
                return Err(EngineError::malformed(format!(
                    "duplicate provider name '{}'",
                    provider.name()
                )));
            }
        }

        if let Some(threshold) = job.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(EngineError::malformed(format!(
                    "threshold must be in [0, 1], got {}",
                    threshold
                )));
            }
        }

        if job.top_k == Some(0) {
            return Err(EngineError::malformed("top_k must be at least 1"));
        }

        if let Some(GuidelineSource::Stored { collection, .. }) = &job.guidelines {
            if !self.store.contains(collection) {
                return Err(EngineError::collection_not_found(collection));
            }
        }
        Ok(())
    }

    /// Remote query embedding for a stored collection embedded with the
    /// same remote method. Fetched before dispatch so an embedder failure
    /// leaves every provider uncalled.
    async fn query_vector(&self, job: &ValidationJob) -> EngineResult<Option<Vec<f32>>> {
        let Some(GuidelineSource::Stored { collection, method }) = &job.guidelines else {
            return Ok(None);
        };
        if !method.is_remote() || !self.store.uses_stored_embeddings(collection, *method)? {
            return Ok(None);
        }
        let vector = self.embeddings.query_embedding(*method, &job.prompt).await?;
        Ok(Some(vector))
    }

    fn spawn_providers(&self, job: &ValidationJob) -> Vec<Dispatched> {
        job.providers
            .iter()
            .map(|config| match self.registry.create(config.clone()) {
                Ok(handle) => {
                    let prompt = job.prompt.clone();
                    Dispatched::Running {
                        provider: config.name().to_string(),
                        started: Instant::now(),
                        task: tokio::spawn(async move { handle.invoke(&prompt).await }),
                    }
                }
                Err(e) => Dispatched::Settled(construction_failure(config, e)),
            })
            .collect()
    }

    /// Await every provider, keeping request order.
    async fn collect(&self, dispatched: Vec<Dispatched>) -> Vec<ProviderResponse> {
        join_all(dispatched.into_iter().map(|d| async move {
            match d {
                Dispatched::Settled(response) => response,
                Dispatched::Running {
                    provider,
                    started,
                    task,
                } => match task.await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::warn!(provider = %provider, error = %e, "Provider task did not complete");
                        ProviderResponse::failed(
                            provider,
                            ResponseStatus::TransportError,
                            format!("provider task did not complete: {}", e),
                            started.elapsed().as_millis() as u64,
                        )
                    }
                },
            }
        }))
        .await
    }

    async fn score_guidelines(
        &self,
        job: &ValidationJob,
        query_vector: Option<Vec<f32>>,
    ) -> EngineResult<Vec<GuidelineMatch>> {
        let Some(source) = &job.guidelines else {
            return Ok(Vec::new());
        };
        let query = job.prompt.clone();
        let top_k = job.top_k.unwrap_or(self.top_k);
        let method = source.method();

        let scored = match source {
            GuidelineSource::Stored { collection, .. } => {
                let store = Arc::clone(&self.store);
                let name = collection.clone();
                tokio::task::spawn_blocking(move || {
                    store.score(&name, &query, top_k, method, query_vector.as_deref())
                })
                .await
            }
            GuidelineSource::Inline { collection, .. } => {
                let collection = collection.clone();
                tokio::task::spawn_blocking(move || collection.score(&query, top_k, method, None))
                    .await
            }
        };

        scored.map_err(|e| {
            EngineError::new(
                ErrorCode::GuideMethod,
                format!("guideline scoring did not complete: {}", e),
            )
        })?
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: Option<Arc<ProviderRegistry>>,
    store: Option<Arc<GuidelineStore>>,
    embeddings: Option<Arc<EmbeddingService>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    config: RuntimeConfig,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            store: None,
            embeddings: None,
            metrics: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Provider registry; defaults to all built-in kinds.
    pub fn registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(mut self, store: Arc<GuidelineStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<EmbeddingService>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Orchestrator, ConfigError> {
        self.config.validate()?;
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ProviderRegistry::with_defaults()));
        let embeddings = match self.embeddings {
            Some(embeddings) => embeddings,
            None => Arc::new(EmbeddingService::from_config(
                &self.config.embedding,
                &self.config.query_cache,
                registry.client().clone(),
            )),
        };
        let aggregator = Aggregator::new(self.config.aggregation_policy())
            .with_cost_rules(self.config.cost_rules()?);

        Ok(Orchestrator {
            registry,
            store: self.store.unwrap_or_default(),
            embeddings,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            aggregator,
            proofs: ProofGenerator::new(),
            top_k: self.config.top_k,
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
