//! Python extension module `attest`.
//!
//! ```python
//! import attest
//!
//! engine = attest.Engine()
//! engine.initialize()
//! verdict = json.loads(engine.validate_multi("Capital of France?", '[{"type": "echo"}]'))
//! ```
//!
//! Structured results cross the boundary as JSON strings. Failures raise
//! `attest.AttestError(code, message)`.

use attest_core::EngineError;
use attest_runtime::{Engine, RuntimeConfig};
use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use serde::Serialize;
use std::future::Future;

create_exception!(attest, AttestError, PyException, "Engine failure carrying (code, message).");

fn to_py(err: EngineError) -> PyErr {
    AttestError::new_err((err.code.as_str(), err.message))
}

fn to_json<T: Serialize>(value: &T) -> PyResult<String> {
    serde_json::to_string(value).map_err(|e| to_py(EngineError::from(e)))
}

/// Validation engine with its own tokio runtime.
#[pyclass(name = "Engine", module = "attest")]
struct PyEngine {
    inner: Engine,
    runtime: tokio::runtime::Runtime,
}

impl PyEngine {
    /// Drive an async engine call with the GIL released.
    fn block_on<'a, F, Fut, T>(&'a self, py: Python<'_>, call: F) -> PyResult<T>
    where
        F: FnOnce(&'a Engine) -> Fut + Send,
        Fut: Future<Output = Result<T, EngineError>>,
        T: Send,
    {
        py.allow_threads(move || self.runtime.block_on(call(&self.inner)))
            .map_err(to_py)
    }
}

#[pymethods]
impl PyEngine {
    /// `config` is a JSON or YAML document; defaults apply when omitted.
    #[new]
    #[pyo3(signature = (config = None))]
    fn new(config: Option<&str>) -> PyResult<Self> {
        let config = match config {
            Some(text) if text.trim_start().starts_with('{') => RuntimeConfig::from_json(text),
            Some(text) => RuntimeConfig::from_yaml(text),
            None => Ok(RuntimeConfig::default()),
        }
        .map_err(|e| to_py(e.into()))?;
        let inner = Engine::new(config).map_err(|e| to_py(e.into()))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| to_py(EngineError::new(attest_core::ErrorCode::Init, e.to_string())))?;
        Ok(Self { inner, runtime })
    }

    /// Returns 0 on first initialisation, 1 when already initialised.
    fn initialize(&self) -> PyResult<i32> {
        self.inner.initialize().map(|s| s.code()).map_err(to_py)
    }

    fn generate(&self, py: Python<'_>, prompt: &str) -> PyResult<String> {
        self.block_on(py, |e| e.generate(prompt))
    }

    fn validate(&self, py: Python<'_>, prompt: &str) -> PyResult<String> {
        to_json(&self.block_on(py, |e| e.validate(prompt))?)
    }

    fn validate_multi(&self, py: Python<'_>, prompt: &str, providers: &str) -> PyResult<String> {
        to_json(&self.block_on(py, |e| e.validate_multi(prompt, providers))?)
    }

    fn validate_multi_with_proof(
        &self,
        py: Python<'_>,
        prompt: &str,
        providers: &str,
    ) -> PyResult<String> {
        to_json(&self.block_on(py, |e| e.validate_multi_with_proof(prompt, providers))?)
    }

    fn validate_custom(
        &self,
        py: Python<'_>,
        prompt: &str,
        providers: &str,
        guidelines: &str,
    ) -> PyResult<String> {
        to_json(&self.block_on(py, |e| e.validate_custom(prompt, providers, guidelines))?)
    }

    fn validate_custom_with_proof(
        &self,
        py: Python<'_>,
        prompt: &str,
        providers: &str,
        guidelines: &str,
    ) -> PyResult<String> {
        let proven = self.block_on(py, |e| {
            e.validate_custom_with_proof(prompt, providers, guidelines)
        })?;
        to_json(&proven)
    }

    /// `options` is `{"reference"?, "threshold"?, "salt"?}`. Empty
    /// `providers` means the default provider.
    #[pyo3(signature = (prompt, providers = "", guidelines = "", options = ""))]
    fn validate_with_options(
        &self,
        py: Python<'_>,
        prompt: &str,
        providers: &str,
        guidelines: &str,
        options: &str,
    ) -> PyResult<String> {
        let verdict = self.block_on(py, |e| {
            e.validate_with_options(prompt, providers, guidelines, options)
        })?;
        to_json(&verdict)
    }

    #[pyo3(signature = (prompt, providers = "", guidelines = "", options = ""))]
    fn validate_with_options_and_proof(
        &self,
        py: Python<'_>,
        prompt: &str,
        providers: &str,
        guidelines: &str,
        options: &str,
    ) -> PyResult<String> {
        let proven = self.block_on(py, |e| {
            e.validate_with_options_and_proof(prompt, providers, guidelines, options)
        })?;
        to_json(&proven)
    }

    fn verify_proof(&self, proven: &str) -> PyResult<bool> {
        self.inner.verify_proof(proven).map_err(to_py)
    }

    fn metrics_bleu(&self, reference: &str, candidate: &str) -> f64 {
        self.inner.metrics_bleu(reference, candidate)
    }

    fn token_count(&self, text: &str) -> usize {
        self.inner.token_count(text)
    }

    fn calculate_cost(
        &self,
        tokens_in: u64,
        tokens_out: u64,
        provider: &str,
        rules: &str,
    ) -> PyResult<f64> {
        self.inner
            .calculate_cost(tokens_in, tokens_out, provider, rules)
            .map_err(to_py)
    }

    fn metrics_rouge_l(&self, reference: &str, candidate: &str) -> f64 {
        self.inner.metrics_rouge_l(reference, candidate)
    }

    fn metrics_accuracy(&self, expected: &str, generated: &str) -> f64 {
        self.inner.metrics_accuracy(expected, generated)
    }

    fn metrics_fact_coverage(&self, facts: &str, candidate: &str) -> PyResult<f64> {
        self.inner
            .metrics_fact_coverage(facts, candidate)
            .map_err(to_py)
    }

    fn metrics_coherence(&self, text: &str) -> f64 {
        self.inner.metrics_coherence(text)
    }

    fn metrics_diversity(&self, samples: &str) -> PyResult<f64> {
        self.inner.metrics_diversity(samples).map_err(to_py)
    }

    fn metrics_fluency(&self, text: &str) -> f64 {
        self.inner.metrics_fluency(text)
    }

    /// JSON `{score, coverage, contradiction_rate}`.
    fn metrics_factcheck_adv(&self, facts: &str, candidate: &str) -> PyResult<String> {
        to_json(
            &self
                .inner
                .metrics_factcheck_adv(facts, candidate)
                .map_err(to_py)?,
        )
    }

    fn metrics_plagiarism(&self, corpus: &str, candidate: &str) -> PyResult<f64> {
        self.inner
            .metrics_plagiarism(corpus, candidate)
            .map_err(to_py)
    }

    fn metrics_plagiarism_ngram(&self, corpus: &str, candidate: &str, n: usize) -> PyResult<f64> {
        self.inner
            .metrics_plagiarism_ngram(corpus, candidate, n)
            .map_err(to_py)
    }

    /// JSON `{group_counts, bias_score}`.
    fn detect_bias(&self, samples: &str) -> PyResult<String> {
        to_json(&self.inner.detect_bias(samples).map_err(to_py)?)
    }

    fn detect_drift(&self, previous: &str, current: &str) -> PyResult<f64> {
        self.inner.detect_drift(previous, current).map_err(to_py)
    }

    fn guidelines_ingest(&self, collection: &str) -> PyResult<String> {
        to_json(&self.inner.guidelines_ingest(collection).map_err(to_py)?)
    }

    #[pyo3(signature = (query, top_k = 5, method = None))]
    fn guidelines_scores(
        &self,
        py: Python<'_>,
        query: &str,
        top_k: usize,
        method: Option<&str>,
    ) -> PyResult<String> {
        to_json(&self.block_on(py, |e| e.guidelines_scores(query, top_k, method))?)
    }

    #[pyo3(signature = (name, collection = ""))]
    fn guidelines_save(&self, name: &str, collection: &str) -> PyResult<()> {
        self.inner.guidelines_save(name, collection).map_err(to_py)
    }

    fn guidelines_load(&self, name: &str) -> PyResult<usize> {
        self.inner.guidelines_load(name).map_err(to_py)
    }

    fn guidelines_build_embeddings(&self, py: Python<'_>, method: &str) -> PyResult<usize> {
        self.block_on(py, |e| e.guidelines_build_embeddings(method))
    }

    fn record_metric(&self, name: &str, value: f64) -> PyResult<()> {
        self.inner.record_metric(name, value).map_err(to_py)
    }

    fn metric_history(&self, name: &str) -> PyResult<String> {
        to_json(&self.inner.metric_history(name).map_err(to_py)?)
    }

    fn list_metrics(&self) -> PyResult<String> {
        to_json(&self.inner.list_metrics().map_err(to_py)?)
    }

    #[pyo3(signature = (format = "json"))]
    fn export_metrics(&self, format: &str) -> PyResult<String> {
        self.inner.export_metrics(format).map_err(to_py)
    }

    fn list_storage_items(&self) -> PyResult<String> {
        to_json(&self.inner.list_storage_items().map_err(to_py)?)
    }

    fn get_logs(&self) -> PyResult<String> {
        to_json(&self.inner.get_logs().map_err(to_py)?)
    }

    #[pyo3(signature = (n = None))]
    fn get_recent_logs(&self, n: Option<usize>) -> PyResult<String> {
        to_json(&self.inner.get_recent_logs(n).map_err(to_py)?)
    }

    fn version(&self) -> &'static str {
        self.inner.version()
    }

    fn __repr__(&self) -> String {
        format!(
            "Engine(version={}, initialized={})",
            self.inner.version(),
            self.inner.is_initialized()
        )
    }
}

#[pymodule]
fn attest(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyEngine>()?;
    m.add("AttestError", m.py().get_type::<AttestError>())?;
    m.add("__version__", attest_core::VERSION)?;
    Ok(())
}
