//! Data model for validation runs.
//!
//! Everything here is credential-free by construction: provider secrets live
//! only in the runtime crate and never reach these types, so anything built
//! from them (verdicts, proofs, logs) cannot leak a secret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::guidelines::GuidelineMatch;

/// Kind of answer provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions API with bearer credential.
    #[serde(alias = "hosted-api")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// Ollama-style local inference endpoint.
    #[serde(alias = "local-endpoint")]
    Ollama,
    /// Arbitrary endpoint with no assumed auth scheme.
    Custom,
    /// Offline provider that echoes the prompt back.
    Echo,
}

/// Broad provider class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderClass {
    HostedApi,
    LocalEndpoint,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Custom => "custom",
            ProviderKind::Echo => "echo",
        }
    }

    pub fn class(&self) -> ProviderClass {
        match self {
            ProviderKind::OpenAi | ProviderKind::Anthropic => ProviderClass::HostedApi,
            ProviderKind::Ollama | ProviderKind::Echo => ProviderClass::LocalEndpoint,
            ProviderKind::Custom => ProviderClass::Custom,
        }
    }

    /// Whether calls cannot succeed without a credential.
    pub fn requires_credential(&self) -> bool {
        self.class() == ProviderClass::HostedApi
    }

    /// Base address used when the payload does not give one.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Anthropic => Some("https://api.anthropic.com/v1"),
            ProviderKind::Ollama => Some("http://localhost:11434"),
            ProviderKind::Custom | ProviderKind::Echo => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public description of a provider: everything except the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderDescriptor {
    /// Name used when the payload does not give one: `kind:model`, or `kind`.
    pub fn default_name(kind: ProviderKind, model: Option<&str>) -> String {
        match model {
            Some(model) if !model.is_empty() => format!("{}:{}", kind, model),
            _ => kind.to_string(),
        }
    }
}

/// A submitted validation request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub prompt: String,
    pub providers: Vec<ProviderDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guideline_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guideline_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Caller-chosen value mixed into the request hash of a proof.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// Terminal status of one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseStatus {
    Ok,
    Timeout,
    TransportError,
    AuthError,
    MalformedResponse,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Timeout => "timeout",
            ResponseStatus::TransportError => "transport-error",
            ResponseStatus::AuthError => "auth-error",
            ResponseStatus::MalformedResponse => "malformed-response",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

/// Outcome of calling one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider: String,
    pub output: String,
    pub latency_ms: u64,
    pub status: ResponseStatus,
    /// Redacted diagnostic for failed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProviderResponse {
    pub fn ok(provider: impl Into<String>, output: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            provider: provider.into(),
            output: output.into(),
            latency_ms,
            status: ResponseStatus::Ok,
            error: None,
        }
    }

    pub fn failed(
        provider: impl Into<String>,
        status: ResponseStatus,
        error: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            provider: provider.into(),
            output: String::new(),
            latency_ms,
            status,
            error: Some(error.into()),
        }
    }
}

/// How one successful provider scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAssessment {
    pub provider: String,
    /// Similarity to the reference answer, or to the primary output.
    pub agreement: f64,
    /// Guideline compliance, when guideline matches were available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance: Option<f64>,
    pub score: f64,
}

/// Token and cost accounting for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Auxiliary metrics captured with a verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Total cost over providers that have a cost rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// BLEU of the primary output against the reference answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default)]
    pub per_provider: Vec<ProviderUsage>,
}

/// Terminal state of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictState {
    /// At least one provider responded.
    VerdictReady,
    /// Every provider failed.
    PartialFailure,
}

impl VerdictState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictState::VerdictReady => "verdict-ready",
            VerdictState::PartialFailure => "partial-failure",
        }
    }
}

/// Aggregated result of a validation run. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub state: VerdictState,
    pub all_failed: bool,
    /// One entry per requested provider, in request order.
    pub responses: Vec<ProviderResponse>,
    /// Top-k guideline matches, best first.
    pub guideline_matches: Vec<GuidelineMatch>,
    pub assessments: Vec<ProviderAssessment>,
    pub aggregate_score: f64,
    pub passed: bool,
    pub threshold: f64,
    pub metrics: MetricsSnapshot,
    pub evaluated_at: DateTime<Utc>,
}

impl ValidationVerdict {
    pub fn ok_count(&self) -> usize {
        self.responses.iter().filter(|r| r.status.is_ok()).count()
    }
}
