//! Runtime configuration.
//!
//! Loaded from YAML or JSON. Every field has a default, so an empty document
//! is a valid configuration. Durations are human-readable (`"15s"`,
//! `"500ms"`, `"1h"`).
//!
//! ```yaml
//! provider_timeout: 15s
//! pass_threshold: 0.5
//! guideline_weight: 0.3
//! top_k: 5
//! default_method: lexical
//! default_provider: {type: echo}
//! storage: {backend: file, path: ./attest-store}
//! cost_rules:
//!   echo: {rate_in: 0.0, rate_out: 0.0}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use attest_core::{AggregationPolicy, CostRules, EngineError, ErrorCode, ScoringMethod};

/// Errors from configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::new(ErrorCode::Init, e.to_string())
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Where guideline collections and metric history are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local; lost on exit.
    #[default]
    Memory,
    /// One file per key under `path`.
    File { path: PathBuf },
}

/// Remote embedding endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub openai_base_url: String,
    pub openai_model: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    pub ollama_base_url: String,
    pub ollama_model: String,
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "text-embedding-3-small".to_string(),
            openai_api_key: None,
            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "nomic-embed-text".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Cache of remote query embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryCacheConfig {
    pub max_entries: u64,
    #[serde(with = "humantime_duration")]
    pub ttl: Duration,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// Configuration for the engine and orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Per-provider call timeout unless a payload sets `timeout_ms`.
    #[serde(with = "humantime_duration")]
    pub provider_timeout: Duration,

    pub pass_threshold: f64,

    /// Share of each provider score taken by guideline compliance.
    pub guideline_weight: f64,

    /// Guideline matches kept per validation.
    pub top_k: usize,

    /// Scoring method when a request names none.
    pub default_method: String,

    /// Provider used by `generate` and `validate`.
    pub default_provider: JsonValue,

    pub storage: StorageConfig,

    /// Cost rules in map or list form; `null` means none.
    pub cost_rules: JsonValue,

    /// Capacity of the captured log buffer.
    pub log_capacity: usize,

    pub embedding: EmbeddingConfig,

    pub query_cache: QueryCacheConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            pass_threshold: attest_core::DEFAULT_THRESHOLD,
            guideline_weight: attest_core::DEFAULT_GUIDELINE_WEIGHT,
            top_k: 5,
            default_method: ScoringMethod::Lexical.as_str().to_string(),
            default_provider: serde_json::json!({"type": "echo"}),
            storage: StorageConfig::Memory,
            cost_rules: JsonValue::Null,
            log_capacity: 500,
            embedding: EmbeddingConfig::default(),
            query_cache: QueryCacheConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "provider_timeout must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            return Err(ConfigError::Invalid(format!(
                "pass_threshold must be in [0, 1], got {}",
                self.pass_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.guideline_weight) {
            return Err(ConfigError::Invalid(format!(
                "guideline_weight must be in [0, 1], got {}",
                self.guideline_weight
            )));
        }
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be at least 1".to_string()));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "log_capacity must be at least 1".to_string(),
            ));
        }
        if self.embedding.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "embedding.timeout must be greater than zero".to_string(),
            ));
        }
        self.default_method()?;
        self.cost_rules()?;
        Ok(())
    }

    pub fn default_method(&self) -> Result<ScoringMethod, ConfigError> {
        self.default_method
            .parse()
            .map_err(|e: EngineError| ConfigError::Invalid(e.message))
    }

    pub fn cost_rules(&self) -> Result<CostRules, ConfigError> {
        CostRules::from_value(&self.cost_rules).map_err(|e| ConfigError::Invalid(e.message))
    }

    pub fn aggregation_policy(&self) -> AggregationPolicy {
        AggregationPolicy {
            threshold: self.pass_threshold,
            guideline_weight: self.guideline_weight,
        }
    }
}
