//! # attest-runtime
//!
//! Async side of the attest validation engine.
//!
//! `attest-core` holds the deterministic pieces: scoring, aggregation and
//! proofs. This crate adds everything that waits on I/O:
//! - provider clients behind the [`LlmProvider`] trait
//! - the [`Orchestrator`] that fans a request out to providers and guideline
//!   scoring in parallel
//! - remote embedders with a cached query path
//! - configuration, telemetry and log capture
//! - the [`Engine`] facade used by the CLI and the language bindings
//!
//! ## Example
//!
//! ```rust,ignore
//! use attest_runtime::{Engine, RuntimeConfig};
//!
//! let engine = Engine::new(RuntimeConfig::default())?;
//! engine.initialize()?;
//! let verdict = engine
//!     .validate_multi("Capital of France?", r#"[{"type": "echo"}]"#)
//!     .await?;
//! println!("passed: {}", verdict.passed);
//! ```

pub mod config;
pub mod embeddings;
pub mod engine;
pub mod logs;
pub mod orchestrator;
pub mod providers;
pub mod telemetry;

pub use config::{ConfigError, EmbeddingConfig, QueryCacheConfig, RuntimeConfig, StorageConfig};
pub use embeddings::{EmbeddingService, OllamaEmbedder, OpenAiEmbedder, RemoteEmbedder};
pub use engine::{Engine, InitStatus, ProvenVerdict, ValidationOptions};
pub use logs::{LogBuffer, LogCaptureLayer, DEFAULT_RECENT_LOGS};
pub use orchestrator::{
    GuidelineSource, Orchestrator, OrchestratorBuilder, RunOutcome, RunState, ValidationJob,
};
pub use providers::{
    parse_providers, ApiCredential, LlmProvider, ProviderConfig, ProviderError, ProviderFactory,
    ProviderHandle, ProviderRegistry,
};
pub use telemetry::{
    ExportFormat, InMemoryMetrics, MetricHistory, MetricSample, MetricsSink, NoopMetrics,
};
