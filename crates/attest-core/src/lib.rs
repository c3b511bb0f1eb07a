//! # attest-core
//!
//! Deterministic building blocks of the attest validation engine.
//!
//! This crate holds everything that does not touch the network:
//! - the metrics kit (BLEU, token counting, cost estimation, content scores)
//! - the guideline store and its embedding index
//! - the aggregator that turns provider responses into a verdict
//! - the proof generator
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: the same evidence always yields the same score and proof
//! 2. **No network calls**: providers and remote embedders live in `attest-runtime`
//! 3. **Explicit methods**: guideline scoring methods are named, never inferred
//!
//! ## Example
//!
//! ```rust,ignore
//! use attest_core::{GuidelineBatch, GuidelineStore, ScoringMethod};
//!
//! let store = GuidelineStore::new();
//! store.ingest(&GuidelineBatch::from_json(r#"[{"id": "g1", "text": "Cite sources"}]"#)?)?;
//! let top = store.score("default", "sources please", 3, ScoringMethod::Lexical, None)?;
//! ```

pub mod aggregate;
pub mod error;
pub mod guidelines;
pub mod metrics;
pub mod proof;
pub mod schema;
pub mod similarity;
pub mod storage;
pub mod types;

// Re-export main types at crate root
pub use aggregate::{AggregationPolicy, Aggregator, DEFAULT_GUIDELINE_WEIGHT, DEFAULT_THRESHOLD};
pub use error::{EngineError, EngineResult, ErrorCode};
pub use guidelines::{
    Embedder, EmbeddingPlan, Guideline, GuidelineBatch, GuidelineCollection, GuidelineMatch,
    GuidelineStore, HashingEmbedder, IngestReport, ScoringMethod, SkippedEntry, DEFAULT_COLLECTION,
};
pub use metrics::{bleu_score, calculate_cost, count_tokens, CostRate, CostRules, TOKENIZER_RULE};
pub use proof::{ProofError, ProofGenerator, ValidationProof, PROOF_SCHEME};
pub use schema::PayloadSchema;
pub use storage::{FileStore, InMemoryStore, KeyValueStore, StorageError};
pub use types::{
    MetricsSnapshot, ProviderAssessment, ProviderClass, ProviderDescriptor, ProviderKind,
    ProviderResponse, ProviderUsage, ResponseStatus, ValidationRequest, ValidationVerdict,
    VerdictState,
};

/// Crate version reported by the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
