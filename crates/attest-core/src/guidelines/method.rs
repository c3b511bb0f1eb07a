//! Scoring method tags and the local embedder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, EngineResult};
use crate::similarity::{l2_normalize, words};

/// Explicit scoring method tag.
///
/// Tags are never inferred and unknown tags are rejected, so a proof names
/// exactly how its guideline matches were computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMethod {
    /// Token-overlap (Jaccard) similarity.
    Lexical,
    /// Bag-of-words cosine similarity.
    Bow,
    /// Mean of `bow` and `lexical`.
    Hybrid,
    /// Cosine over the local feature-hashing embedder.
    Embedding,
    /// Cosine over OpenAI-compatible remote embeddings.
    #[serde(rename = "embed-openai")]
    EmbedOpenAi,
    /// Cosine over Ollama remote embeddings.
    EmbedOllama,
}

impl ScoringMethod {
    pub const ALL: [ScoringMethod; 6] = [
        ScoringMethod::Lexical,
        ScoringMethod::Bow,
        ScoringMethod::Hybrid,
        ScoringMethod::Embedding,
        ScoringMethod::EmbedOpenAi,
        ScoringMethod::EmbedOllama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMethod::Lexical => "lexical",
            ScoringMethod::Bow => "bow",
            ScoringMethod::Hybrid => "hybrid",
            ScoringMethod::Embedding => "embedding",
            ScoringMethod::EmbedOpenAi => "embed-openai",
            ScoringMethod::EmbedOllama => "embed-ollama",
        }
    }

    /// Whether the method compares stored embeddings.
    pub fn uses_embeddings(&self) -> bool {
        matches!(
            self,
            ScoringMethod::Embedding | ScoringMethod::EmbedOpenAi | ScoringMethod::EmbedOllama
        )
    }

    /// Whether embeddings come from a network service.
    pub fn is_remote(&self) -> bool {
        matches!(self, ScoringMethod::EmbedOpenAi | ScoringMethod::EmbedOllama)
    }
}

impl FromStr for ScoringMethod {
    type Err = EngineError;

    fn from_str(tag: &str) -> EngineResult<Self> {
        ScoringMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == tag)
            .ok_or_else(|| EngineError::unknown_method(tag))
    }
}

impl fmt::Display for ScoringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous text embedder.
pub trait Embedder: Send + Sync {
    /// Method tag recorded on collections embedded by this embedder.
    fn method(&self) -> ScoringMethod;

    fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;
}

/// Output width of [`HashingEmbedder`].
pub const HASHING_DIMENSION: usize = 256;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Deterministic local embedder using signed feature hashing.
///
/// Each lowercase word is hashed with FNV-1a. The low bits pick a bucket and
/// the top bit picks the sign. The result is L2-normalised, so identical
/// texts embed identically on every host.
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in words(text) {
            let hash = fnv1a(word.as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        l2_normalize(&mut vector);
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIMENSION)
    }
}

impl Embedder for HashingEmbedder {
    fn method(&self) -> ScoringMethod {
        ScoringMethod::Embedding
    }

    fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        Ok(self.embed_text(text))
    }
}
