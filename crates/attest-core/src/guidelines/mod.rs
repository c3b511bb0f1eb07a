//! Guideline collections and the embedding index.
//!
//! A [`GuidelineStore`] owns named [`GuidelineCollection`]s. Collections are
//! filled by ingestion, persisted through a
//! [`KeyValueStore`](crate::storage::KeyValueStore), optionally embedded, and
//! scored against free-text queries.

mod ingest;
mod method;
mod store;

pub use ingest::{GuidelineBatch, IngestReport, SkippedEntry};
pub use method::{Embedder, HashingEmbedder, ScoringMethod, HASHING_DIMENSION};
pub use store::{EmbeddingPlan, GuidelineStore, DEFAULT_COLLECTION};

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// Marker stored in `embedding_method` when a collection has no embeddings.
pub const NO_EMBEDDING: &str = "none";

/// A single policy or reference entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guideline {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Terms an answer is expected to mention.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_terms: Vec<String>,
    /// Derived data; cleared whenever `text` changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Guideline {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            topic: None,
            expected_terms: Vec::new(),
            embedding: None,
        }
    }

    pub fn with_expected_terms(mut self, terms: Vec<String>) -> Self {
        self.expected_terms = terms;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

fn default_embedding_method() -> String {
    NO_EMBEDDING.to_string()
}

/// Named, ordered set of guidelines with unique ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineCollection {
    pub name: String,
    #[serde(default)]
    pub guidelines: Vec<Guideline>,
    /// Method tag the stored embeddings were built with, or `"none"`.
    #[serde(default = "default_embedding_method")]
    pub embedding_method: String,
}

impl GuidelineCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guidelines: Vec::new(),
            embedding_method: default_embedding_method(),
        }
    }

    pub fn len(&self) -> usize {
        self.guidelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guidelines.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Guideline> {
        self.guidelines.iter().find(|g| g.id == id)
    }

    /// Insert or overwrite by id, returning `true` when the id is new.
    ///
    /// Overwrites keep their position. An unchanged text keeps the existing
    /// embedding; a changed text drops it.
    pub fn upsert(&mut self, mut guideline: Guideline) -> bool {
        guideline.embedding = None;
        match self.guidelines.iter_mut().find(|g| g.id == guideline.id) {
            Some(existing) => {
                if existing.text == guideline.text {
                    guideline.embedding = existing.embedding.take();
                }
                *existing = guideline;
                false
            }
            None => {
                self.guidelines.push(guideline);
                true
            }
        }
    }

    /// Whether any entry carries an embedding built with `method`.
    pub fn has_embeddings_for(&self, method: ScoringMethod) -> bool {
        self.embedding_method == method.as_str()
            && self.guidelines.iter().any(|g| g.embedding.is_some())
    }

    /// Rank this collection against `query` without going through a store.
    ///
    /// Same ordering and fallbacks as [`GuidelineStore::score`].
    pub fn score(
        &self,
        query: &str,
        top_k: usize,
        method: ScoringMethod,
        query_embedding: Option<&[f32]>,
    ) -> EngineResult<Vec<GuidelineMatch>> {
        store::score_collection(self, query, top_k, method, query_embedding)
    }
}

/// A guideline ranked against a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineMatch {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_terms: Vec<String>,
    pub score: f64,
}

impl GuidelineMatch {
    pub(crate) fn from_guideline(guideline: &Guideline, score: f64) -> Self {
        Self {
            id: guideline.id.clone(),
            text: guideline.text.clone(),
            topic: guideline.topic.clone(),
            expected_terms: guideline.expected_terms.clone(),
            score,
        }
    }
}
