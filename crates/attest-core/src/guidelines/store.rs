//! The guideline store.
//!
//! Each collection sits behind its own `RwLock`, so ingestion and embedding
//! commits on one collection serialize while scoring reads a consistent
//! snapshot. Operations on different collections never contend beyond the
//! brief map lookup.

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::ingest::{GuidelineBatch, IngestReport};
use super::method::{Embedder, HashingEmbedder, ScoringMethod};
use super::{Guideline, GuidelineCollection, GuidelineMatch};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::similarity::{bow_cosine, cosine, hybrid, jaccard};
use crate::storage::KeyValueStore;

/// Collection used when a payload names none and none is active.
pub const DEFAULT_COLLECTION: &str = "default";

const STORAGE_PREFIX: &str = "guidelines:";

type SharedCollection = Arc<RwLock<GuidelineCollection>>;

/// Work needed to bring a collection's embeddings up to date.
///
/// Produced under a read lock, filled in without any lock held, and applied
/// by [`GuidelineStore::commit_embeddings`].
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingPlan {
    pub collection: String,
    pub method: ScoringMethod,
    /// `(id, text)` of every entry to embed, in collection order.
    pub entries: Vec<(String, String)>,
    /// Whether existing embeddings from another method must be dropped.
    pub replaces_method: bool,
}

impl EmbeddingPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owner of all in-memory guideline collections.
#[derive(Debug, Default)]
pub struct GuidelineStore {
    collections: RwLock<BTreeMap<String, SharedCollection>>,
    active: RwLock<Option<String>>,
}

impl GuidelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage key a collection is persisted under.
    pub fn storage_key(name: &str) -> String {
        format!("{}{}", STORAGE_PREFIX, name)
    }

    /// Names of all in-memory collections, sorted.
    pub fn names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Name of the collection that bare operations act on.
    pub fn active_name(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn set_active(&self, name: &str) -> EngineResult<()> {
        if !self.contains(name) {
            return Err(EngineError::collection_not_found(name));
        }
        *self.active.write() = Some(name.to_string());
        Ok(())
    }

    /// Active collection name, or `ERR_GUIDE_NOT_FOUND` when there is none.
    pub fn require_active(&self) -> EngineResult<String> {
        self.active_name().ok_or_else(|| {
            EngineError::new(
                ErrorCode::GuideNotFound,
                "no active guideline collection: ingest or load one first",
            )
        })
    }

    fn shared(&self, name: &str) -> EngineResult<SharedCollection> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::collection_not_found(name))
    }

    fn shared_or_create(&self, name: &str) -> SharedCollection {
        if let Some(existing) = self.collections.read().get(name) {
            return existing.clone();
        }
        self.collections
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(GuidelineCollection::new(name))))
            .clone()
    }

    /// Clone of a collection's current state.
    pub fn snapshot(&self, name: &str) -> EngineResult<GuidelineCollection> {
        Ok(self.shared(name)?.read().clone())
    }

    /// Replace (or create) a collection wholesale.
    pub fn insert_collection(&self, collection: GuidelineCollection) {
        let name = collection.name.clone();
        self.collections
            .write()
            .insert(name, Arc::new(RwLock::new(collection)));
    }

    /// Drop a collection from memory. Persisted copies are untouched.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.collections.write().remove(name).is_some();
        let mut active = self.active.write();
        if active.as_deref() == Some(name) {
            *active = None;
        }
        removed
    }

    /// Merge a batch into its collection, creating the collection if needed.
    ///
    /// Duplicate ids overwrite, new ids append. Malformed entries are skipped
    /// and reported; a non-empty batch with no valid entry fails with
    /// `ERR_GUIDE_INGEST`. The target becomes the active collection.
    pub fn ingest(&self, batch: &GuidelineBatch) -> EngineResult<IngestReport> {
        let name = batch
            .collection
            .clone()
            .or_else(|| self.active_name())
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string());

        let (valid, skipped) = batch.parse_entries();
        if valid.is_empty() && !skipped.is_empty() {
            let reasons: Vec<String> = skipped
                .iter()
                .map(|s| format!("#{}: {}", s.index, s.reason))
                .collect();
            return Err(EngineError::new(
                ErrorCode::GuideIngest,
                format!("no valid guideline entries: {}", reasons.join("; ")),
            ));
        }

        let shared = self.shared_or_create(&name);
        let count = {
            let mut collection = shared.write();
            for guideline in valid.iter().cloned() {
                collection.upsert(guideline);
            }
            collection.len()
        };
        *self.active.write() = Some(name.clone());

        if !skipped.is_empty() {
            tracing::warn!(
                collection = %name,
                skipped = skipped.len(),
                "Skipped malformed guideline entries"
            );
        }
        tracing::debug!(collection = %name, ingested = valid.len(), count, "Ingested guidelines");

        Ok(IngestReport {
            collection: name,
            ingested: valid.len(),
            count,
            skipped,
        })
    }

    /// Persist a collection's current state.
    pub fn save(&self, name: &str, storage: &dyn KeyValueStore) -> EngineResult<()> {
        let shared = self.shared(name).map_err(|_| {
            EngineError::new(
                ErrorCode::GuideSave,
                format!("cannot save unknown collection '{}'", name),
            )
        })?;
        let payload = {
            let collection = shared.read();
            serde_json::to_string(&*collection).map_err(|e| {
                EngineError::new(ErrorCode::GuideSave, format!("serialization failed: {}", e))
            })?
        };
        storage
            .set(&Self::storage_key(name), payload)
            .map_err(|e| EngineError::new(ErrorCode::GuideSave, e.to_string()))?;
        tracing::debug!(collection = %name, "Saved guideline collection");
        Ok(())
    }

    /// Replace the in-memory state of `name` with its persisted copy.
    ///
    /// Returns the loaded size. The loaded collection becomes active.
    pub fn load(&self, name: &str, storage: &dyn KeyValueStore) -> EngineResult<usize> {
        let raw = storage
            .get(&Self::storage_key(name))?
            .ok_or_else(|| EngineError::collection_not_found(name))?;
        let mut collection: GuidelineCollection = serde_json::from_str(&raw).map_err(|e| {
            EngineError::new(
                ErrorCode::Persistence,
                format!("stored collection '{}' is corrupt: {}", name, e),
            )
        })?;
        collection.name = name.to_string();
        let count = collection.len();
        self.insert_collection(collection);
        *self.active.write() = Some(name.to_string());
        tracing::debug!(collection = %name, count, "Loaded guideline collection");
        Ok(count)
    }

    /// Describe which entries `method` still has to embed.
    pub fn embedding_plan(&self, name: &str, method: ScoringMethod) -> EngineResult<EmbeddingPlan> {
        if !method.uses_embeddings() {
            return Err(EngineError::new(
                ErrorCode::GuideMethod,
                format!("method '{}' does not produce embeddings", method),
            ));
        }
        let shared = self.shared(name)?;
        let collection = shared.read();
        let replaces_method = collection.embedding_method != method.as_str();
        let entries = collection
            .guidelines
            .iter()
            .filter(|g| replaces_method || g.embedding.is_none())
            .map(|g| (g.id.clone(), g.text.clone()))
            .collect();
        Ok(EmbeddingPlan {
            collection: name.to_string(),
            method,
            entries,
            replaces_method,
        })
    }

    /// Apply computed vectors for a plan, returning how many were stored.
    ///
    /// A vector is only stored if its entry still has the text it was
    /// computed from; entries edited in the meantime stay unembedded.
    pub fn commit_embeddings(
        &self,
        plan: EmbeddingPlan,
        vectors: Vec<Vec<f32>>,
    ) -> EngineResult<usize> {
        if vectors.len() != plan.entries.len() {
            return Err(EngineError::malformed(format!(
                "embedding plan has {} entries but {} vectors were supplied",
                plan.entries.len(),
                vectors.len()
            )));
        }
        let shared = self.shared(&plan.collection)?;
        let mut collection = shared.write();

        if plan.replaces_method {
            for guideline in collection.guidelines.iter_mut() {
                guideline.embedding = None;
            }
        }
        collection.embedding_method = plan.method.as_str().to_string();

        let mut stored = 0;
        for ((id, text), vector) in plan.entries.into_iter().zip(vectors) {
            if let Some(g) = collection
                .guidelines
                .iter_mut()
                .find(|g| g.id == id && g.text == text)
            {
                g.embedding = Some(vector);
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Embed every entry of `name` that lacks an embedding for the
    /// embedder's method, or all entries if the method changed.
    ///
    /// Returns the number of entries newly embedded; an immediate re-run
    /// returns 0 and leaves the collection unchanged.
    pub fn build_embeddings(&self, name: &str, embedder: &dyn Embedder) -> EngineResult<usize> {
        let plan = self.embedding_plan(name, embedder.method())?;
        if plan.is_empty() && !plan.replaces_method {
            return Ok(0);
        }
        let vectors = plan
            .entries
            .iter()
            .map(|(_, text)| embedder.embed(text))
            .collect::<EngineResult<Vec<_>>>()?;
        let stored = self.commit_embeddings(plan, vectors)?;
        tracing::debug!(collection = %name, method = %embedder.method(), stored, "Built embeddings");
        Ok(stored)
    }

    /// Whether scoring `name` with `method` would compare stored
    /// embeddings (and so needs a query vector for remote methods).
    pub fn uses_stored_embeddings(&self, name: &str, method: ScoringMethod) -> EngineResult<bool> {
        if !method.uses_embeddings() {
            return Ok(false);
        }
        Ok(self.shared(name)?.read().has_embeddings_for(method))
    }

    /// Rank the guidelines of `name` against `query`.
    ///
    /// Results are ordered by descending score with ties broken by ascending
    /// id, and hold at most `top_k` entries. Embedding methods fall back to
    /// `lexical` when the collection holds no embeddings for that method;
    /// remote methods need `query_embedding` otherwise.
    pub fn score(
        &self,
        name: &str,
        query: &str,
        top_k: usize,
        method: ScoringMethod,
        query_embedding: Option<&[f32]>,
    ) -> EngineResult<Vec<GuidelineMatch>> {
        let shared = self.shared(name)?;
        let collection = shared.read();
        score_collection(&collection, query, top_k, method, query_embedding)
    }
}

/// Rank one collection. Shared by stored and inline scoring.
pub(crate) fn score_collection(
    collection: &GuidelineCollection,
    query: &str,
    top_k: usize,
    method: ScoringMethod,
    query_embedding: Option<&[f32]>,
) -> EngineResult<Vec<GuidelineMatch>> {
    let lexical = |g: &Guideline| jaccard(query, &g.text);

    let mut matches: Vec<GuidelineMatch> = match method {
        ScoringMethod::Lexical => collection
            .guidelines
            .iter()
            .map(|g| GuidelineMatch::from_guideline(g, lexical(g)))
            .collect(),
        ScoringMethod::Bow => collection
            .guidelines
            .iter()
            .map(|g| GuidelineMatch::from_guideline(g, bow_cosine(query, &g.text)))
            .collect(),
        ScoringMethod::Hybrid => collection
            .guidelines
            .iter()
            .map(|g| GuidelineMatch::from_guideline(g, hybrid(query, &g.text)))
            .collect(),
        _ if !collection.has_embeddings_for(method) => {
            tracing::debug!(
                collection = %collection.name,
                method = %method,
                "No embeddings for method, using lexical scoring"
            );
            collection
                .guidelines
                .iter()
                .map(|g| GuidelineMatch::from_guideline(g, lexical(g)))
                .collect()
        }
        _ => {
            let local;
            let query_vector: &[f32] = if method.is_remote() {
                query_embedding.ok_or_else(|| {
                    EngineError::new(
                        ErrorCode::GuideMethod,
                        format!("method '{}' requires a query embedding", method),
                    )
                })?
            } else {
                local = HashingEmbedder::default().embed_text(query);
                &local
            };
            collection
                .guidelines
                .iter()
                .map(|g| {
                    let score = match &g.embedding {
                        Some(embedding) => cosine(query_vector, embedding),
                        None => lexical(g),
                    };
                    GuidelineMatch::from_guideline(g, score)
                })
                .collect()
        }
    };

    rank(&mut matches, top_k);
    Ok(matches)
}

/// Sort by descending score, then ascending id, and keep `top_k`.
pub(crate) fn rank(matches: &mut Vec<GuidelineMatch>, top_k: usize) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    matches.truncate(top_k);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;
    use proptest::prelude::*;

    fn batch(json: &str) -> GuidelineBatch {
        GuidelineBatch::from_json(json).unwrap()
    }

    fn clinical_store() -> GuidelineStore {
        let store = GuidelineStore::new();
        store
            .ingest(&batch(
                r#"{"name": "clinical", "guidelines": [
                    {"id": "g1", "text": "Wash hands before every procedure", "expected_terms": ["wash", "hands"]},
                    {"id": "g2", "text": "Store vaccines in a refrigerator"},
                    {"id": "g3", "text": "Record the patient allergies"}
                ]}"#,
            ))
            .unwrap();
        store
    }

    #[test]
    fn test_ingest_creates_collection_and_reports_count() {
        let store = clinical_store();
        assert_eq!(store.names(), vec!["clinical".to_string()]);
        assert_eq!(store.active_name().as_deref(), Some("clinical"));

        let report = store
            .ingest(&batch(
                r#"{"name": "clinical", "guidelines": [
                    {"id": "g2", "text": "Store vaccines between 2 and 8 degrees"},
                    {"id": "g4", "text": "Label every sample"},
                    {"text": "missing id"}
                ]}"#,
            ))
            .unwrap();
        assert_eq!(report.ingested, 2);
        assert_eq!(report.count, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 2);

        let snapshot = store.snapshot("clinical").unwrap();
        assert_eq!(
            snapshot.get("g2").unwrap().text,
            "Store vaccines between 2 and 8 degrees"
        );
    }

    #[test]
    fn test_ingest_all_malformed_fails() {
        let store = GuidelineStore::new();
        let err = store
            .ingest(&batch(r#"[{"id": "a"}, {"text": "b"}]"#))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideIngest);
        assert!(store.names().is_empty());
    }

    #[test]
    fn test_bare_array_goes_to_active_or_default() {
        let store = GuidelineStore::new();
        let report = store.ingest(&batch(r#"[{"id": "a", "text": "x"}]"#)).unwrap();
        assert_eq!(report.collection, DEFAULT_COLLECTION);

        store
            .ingest(&batch(r#"{"name": "other", "guidelines": [{"id": "b", "text": "y"}]}"#))
            .unwrap();
        let report = store.ingest(&batch(r#"[{"id": "c", "text": "z"}]"#)).unwrap();
        assert_eq!(report.collection, "other");
        assert_eq!(report.count, 2);
    }

    #[test]
    fn test_save_load_round_trip_on_fresh_store() {
        let storage = InMemoryStore::new();
        let store = clinical_store();
        store
            .build_embeddings("clinical", &HashingEmbedder::default())
            .unwrap();
        store.save("clinical", &storage).unwrap();
        let original = store.snapshot("clinical").unwrap();

        let fresh = GuidelineStore::new();
        assert_eq!(fresh.load("clinical", &storage).unwrap(), 3);
        let loaded = fresh.snapshot("clinical").unwrap();
        assert_eq!(loaded, original);
        assert_eq!(fresh.active_name().as_deref(), Some("clinical"));
    }

    #[test]
    fn test_load_replaces_in_memory_state() {
        let storage = InMemoryStore::new();
        let store = clinical_store();
        store.save("clinical", &storage).unwrap();
        store
            .ingest(&batch(r#"{"name": "clinical", "guidelines": [{"id": "g9", "text": "extra"}]}"#))
            .unwrap();
        assert_eq!(store.snapshot("clinical").unwrap().len(), 4);

        assert_eq!(store.load("clinical", &storage).unwrap(), 3);
        assert!(store.snapshot("clinical").unwrap().get("g9").is_none());
    }

    #[test]
    fn test_save_unknown_collection_fails() {
        let err = GuidelineStore::new()
            .save("nope", &InMemoryStore::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideSave);
    }

    #[test]
    fn test_load_missing_collection_fails() {
        let err = GuidelineStore::new()
            .load("nope", &InMemoryStore::new())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideNotFound);
    }

    #[test]
    fn test_load_corrupt_collection_is_persistence_error() {
        let storage = InMemoryStore::new();
        storage
            .set(&GuidelineStore::storage_key("bad"), "{oops".to_string())
            .unwrap();
        let err = GuidelineStore::new().load("bad", &storage).unwrap_err();
        assert_eq!(err.code, ErrorCode::Persistence);
    }

    #[test]
    fn test_build_embeddings_is_idempotent() {
        let store = clinical_store();
        let embedder = HashingEmbedder::default();

        assert_eq!(store.build_embeddings("clinical", &embedder).unwrap(), 3);
        let first = store.snapshot("clinical").unwrap();
        assert_eq!(first.embedding_method, "embedding");

        assert_eq!(store.build_embeddings("clinical", &embedder).unwrap(), 0);
        let second = store.snapshot("clinical").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_embeddings_only_fills_changed_entries() {
        let store = clinical_store();
        let embedder = HashingEmbedder::default();
        store.build_embeddings("clinical", &embedder).unwrap();

        store
            .ingest(&batch(
                r#"{"name": "clinical", "guidelines": [{"id": "g3", "text": "Record drug allergies"}]}"#,
            ))
            .unwrap();
        assert_eq!(store.build_embeddings("clinical", &embedder).unwrap(), 1);
    }

    #[test]
    fn test_method_change_recomputes_everything() {
        let store = clinical_store();
        store
            .build_embeddings("clinical", &HashingEmbedder::default())
            .unwrap();

        let plan = store
            .embedding_plan("clinical", ScoringMethod::EmbedOllama)
            .unwrap();
        assert!(plan.replaces_method);
        assert_eq!(plan.entries.len(), 3);

        let vectors = vec![vec![1.0, 0.0]; 3];
        assert_eq!(store.commit_embeddings(plan, vectors).unwrap(), 3);
        assert_eq!(
            store.snapshot("clinical").unwrap().embedding_method,
            "embed-ollama"
        );
    }

    #[test]
    fn test_commit_skips_entries_edited_after_plan() {
        let store = clinical_store();
        let plan = store
            .embedding_plan("clinical", ScoringMethod::Embedding)
            .unwrap();
        store
            .ingest(&batch(
                r#"{"name": "clinical", "guidelines": [{"id": "g1", "text": "Edited text"}]}"#,
            ))
            .unwrap();
        let vectors = vec![vec![0.5; 4]; plan.entries.len()];
        assert_eq!(store.commit_embeddings(plan, vectors).unwrap(), 2);
        assert!(store.snapshot("clinical").unwrap().get("g1").unwrap().embedding.is_none());
    }

    #[test]
    fn test_build_with_lexical_method_rejected() {
        let store = clinical_store();
        let err = store
            .embedding_plan("clinical", ScoringMethod::Lexical)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideMethod);
    }

    #[test]
    fn test_score_lexical_ranks_best_match_first() {
        let store = clinical_store();
        let matches = store
            .score("clinical", "wash your hands", 2, ScoringMethod::Lexical, None)
            .unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "g1");
        assert!(matches[0].score >= matches[1].score);
    }

    #[test]
    fn test_score_ties_break_by_id() {
        let store = GuidelineStore::new();
        store
            .ingest(&batch(
                r#"[{"id": "b", "text": "same"}, {"id": "a", "text": "same"}, {"id": "c", "text": "same"}]"#,
            ))
            .unwrap();
        let ids: Vec<String> = store
            .score(DEFAULT_COLLECTION, "same", 10, ScoringMethod::Bow, None)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_embedding_without_build_falls_back_to_lexical() {
        let store = clinical_store();
        let lexical = store
            .score("clinical", "vaccines", 3, ScoringMethod::Lexical, None)
            .unwrap();
        let embedding = store
            .score("clinical", "vaccines", 3, ScoringMethod::Embedding, None)
            .unwrap();
        assert_eq!(lexical, embedding);
    }

    #[test]
    fn test_embedding_scoring_after_build() {
        let store = clinical_store();
        store
            .build_embeddings("clinical", &HashingEmbedder::default())
            .unwrap();
        let matches = store
            .score("clinical", "refrigerator vaccines", 1, ScoringMethod::Embedding, None)
            .unwrap();
        assert_eq!(matches[0].id, "g2");
    }

    #[test]
    fn test_remote_method_needs_query_vector_when_embedded() {
        let store = clinical_store();
        let plan = store
            .embedding_plan("clinical", ScoringMethod::EmbedOpenAi)
            .unwrap();
        store
            .commit_embeddings(plan, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]])
            .unwrap();
        assert!(store
            .uses_stored_embeddings("clinical", ScoringMethod::EmbedOpenAi)
            .unwrap());

        let err = store
            .score("clinical", "q", 3, ScoringMethod::EmbedOpenAi, None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideMethod);

        let matches = store
            .score("clinical", "q", 3, ScoringMethod::EmbedOpenAi, Some(&[0.0, 1.0]))
            .unwrap();
        assert_eq!(matches[0].id, "g2");
    }

    #[test]
    fn test_score_unknown_collection() {
        let err = GuidelineStore::new()
            .score("missing", "q", 3, ScoringMethod::Lexical, None)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::GuideNotFound);
    }

    #[test]
    fn test_remove_clears_active() {
        let store = clinical_store();
        assert!(store.remove("clinical"));
        assert_eq!(store.active_name(), None);
        assert_eq!(store.require_active().unwrap_err().code, ErrorCode::GuideNotFound);
    }

    #[test]
    fn test_concurrent_ingest_and_score_see_whole_batches() {
        const BATCHES: usize = 40;
        const BATCH_SIZE: usize = 5;

        let store = Arc::new(GuidelineStore::new());
        store
            .ingest(&batch(r#"{"name": "live", "guidelines": [{"id": "seed", "text": "wash hands"}]}"#))
            .unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for b in 0..BATCHES {
                    let entries = (0..BATCH_SIZE)
                        .map(|i| {
                            serde_json::json!({
                                "id": format!("w{:03}", b * BATCH_SIZE + i),
                                "text": format!("wash hands step {}", i),
                            })
                        })
                        .collect();
                    store
                        .ingest(&GuidelineBatch {
                            collection: Some("live".into()),
                            entries,
                        })
                        .unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut last_seen = 0;
                    for _ in 0..100 {
                        let matches = store
                            .score("live", "wash hands", usize::MAX, ScoringMethod::Hybrid, None)
                            .unwrap();
                        // Batches land under one write lock: never a partial batch.
                        assert_eq!((matches.len() - 1) % BATCH_SIZE, 0);
                        assert!(matches.len() >= last_seen);
                        last_seen = matches.len();
                        assert!(matches.iter().any(|m| m.id == "seed"));
                        for pair in matches.windows(2) {
                            assert!(
                                pair[0].score > pair[1].score
                                    || (pair[0].score == pair[1].score && pair[0].id < pair[1].id)
                            );
                        }
                        let top = store
                            .score("live", "wash hands", 3, ScoringMethod::Lexical, None)
                            .unwrap();
                        assert!(top.len() <= 3);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(
            store.snapshot("live").unwrap().len(),
            1 + BATCHES * BATCH_SIZE
        );
    }

    proptest! {
        #[test]
        fn test_top_k_ordering(
            texts in proptest::collection::vec("[a-d]{1,3}( [a-d]{1,3}){0,3}", 0..12),
            query in "[a-d]{1,3}( [a-d]{1,3}){0,3}",
            k in 0usize..15,
        ) {
            let store = GuidelineStore::new();
            let entries: Vec<serde_json::Value> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| serde_json::json!({"id": format!("g{:02}", i), "text": t}))
                .collect();
            let size = entries.len();
            if size > 0 {
                store.ingest(&GuidelineBatch { collection: Some("p".into()), entries }).unwrap();
                let matches = store.score("p", &query, k, ScoringMethod::Hybrid, None).unwrap();
                prop_assert!(matches.len() <= k);
                prop_assert!(matches.len() <= size);
                for pair in matches.windows(2) {
                    prop_assert!(
                        pair[0].score > pair[1].score
                            || (pair[0].score == pair[1].score && pair[0].id < pair[1].id)
                    );
                }
            }
        }
    }
}
