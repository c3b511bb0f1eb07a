//! Ingestion payload parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::Guideline;
use crate::error::EngineResult;
use crate::schema::{self, PayloadSchema};

/// A batch of raw guideline entries bound for one collection.
///
/// Entries stay as raw JSON until ingestion so that a malformed entry only
/// skips itself instead of rejecting the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidelineBatch {
    /// Target collection; `None` means the active (or default) collection.
    pub collection: Option<String>,
    pub entries: Vec<JsonValue>,
}

impl GuidelineBatch {
    /// Parse a payload of the form `{"name": "...", "guidelines": [...]}`
    /// or a bare array of entries.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &JsonValue) -> EngineResult<Self> {
        schema::check(PayloadSchema::GuidelineBatch, value)?;
        match value {
            JsonValue::Array(entries) => Ok(Self {
                collection: None,
                entries: entries.clone(),
            }),
            _ => {
                let collection = value["name"]
                    .as_str()
                    .or_else(|| value["collection"].as_str())
                    .map(str::to_string);
                let entries = value["guidelines"].as_array().cloned().unwrap_or_default();
                Ok(Self {
                    collection,
                    entries,
                })
            }
        }
    }

    /// Build a batch from already-typed guidelines.
    pub fn from_guidelines(collection: Option<String>, guidelines: &[Guideline]) -> Self {
        let entries = guidelines
            .iter()
            .map(|g| serde_json::to_value(g).unwrap_or(JsonValue::Null))
            .collect();
        Self {
            collection,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split the batch into valid guidelines and skipped entries.
    pub(crate) fn parse_entries(&self) -> (Vec<Guideline>, Vec<SkippedEntry>) {
        let mut valid = Vec::new();
        let mut skipped = Vec::new();
        for (index, entry) in self.entries.iter().enumerate() {
            match parse_entry(entry) {
                Ok(guideline) => valid.push(guideline),
                Err(reason) => skipped.push(SkippedEntry { index, reason }),
            }
        }
        (valid, skipped)
    }
}

/// An entry that was not ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    /// Position of the entry in the submitted batch.
    pub index: usize,
    pub reason: String,
}

/// Outcome of an ingest call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub collection: String,
    /// Entries accepted from this batch.
    pub ingested: usize,
    /// Size of the collection after ingestion.
    pub count: usize,
    pub skipped: Vec<SkippedEntry>,
}

/// Ids may be strings or numbers; text must be a non-empty string.
/// Any supplied embedding is ignored.
fn parse_entry(entry: &JsonValue) -> Result<Guideline, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;

    let id = match object.get("id") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(_) => return Err("'id' must be a non-empty string".to_string()),
        None => return Err("missing 'id'".to_string()),
    };

    let text = match object.get("text") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(_) => return Err(format!("guideline '{}': 'text' must be a non-empty string", id)),
        None => return Err(format!("guideline '{}': missing 'text'", id)),
    };

    let topic = match object.get("topic") {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => Some(s.clone()),
        Some(_) => return Err(format!("guideline '{}': 'topic' must be a string", id)),
    };

    let expected_terms = match object.get("expected_terms") {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|t| t.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| format!("guideline '{}': 'expected_terms' must be strings", id))?,
        Some(_) => {
            return Err(format!(
                "guideline '{}': 'expected_terms' must be an array",
                id
            ))
        }
    };

    Ok(Guideline {
        id,
        text,
        topic,
        expected_terms,
        embedding: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_named_batch() {
        let batch = GuidelineBatch::from_json(
            r#"{"name": "clinical", "guidelines": [{"id": "g1", "text": "Wash hands"}]}"#,
        )
        .unwrap();
        assert_eq!(batch.collection.as_deref(), Some("clinical"));
        assert_eq!(batch.entries.len(), 1);
    }

    #[test]
    fn test_bare_array_batch() {
        let batch = GuidelineBatch::from_json(r#"[{"id": "g1", "text": "Wash hands"}]"#).unwrap();
        assert_eq!(batch.collection, None);
    }

    #[test]
    fn test_top_level_shape_rejected() {
        let err = GuidelineBatch::from_json(r#""just a string""#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
        let err = GuidelineBatch::from_json(r#"{"name": "x"}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
        let err = GuidelineBatch::from_json("not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_malformed_entries_are_skipped_with_reasons() {
        let batch = GuidelineBatch::from_json(
            r#"[
                {"id": "ok", "text": "fine", "expected_terms": ["a"], "topic": "t"},
                {"text": "no id"},
                {"id": "no-text"},
                42,
                {"id": "bad-terms", "text": "x", "expected_terms": [1]}
            ]"#,
        )
        .unwrap();
        let (valid, skipped) = batch.parse_entries();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].expected_terms, vec!["a".to_string()]);
        assert_eq!(valid[0].topic.as_deref(), Some("t"));
        let indexes: Vec<usize> = skipped.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);
        assert!(skipped[0].reason.contains("id"));
    }

    #[test]
    fn test_supplied_embedding_is_ignored() {
        let batch =
            GuidelineBatch::from_json(r#"[{"id": "g", "text": "t", "embedding": [1.0, 2.0]}]"#)
                .unwrap();
        let (valid, _) = batch.parse_entries();
        assert_eq!(valid[0].embedding, None);
    }

    #[test]
    fn test_numeric_id_accepted() {
        let batch = GuidelineBatch::from_json(r#"[{"id": 7, "text": "t"}]"#).unwrap();
        let (valid, _) = batch.parse_entries();
        assert_eq!(valid[0].id, "7");
    }
}
