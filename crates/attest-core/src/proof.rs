//! Proof generator.
//!
//! A proof is a set of SHA-256 digests over the evidence behind a verdict:
//! the request, each provider response, each matched guideline and the
//! verdict outcome. Every component is hashed under its own domain tag and
//! the aggregate folds the scheme tag and all component digests in a fixed
//! order. Timestamps, latencies and error text never enter a digest, so the
//! same evidence yields the same proof on any host.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{EngineError, ErrorCode};
use crate::types::{ValidationRequest, ValidationVerdict};

/// Identifier of the hashing scheme below.
pub const PROOF_SCHEME: &str = "attest-proof-v1";

const TAG_REQUEST: &[u8] = b"ATTEST:PROOF:REQUEST";
const TAG_RESPONSE: &[u8] = b"ATTEST:PROOF:RESPONSE";
const TAG_GUIDELINE: &[u8] = b"ATTEST:PROOF:GUIDELINE";
const TAG_VERDICT: &[u8] = b"ATTEST:PROOF:VERDICT";
const TAG_AGGREGATE: &[u8] = b"ATTEST:PROOF:AGGREGATE";

/// Digests over the evidence of one validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationProof {
    pub scheme: String,
    pub request_hash: String,
    /// One per requested provider, in request order.
    pub response_hashes: Vec<String>,
    /// One per matched guideline, sorted by guideline id.
    pub guideline_hashes: Vec<String>,
    pub verdict_hash: String,
    pub aggregate_hash: String,
}

impl ValidationProof {
    /// Whether `aggregate_hash` matches the component digests.
    pub fn is_self_consistent(&self) -> bool {
        self.scheme == PROOF_SCHEME
            && aggregate_digest(
                &self.request_hash,
                &self.response_hashes,
                &self.guideline_hashes,
                &self.verdict_hash,
            ) == self.aggregate_hash
    }
}

/// Reasons a proof does not match its evidence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("unsupported proof scheme '{0}'")]
    SchemeMismatch(String),

    #[error("proof field '{field}' does not match the evidence")]
    HashMismatch { field: String },
}

impl From<ProofError> for EngineError {
    fn from(e: ProofError) -> Self {
        EngineError::new(ErrorCode::MalformedInput, e.to_string())
    }
}

/// Builds and checks [`ValidationProof`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProofGenerator;

impl ProofGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, request: &ValidationRequest, verdict: &ValidationVerdict) -> ValidationProof {
        let request_hash = request_digest(request);
        let response_hashes = response_digests(request, verdict);
        let guideline_hashes = guideline_digests(verdict);
        let verdict_hash = verdict_digest(verdict);
        let aggregate_hash =
            aggregate_digest(&request_hash, &response_hashes, &guideline_hashes, &verdict_hash);

        ValidationProof {
            scheme: PROOF_SCHEME.to_string(),
            request_hash,
            response_hashes,
            guideline_hashes,
            verdict_hash,
            aggregate_hash,
        }
    }

    /// Recompute `proof` from the evidence, reporting the first mismatch.
    pub fn verify(
        &self,
        proof: &ValidationProof,
        request: &ValidationRequest,
        verdict: &ValidationVerdict,
    ) -> Result<(), ProofError> {
        if proof.scheme != PROOF_SCHEME {
            return Err(ProofError::SchemeMismatch(proof.scheme.clone()));
        }
        let expected = self.generate(request, verdict);
        let checks: [(&str, bool); 5] = [
            ("request_hash", proof.request_hash == expected.request_hash),
            ("response_hashes", proof.response_hashes == expected.response_hashes),
            ("guideline_hashes", proof.guideline_hashes == expected.guideline_hashes),
            ("verdict_hash", proof.verdict_hash == expected.verdict_hash),
            ("aggregate_hash", proof.aggregate_hash == expected.aggregate_hash),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(ProofError::HashMismatch {
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }
}

fn tagged_digest(tag: &[u8], payload: &JsonValue) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

fn request_digest(request: &ValidationRequest) -> String {
    let providers: Vec<JsonValue> = request
        .providers
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "kind": p.kind.as_str(),
                "base_url": p.base_url,
                "model": p.model,
            })
        })
        .collect();
    let mut payload = json!({
        "prompt": request.prompt,
        "providers": providers,
        "guideline_collection": request.guideline_collection,
        "guideline_method": request.guideline_method,
        "reference": request.reference,
        "threshold": request.threshold,
    });
    // The key is absent, not null, for unsalted requests.
    if let Some(salt) = &request.salt {
        payload["salt"] = JsonValue::String(salt.clone());
    }
    tagged_digest(TAG_REQUEST, &payload)
}

fn response_digests(request: &ValidationRequest, verdict: &ValidationVerdict) -> Vec<String> {
    request
        .providers
        .iter()
        .map(|descriptor| {
            let payload = match verdict.responses.iter().find(|r| r.provider == descriptor.name) {
                Some(r) => json!({
                    "provider": r.provider,
                    "status": r.status.as_str(),
                    "output": r.output,
                }),
                None => json!({
                    "provider": descriptor.name,
                    "status": "missing",
                }),
            };
            tagged_digest(TAG_RESPONSE, &payload)
        })
        .collect()
}

fn guideline_digests(verdict: &ValidationVerdict) -> Vec<String> {
    let mut matches: Vec<_> = verdict.guideline_matches.iter().collect();
    matches.sort_by(|a, b| a.id.cmp(&b.id));
    matches
        .into_iter()
        .map(|m| tagged_digest(TAG_GUIDELINE, &json!({"id": m.id, "text": m.text})))
        .collect()
}

fn verdict_digest(verdict: &ValidationVerdict) -> String {
    tagged_digest(
        TAG_VERDICT,
        &json!({
            "aggregate_score": format!("{:.6}", verdict.aggregate_score),
            "passed": verdict.passed,
            "state": verdict.state.as_str(),
            "all_failed": verdict.all_failed,
        }),
    )
}

fn aggregate_digest(
    request_hash: &str,
    response_hashes: &[String],
    guideline_hashes: &[String],
    verdict_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(TAG_AGGREGATE);
    hasher.update([0u8]);
    hasher.update(PROOF_SCHEME.as_bytes());
    hasher.update([0u8]);
    hasher.update(request_hash.as_bytes());
    hasher.update((response_hashes.len() as u64).to_be_bytes());
    for h in response_hashes {
        hasher.update(h.as_bytes());
    }
    hasher.update((guideline_hashes.len() as u64).to_be_bytes());
    for h in guideline_hashes {
        hasher.update(h.as_bytes());
    }
    hasher.update(verdict_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compact JSON with object keys sorted at every level.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
