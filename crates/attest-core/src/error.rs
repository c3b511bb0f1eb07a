//! Error taxonomy shared by every engine operation.
//!
//! Anything that crosses the engine boundary is an [`EngineError`]: a stable
//! [`ErrorCode`] plus a human-readable message. Module-level errors convert
//! into it at the seams.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_INIT")]
    Init,
    #[serde(rename = "ERR_PROVIDER_TRANSPORT")]
    ProviderTransport,
    #[serde(rename = "ERR_PROVIDER_AUTH")]
    ProviderAuth,
    #[serde(rename = "ERR_MALFORMED_INPUT")]
    MalformedInput,
    #[serde(rename = "ERR_GUIDE_METHOD")]
    GuideMethod,
    #[serde(rename = "ERR_GUIDE_NOT_FOUND")]
    GuideNotFound,
    #[serde(rename = "ERR_GUIDE_INGEST")]
    GuideIngest,
    #[serde(rename = "ERR_GUIDE_SAVE")]
    GuideSave,
    #[serde(rename = "ERR_PERSISTENCE")]
    Persistence,
    #[serde(rename = "ERR_COST_RULE")]
    CostRule,
}

impl ErrorCode {
    /// The wire form of the code, e.g. `ERR_COST_RULE`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Init => "ERR_INIT",
            ErrorCode::ProviderTransport => "ERR_PROVIDER_TRANSPORT",
            ErrorCode::ProviderAuth => "ERR_PROVIDER_AUTH",
            ErrorCode::MalformedInput => "ERR_MALFORMED_INPUT",
            ErrorCode::GuideMethod => "ERR_GUIDE_METHOD",
            ErrorCode::GuideNotFound => "ERR_GUIDE_NOT_FOUND",
            ErrorCode::GuideIngest => "ERR_GUIDE_INGEST",
            ErrorCode::GuideSave => "ERR_GUIDE_SAVE",
            ErrorCode::Persistence => "ERR_PERSISTENCE",
            ErrorCode::CostRule => "ERR_COST_RULE",
        }
    }

    /// Taxonomy class the code belongs to.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::Init => "initialization-error",
            ErrorCode::ProviderTransport => "provider-transport-error",
            ErrorCode::ProviderAuth => "provider-auth-error",
            ErrorCode::MalformedInput | ErrorCode::GuideIngest => "malformed-input",
            ErrorCode::GuideMethod => "unknown-method",
            ErrorCode::GuideNotFound => "guideline-not-found",
            ErrorCode::GuideSave | ErrorCode::Persistence => "persistence-error",
            ErrorCode::CostRule => "cost-rule-missing",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `(code, message)` error returned by every engine operation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub code: ErrorCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MalformedInput, message)
    }

    pub fn unknown_method(tag: &str) -> Self {
        Self::new(
            ErrorCode::GuideMethod,
            format!("unknown scoring method '{}'", tag),
        )
    }

    pub fn collection_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::GuideNotFound,
            format!("guideline collection '{}' not found", name),
        )
    }

    pub fn not_initialized() -> Self {
        Self::new(
            ErrorCode::Init,
            "engine not initialized: call initialize() first",
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::malformed(format!("invalid JSON: {}", e))
    }
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_code() {
        let err = EngineError::new(ErrorCode::CostRule, "no rule for 'acme'");
        assert_eq!(err.to_string(), "ERR_COST_RULE: no rule for 'acme'");
    }

    #[test]
    fn test_error_serializes_as_code_and_message() {
        let err = EngineError::unknown_method("fuzzy");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "ERR_GUIDE_METHOD");
        assert!(json["message"].as_str().unwrap().contains("fuzzy"));
    }

    #[test]
    fn test_codes_map_to_taxonomy() {
        assert_eq!(ErrorCode::Init.category(), "initialization-error");
        assert_eq!(ErrorCode::GuideSave.category(), "persistence-error");
        assert_eq!(ErrorCode::CostRule.category(), "cost-rule-missing");
    }

    #[test]
    fn test_json_error_is_malformed_input() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: EngineError = parse.unwrap_err().into();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }
}
