//! JSON Schema validation for boundary payloads.
//!
//! Provider lists and guideline payloads arrive as JSON strings. Their shape
//! is checked against the schemas in `schemas/` before anything is
//! dispatched, so malformed requests are rejected whole.

use std::sync::OnceLock;
use thiserror::Error;

use crate::error::{EngineError, EngineResult};

const PROVIDERS_SCHEMA_JSON: &str = include_str!("../../../schemas/providers.schema.json");
const GUIDELINES_SCHEMA_JSON: &str = include_str!("../../../schemas/guidelines.schema.json");
const GUIDELINE_REFERENCE_SCHEMA_JSON: &str =
    include_str!("../../../schemas/guideline-reference.schema.json");

type CompiledSchema = OnceLock<Result<jsonschema::Validator, String>>;

static PROVIDERS_SCHEMA: CompiledSchema = OnceLock::new();
static GUIDELINES_SCHEMA: CompiledSchema = OnceLock::new();
static GUIDELINE_REFERENCE_SCHEMA: CompiledSchema = OnceLock::new();

/// Payload kinds with a published schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSchema {
    /// Array of provider configurations.
    Providers,
    /// Guideline collection or bare array of entries.
    GuidelineBatch,
    /// `{"collection": ..., "method": ...}` pointer to a stored collection.
    GuidelineReference,
}

impl PayloadSchema {
    fn source(&self) -> &'static str {
        match self {
            PayloadSchema::Providers => PROVIDERS_SCHEMA_JSON,
            PayloadSchema::GuidelineBatch => GUIDELINES_SCHEMA_JSON,
            PayloadSchema::GuidelineReference => GUIDELINE_REFERENCE_SCHEMA_JSON,
        }
    }

    fn cell(&self) -> &'static CompiledSchema {
        match self {
            PayloadSchema::Providers => &PROVIDERS_SCHEMA,
            PayloadSchema::GuidelineBatch => &GUIDELINES_SCHEMA,
            PayloadSchema::GuidelineReference => &GUIDELINE_REFERENCE_SCHEMA,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PayloadSchema::Providers => "providers",
            PayloadSchema::GuidelineBatch => "guidelines",
            PayloadSchema::GuidelineReference => "guideline reference",
        }
    }
}

/// Errors from schema loading.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Failed to load schema: {0}")]
    LoadError(String),
}

fn get_validator(schema: PayloadSchema) -> Result<&'static jsonschema::Validator, SchemaError> {
    let result = schema.cell().get_or_init(|| {
        let schema_value: serde_json::Value = match serde_json::from_str(schema.source()) {
            Ok(v) => v,
            Err(e) => return Err(format!("Invalid schema JSON: {}", e)),
        };

        match jsonschema::options().build(&schema_value) {
            Ok(v) => Ok(v),
            Err(e) => Err(format!("Failed to compile schema: {}", e)),
        }
    });

    match result {
        Ok(v) => Ok(v),
        Err(e) => Err(SchemaError::LoadError(e.clone())),
    }
}

/// Validate a payload, returning every violation found.
pub fn validate_payload(
    schema: PayloadSchema,
    value: &serde_json::Value,
) -> Result<(), Vec<String>> {
    let validator = get_validator(schema).map_err(|e| vec![e.to_string()])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a payload, folding violations into one `ERR_MALFORMED_INPUT`.
pub fn check(schema: PayloadSchema, value: &serde_json::Value) -> EngineResult<()> {
    validate_payload(schema, value).map_err(|errors| {
        EngineError::malformed(format!(
            "invalid {} payload: {}",
            schema.label(),
            errors.join("; ")
        ))
    })
}

/// Whether a payload matches its schema.
pub fn is_valid(schema: PayloadSchema, value: &serde_json::Value) -> bool {
    get_validator(schema)
        .map(|v| v.is_valid(value))
        .unwrap_or(false)
}
