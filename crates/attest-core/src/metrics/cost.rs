//! Cost calculation from per-provider rate tables.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::{EngineError, EngineResult, ErrorCode};

/// Per-token USD rates for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRate {
    pub rate_in: f64,
    pub rate_out: f64,
}

/// Mapping from provider name to its [`CostRate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostRules {
    rates: BTreeMap<String, CostRate>,
}

impl CostRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: impl Into<String>, rate: CostRate) {
        self.rates.insert(provider.into(), rate);
    }

    pub fn get(&self, provider: &str) -> Option<&CostRate> {
        self.rates.get(provider)
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Parse rules from a JSON string. See [`CostRules::from_value`].
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let value: JsonValue = serde_json::from_str(json)?;
        Self::from_value(&value)
    }

    /// Parse rules from either accepted JSON form.
    ///
    /// Map form uses per-token rates:
    /// `{"acme": {"rate_in": 0.002, "rate_out": 0.004}}`.
    ///
    /// List form uses per-thousand rates:
    /// `[{"match": "openai:gpt-4o-mini", "usd_per_1k_in": 0.15, "usd_per_1k_out": 0.6}]`.
    pub fn from_value(value: &JsonValue) -> EngineResult<Self> {
        let mut rules = CostRules::new();
        match value {
            JsonValue::Object(map) => {
                for (name, entry) in map {
                    let rate_in = number_field(entry, "rate_in", name)?;
                    let rate_out = number_field(entry, "rate_out", name)?;
                    rules.insert(name.clone(), CostRate { rate_in, rate_out });
                }
            }
            JsonValue::Array(items) => {
                for (index, entry) in items.iter().enumerate() {
                    let name = entry["match"].as_str().ok_or_else(|| {
                        EngineError::malformed(format!("cost rule {} is missing 'match'", index))
                    })?;
                    let per_1k_in = number_field(entry, "usd_per_1k_in", name)?;
                    let per_1k_out = number_field(entry, "usd_per_1k_out", name)?;
                    rules.insert(
                        name,
                        CostRate {
                            rate_in: per_1k_in / 1000.0,
                            rate_out: per_1k_out / 1000.0,
                        },
                    );
                }
            }
            JsonValue::Null => {}
            _ => {
                return Err(EngineError::malformed(
                    "cost rules must be an object or an array",
                ))
            }
        }
        Ok(rules)
    }
}

fn number_field(entry: &JsonValue, field: &str, provider: &str) -> EngineResult<f64> {
    let value = entry[field].as_f64().ok_or_else(|| {
        EngineError::malformed(format!("cost rule '{}' needs numeric '{}'", provider, field))
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::malformed(format!(
            "cost rule '{}' has invalid '{}': {}",
            provider, field, value
        )));
    }
    Ok(value)
}

/// Cost of a call: `rate_in * tokens_in + rate_out * tokens_out`.
///
/// Fails with `ERR_COST_RULE` when `provider_name` has no rule.
pub fn calculate_cost(
    tokens_in: u64,
    tokens_out: u64,
    provider_name: &str,
    rules: &CostRules,
) -> EngineResult<f64> {
    let rate = rules.get(provider_name).ok_or_else(|| {
        EngineError::new(
            ErrorCode::CostRule,
            format!("no cost rule for provider '{}'", provider_name),
        )
    })?;
    Ok(rate.rate_in * tokens_in as f64 + rate.rate_out * tokens_out as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acme_rules() -> CostRules {
        CostRules::from_json(r#"{"acme": {"rate_in": 0.002, "rate_out": 0.004}}"#).unwrap()
    }

    #[test]
    fn test_cost_lookup() {
        let cost = calculate_cost(100, 50, "acme", &acme_rules()).unwrap();
        assert!((cost - 0.4).abs() < 1e-12, "cost {}", cost);
    }

    #[test]
    fn test_missing_rule_is_cost_rule_error() {
        let err = calculate_cost(100, 50, "missing", &acme_rules()).unwrap_err();
        assert_eq!(err.code, ErrorCode::CostRule);
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        assert_eq!(calculate_cost(0, 0, "acme", &acme_rules()).unwrap(), 0.0);
    }

    #[test]
    fn test_list_form_is_per_thousand() {
        let rules = CostRules::from_json(
            r#"[{"match": "openai:gpt-4o-mini", "usd_per_1k_in": 0.15, "usd_per_1k_out": 0.6}]"#,
        )
        .unwrap();
        let cost = calculate_cost(1000, 1000, "openai:gpt-4o-mini", &rules).unwrap();
        assert!((cost - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_negative_rate_rejected() {
        let err = CostRules::from_json(r#"{"acme": {"rate_in": -1, "rate_out": 0}}"#).unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_non_object_rules_rejected() {
        let err = CostRules::from_json("42").unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedInput);
    }

    #[test]
    fn test_rules_deserialize_from_map() {
        let rules: CostRules =
            serde_json::from_str(r#"{"acme": {"rate_in": 0.1, "rate_out": 0.2}}"#).unwrap();
        assert_eq!(rules.get("acme").unwrap().rate_out, 0.2);
    }
}
