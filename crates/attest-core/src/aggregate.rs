//! Aggregator: merges provider responses and guideline matches into a verdict.
//!
//! The policy is fixed and deterministic:
//! 1. The primary output is the first provider response with status `ok`
//! 2. Each ok provider is scored on agreement (with the reference answer if
//!    one was given, else with the primary) and on guideline compliance
//! 3. The aggregate score is the mean over ok providers
//! 4. If no provider succeeded the run is a `partial-failure` with score 0

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::guidelines::GuidelineMatch;
use crate::metrics::{bleu_score, calculate_cost, count_tokens, fact_coverage, CostRules};
use crate::similarity::{coverage, hybrid};
use crate::types::{
    MetricsSnapshot, ProviderAssessment, ProviderResponse, ProviderUsage, ValidationRequest,
    ValidationVerdict, VerdictState,
};

/// Default pass threshold when neither the request nor config sets one.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Default share of the provider score taken by guideline compliance.
pub const DEFAULT_GUIDELINE_WEIGHT: f64 = 0.3;

/// Scoring knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregationPolicy {
    pub threshold: f64,
    pub guideline_weight: f64,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            guideline_weight: DEFAULT_GUIDELINE_WEIGHT,
        }
    }
}

/// The Aggregator turns collected evidence into a [`ValidationVerdict`].
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    policy: AggregationPolicy,
    cost_rules: CostRules,
}

impl Aggregator {
    pub fn new(policy: AggregationPolicy) -> Self {
        Self {
            policy,
            cost_rules: CostRules::new(),
        }
    }

    pub fn with_cost_rules(mut self, rules: CostRules) -> Self {
        self.cost_rules = rules;
        self
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    /// Build the verdict for one run.
    ///
    /// `responses` must hold one entry per requested provider in request
    /// order; `matches` are the top-k guideline matches, best first.
    pub fn aggregate(
        &self,
        request: &ValidationRequest,
        responses: Vec<ProviderResponse>,
        matches: Vec<GuidelineMatch>,
    ) -> ValidationVerdict {
        let threshold = request.threshold.unwrap_or(self.policy.threshold);
        let metrics = self.metrics(request, &responses);

        let primary = responses.iter().find(|r| r.status.is_ok());
        let Some(primary) = primary else {
            return ValidationVerdict {
                state: VerdictState::PartialFailure,
                all_failed: true,
                responses,
                guideline_matches: matches,
                assessments: Vec::new(),
                aggregate_score: 0.0,
                passed: false,
                threshold,
                metrics,
                evaluated_at: Utc::now(),
            };
        };

        let anchor = request.reference.as_deref().unwrap_or(&primary.output);
        let weight = self.policy.guideline_weight.clamp(0.0, 1.0);

        let assessments: Vec<ProviderAssessment> = responses
            .iter()
            .filter(|r| r.status.is_ok())
            .map(|r| {
                let agreement = hybrid(anchor, &r.output);
                let compliance = compliance(&matches, &r.output);
                let score = match compliance {
                    Some(c) => (1.0 - weight) * agreement + weight * c,
                    None => agreement,
                };
                ProviderAssessment {
                    provider: r.provider.clone(),
                    agreement,
                    compliance,
                    score: score.clamp(0.0, 1.0),
                }
            })
            .collect();

        let aggregate_score =
            assessments.iter().map(|a| a.score).sum::<f64>() / assessments.len() as f64;

        ValidationVerdict {
            state: VerdictState::VerdictReady,
            all_failed: false,
            responses,
            guideline_matches: matches,
            assessments,
            aggregate_score,
            passed: aggregate_score >= threshold,
            threshold,
            metrics,
            evaluated_at: Utc::now(),
        }
    }

    fn metrics(&self, request: &ValidationRequest, responses: &[ProviderResponse]) -> MetricsSnapshot {
        let prompt_tokens = count_tokens(&request.prompt) as u64;

        let per_provider: Vec<ProviderUsage> = responses
            .iter()
            .filter(|r| r.status.is_ok())
            .map(|r| {
                let tokens_out = count_tokens(&r.output) as u64;
                let cost_usd = self
                    .cost_rules
                    .get(&r.provider)
                    .and_then(|_| {
                        calculate_cost(prompt_tokens, tokens_out, &r.provider, &self.cost_rules)
                            .ok()
                    });
                ProviderUsage {
                    provider: r.provider.clone(),
                    tokens_in: prompt_tokens,
                    tokens_out,
                    cost_usd,
                }
            })
            .collect();

        let costs: Vec<f64> = per_provider.iter().filter_map(|u| u.cost_usd).collect();
        let quality = match (
            request.reference.as_deref(),
            responses.iter().find(|r| r.status.is_ok()),
        ) {
            (Some(reference), Some(primary)) => Some(bleu_score(reference, &primary.output)),
            _ => None,
        };

        MetricsSnapshot {
            tokens_in: per_provider.iter().map(|u| u.tokens_in).sum(),
            tokens_out: per_provider.iter().map(|u| u.tokens_out).sum(),
            cost_usd: if costs.is_empty() {
                None
            } else {
                Some(costs.iter().sum())
            },
            quality,
            per_provider,
        }
    }
}

/// Weighted term coverage of `output` over the matched guidelines.
fn compliance(matches: &[GuidelineMatch], output: &str) -> Option<f64> {
    if matches.is_empty() {
        return None;
    }
    let scored: Vec<(f64, f64)> = matches
        .iter()
        .map(|m| {
            let covered = if m.expected_terms.is_empty() {
                coverage(&m.text, output)
            } else {
                fact_coverage(&m.expected_terms, output)
            };
            (m.score.clamp(0.0, 1.0), covered)
        })
        .collect();

    let total_weight: f64 = scored.iter().map(|(w, _)| w).sum();
    let value = if total_weight > 0.0 {
        scored.iter().map(|(w, c)| w * c).sum::<f64>() / total_weight
    } else {
        scored.iter().map(|(_, c)| c).sum::<f64>() / scored.len() as f64
    };
    Some(value.clamp(0.0, 1.0))
}
