//! Pronoun balance and vocabulary drift across sample sets.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::tokens::tokenize;

const PRONOUN_GROUPS: &[(&str, &[&str])] = &[
    ("male", &["he", "him", "his"]),
    ("female", &["she", "her", "hers"]),
    ("neutral", &["they", "them", "their"]),
];

/// Pronoun counts per group and the male/female disparity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasReport {
    /// Only groups that occur at least once.
    pub group_counts: BTreeMap<String, usize>,
    /// `|male - female| / max(male, female)`; `0` when neither occurs.
    pub bias_score: f64,
}

/// Count gendered pronouns across `samples`.
///
/// Pronouns are matched as whole tokens, case-insensitively.
pub fn detect_bias(samples: &[String]) -> BiasReport {
    let mut group_counts = BTreeMap::new();
    for sample in samples {
        for token in tokenize(sample) {
            let token = token.to_lowercase();
            if let Some((group, _)) = PRONOUN_GROUPS
                .iter()
                .find(|(_, words)| words.contains(&token.as_str()))
            {
                *group_counts.entry(group.to_string()).or_insert(0) += 1;
            }
        }
    }

    let male = group_counts.get("male").copied().unwrap_or(0) as f64;
    let female = group_counts.get("female").copied().unwrap_or(0) as f64;
    let bias_score = if male == 0.0 && female == 0.0 {
        0.0
    } else {
        (male - female).abs() / male.max(female)
    };
    BiasReport {
        group_counts,
        bias_score,
    }
}

fn frequencies(samples: &[String]) -> HashMap<String, f64> {
    let mut counts: HashMap<String, f64> = HashMap::new();
    for sample in samples {
        for word in sample.split_whitespace() {
            *counts.entry(word.to_string()).or_insert(0.0) += 1.0;
        }
    }
    let total: f64 = counts.values().sum();
    if total > 0.0 {
        counts.values_mut().for_each(|v| *v /= total);
    }
    counts
}

/// Total variation distance between the word distributions of two sample
/// sets, in `[0, 1]`.
pub fn detect_drift(previous: &[String], current: &[String]) -> f64 {
    let before = frequencies(previous);
    let after = frequencies(current);
    let l1: f64 = before
        .keys()
        .chain(after.keys().filter(|k| !before.contains_key(*k)))
        .map(|word| {
            (before.get(word).copied().unwrap_or(0.0) - after.get(word).copied().unwrap_or(0.0))
                .abs()
        })
        .sum();
    (l1 / 2.0).min(1.0)
}
