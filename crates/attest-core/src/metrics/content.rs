//! Content quality heuristics beyond BLEU.
//!
//! All scores are in `[0, 1]` and use the same tokenization as
//! [`count_tokens`](super::count_tokens).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::tokens::tokenize;

/// Shingle size used by [`plagiarism`].
pub const PLAGIARISM_NGRAM: usize = 3;

/// Words that flip the meaning of a nearby fact.
const NEGATORS: &[&str] = &["not", "no", "never", "without", "contraindicated", "avoid"];

/// Tokens on either side of a fact's head word searched for a negator.
const NEGATION_WINDOW: usize = 3;

/// Share of a fact penalty removed per contradicted fact.
const CONTRADICTION_PENALTY: f64 = 0.7;

/// ROUGE-L F1 over the longest common token subsequence.
pub fn rouge_l(reference: &str, candidate: &str) -> f64 {
    let r = tokenize(reference);
    let c = tokenize(candidate);
    if r.is_empty() || c.is_empty() {
        return 0.0;
    }

    let mut dp = vec![vec![0usize; c.len() + 1]; r.len() + 1];
    for i in 0..r.len() {
        for j in 0..c.len() {
            dp[i + 1][j + 1] = if r[i] == c[j] {
                dp[i][j] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    let lcs = dp[r.len()][c.len()] as f64;
    let precision = lcs / c.len() as f64;
    let recall = lcs / r.len() as f64;
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Positional token agreement between `expected` and `generated`.
pub fn accuracy(expected: &str, generated: &str) -> f64 {
    let e = tokenize(expected);
    let g = tokenize(generated);
    if e.is_empty() && g.is_empty() {
        return 1.0;
    }
    let matches = e.iter().zip(g.iter()).filter(|(a, b)| a == b).count();
    matches as f64 / e.len().max(g.len()) as f64
}

/// Share of `facts` that appear (case-insensitively) in `candidate`.
///
/// An empty fact list is vacuously covered. Blank facts never match.
pub fn fact_coverage(facts: &[String], candidate: &str) -> f64 {
    if facts.is_empty() {
        return 1.0;
    }
    let haystack = candidate.to_lowercase();
    let hits = facts
        .iter()
        .filter(|f| !f.trim().is_empty() && haystack.contains(&f.to_lowercase()))
        .count();
    hits as f64 / facts.len() as f64
}

/// Fact coverage discounted by negated mentions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactCheck {
    pub score: f64,
    pub coverage: f64,
    /// Share of facts whose head word sits next to a negator.
    pub contradiction_rate: f64,
}

/// [`fact_coverage`] with a penalty for facts the candidate negates.
///
/// A fact counts as contradicted when its first word appears in the
/// candidate within three tokens of a negator such as `not` or `avoid`.
pub fn factcheck_adv(facts: &[String], candidate: &str) -> FactCheck {
    let coverage = fact_coverage(facts, candidate);
    let tokens: Vec<String> = tokenize(candidate)
        .into_iter()
        .map(str::to_lowercase)
        .collect();

    let contradicted = facts
        .iter()
        .filter_map(|fact| tokenize(fact).first().map(|head| head.to_lowercase()))
        .filter(|head| {
            tokens.iter().enumerate().any(|(i, token)| {
                token == head
                    && tokens[i.saturating_sub(NEGATION_WINDOW)..(i + NEGATION_WINDOW).min(tokens.len())]
                        .iter()
                        .any(|t| NEGATORS.contains(&t.as_str()))
            })
        })
        .count();
    let contradiction_rate = contradicted as f64 / facts.len().max(1) as f64;

    FactCheck {
        score: (coverage * (1.0 - CONTRADICTION_PENALTY * contradiction_rate)).clamp(0.0, 1.0),
        coverage,
        contradiction_rate,
    }
}

fn shingles(text: &str, n: usize) -> HashSet<String> {
    let words: Vec<String> = tokenize(text)
        .into_iter()
        .filter(|t| t.chars().any(char::is_alphanumeric))
        .map(str::to_lowercase)
        .collect();
    if words.len() < n {
        return HashSet::new();
    }
    words.windows(n).map(|w| w.join(" ")).collect()
}

/// Highest Jaccard similarity of word `n`-gram sets between `candidate` and
/// any corpus document. `n` below 1 is treated as 1.
pub fn plagiarism_ngram(corpus: &[String], candidate: &str, n: usize) -> f64 {
    let n = n.max(1);
    let target = shingles(candidate, n);
    if target.is_empty() {
        return 0.0;
    }
    corpus
        .iter()
        .map(|doc| {
            let other = shingles(doc, n);
            let union = target.union(&other).count();
            if union == 0 {
                0.0
            } else {
                target.intersection(&other).count() as f64 / union as f64
            }
        })
        .fold(0.0, f64::max)
}

/// [`plagiarism_ngram`] over word trigrams.
pub fn plagiarism(corpus: &[String], candidate: &str) -> f64 {
    plagiarism_ngram(corpus, candidate, PLAGIARISM_NGRAM)
}

/// One minus the ratio of repeated bigrams.
pub fn coherence(text: &str) -> f64 {
    let tokens = tokenize(text);
    if tokens.len() < 2 {
        return 1.0;
    }
    let mut seen = HashSet::new();
    let repeats = tokens
        .windows(2)
        .filter(|pair| !seen.insert((pair[0], pair[1])))
        .count();
    1.0 - repeats as f64 / (tokens.len() - 1) as f64
}

/// Type/token ratio across all samples.
pub fn diversity(samples: &[String]) -> f64 {
    let mut types = HashSet::new();
    let mut total = 0usize;
    for sample in samples {
        for token in tokenize(sample) {
            types.insert(token);
            total += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    types.len() as f64 / total as f64
}

/// Share of tokens containing at least one vowel.
pub fn fluency(text: &str) -> f64 {
    let tokens = tokenize(text);
    if tokens.is_empty() {
        return 0.0;
    }
    let voiced = tokens
        .iter()
        .filter(|t| t.chars().any(|ch| "aeiouAEIOU".contains(ch)))
        .count();
    voiced as f64 / tokens.len() as f64
}
