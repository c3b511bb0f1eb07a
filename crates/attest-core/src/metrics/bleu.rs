//! BLEU-style quality score.

use std::collections::HashMap;

use super::tokens::tokenize;

/// Highest n-gram order considered.
pub const MAX_ORDER: usize = 4;

/// Score `candidate` against `reference`, returning a value in `[0, 1]`.
///
/// Orders `1..=min(4, |candidate|)` are combined by geometric mean. Unigram
/// precision is the raw clipped precision (zero unigram overlap scores 0);
/// higher orders use add-one smoothing so short texts are not zeroed out.
/// A brevity penalty of `exp(1 - r/c)` applies when the candidate is not
/// longer than the reference. Identical non-empty texts score exactly 1.
pub fn bleu_score(reference: &str, candidate: &str) -> f64 {
    let reference = tokenize(reference);
    let candidate = tokenize(candidate);
    if reference.is_empty() || candidate.is_empty() {
        return 0.0;
    }

    let max_order = MAX_ORDER.min(candidate.len());
    let mut log_sum = 0.0;

    for n in 1..=max_order {
        let (matched, total) = clipped_matches(&reference, &candidate, n);
        let precision = if n == 1 {
            if matched == 0 {
                return 0.0;
            }
            matched as f64 / total as f64
        } else {
            (matched as f64 + 1.0) / (total as f64 + 1.0)
        };
        log_sum += precision.ln();
    }

    let geo_mean = (log_sum / max_order as f64).exp();

    let r = reference.len() as f64;
    let c = candidate.len() as f64;
    let brevity = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    (geo_mean * brevity).clamp(0.0, 1.0)
}

/// Clipped n-gram matches and total candidate n-grams for order `n`.
fn clipped_matches(reference: &[&str], candidate: &[&str], n: usize) -> (usize, usize) {
    let ref_counts = ngram_counts(reference, n);
    let cand_counts = ngram_counts(candidate, n);

    let matched = cand_counts
        .iter()
        .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    let total = candidate.len().saturating_sub(n - 1);

    (matched, total)
}

fn ngram_counts<'a>(tokens: &[&'a str], n: usize) -> HashMap<Vec<&'a str>, usize> {
    let mut counts = HashMap::new();
    if tokens.len() < n {
        return counts;
    }
    for window in tokens.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}
