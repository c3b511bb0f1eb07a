//! Lexical and vector similarity measures.
//!
//! Lexical measures work on lowercase word tokens (runs of letters and
//! digits); punctuation is ignored.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

lazy_static! {
    static ref WORD_PATTERN: Regex = Regex::new(r"[\p{L}\p{N}]+").unwrap();
}

/// Lowercase word tokens of `text`.
pub fn words(text: &str) -> Vec<String> {
    WORD_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn word_set(text: &str) -> BTreeSet<String> {
    words(text).into_iter().collect()
}

/// Jaccard index of the two word sets (token overlap).
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a = word_set(a);
    let b = word_set(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Cosine similarity of bag-of-words term frequencies.
pub fn bow_cosine(a: &str, b: &str) -> f64 {
    let a = term_frequencies(a);
    let b = term_frequencies(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm_a = a.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.values().map(|x| x * x).sum::<f64>().sqrt();
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Mean of [`bow_cosine`] and [`jaccard`].
pub fn hybrid(a: &str, b: &str) -> f64 {
    0.5 * bow_cosine(a, b) + 0.5 * jaccard(a, b)
}

/// Fraction of the words of `reference` that also appear in `candidate`.
pub fn coverage(reference: &str, candidate: &str) -> f64 {
    let reference = word_set(reference);
    if reference.is_empty() {
        return 0.0;
    }
    let candidate = word_set(candidate);
    reference.intersection(&candidate).count() as f64 / reference.len() as f64
}

fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let mut tf = BTreeMap::new();
    for word in words(text) {
        *tf.entry(word).or_insert(0.0) += 1.0;
    }
    tf
}

/// Cosine similarity of two vectors.
///
/// Mismatched lengths or a zero-norm operand score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left as is.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_lowercase_and_strip_punctuation() {
        assert_eq!(words("Hello, World!"), vec!["hello", "world"]);
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard("a b", "a b"), 1.0);
        assert!((jaccard("a b c", "b c d") - 0.5).abs() < 1e-12);
        assert_eq!(jaccard("", ""), 0.0);
    }

    #[test]
    fn test_bow_cosine_identical() {
        assert!((bow_cosine("red fish blue fish", "red fish blue fish") - 1.0).abs() < 1e-9);
        assert_eq!(bow_cosine("red", "blue"), 0.0);
    }

    #[test]
    fn test_hybrid_identical_is_one() {
        assert!((hybrid("The answer is 42.", "the answer is 42") - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_coverage() {
        assert!((coverage("wash hands often", "Always wash your hands.") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(coverage("", "anything"), 0.0);
    }

    #[test]
    fn test_cosine_vectors() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }
}
