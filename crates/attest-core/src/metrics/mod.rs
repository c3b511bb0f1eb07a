//! Metrics kit: stateless scoring utilities.

mod bias;
mod bleu;
mod content;
mod cost;
mod tokens;

pub use bias::{detect_bias, detect_drift, BiasReport};
pub use bleu::{bleu_score, MAX_ORDER};
pub use content::{
    accuracy, coherence, diversity, fact_coverage, factcheck_adv, fluency, plagiarism,
    plagiarism_ngram, rouge_l, FactCheck, PLAGIARISM_NGRAM,
};
pub use cost::{calculate_cost, CostRate, CostRules};
pub use tokens::{count_tokens, tokenize, TOKENIZER_RULE};
