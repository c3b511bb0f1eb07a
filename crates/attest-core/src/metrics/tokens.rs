//! Token accounting.
//!
//! Costs are derived from these counts, so the rule below is part of the
//! public contract and must not change between versions.

use lazy_static::lazy_static;
use regex::Regex;

/// Tokenization rule used by [`count_tokens`] and the BLEU scorer.
///
/// Every maximal run of letters, digits or underscores is one token, and
/// every other non-whitespace character is a token of its own. Whitespace
/// only separates tokens.
pub const TOKENIZER_RULE: &str = r"[\p{L}\p{N}_]+|[^\s\p{L}\p{N}_]";

lazy_static! {
    static ref TOKEN_PATTERN: Regex = Regex::new(TOKENIZER_RULE).unwrap();
}

/// Split text into tokens according to [`TOKENIZER_RULE`].
pub fn tokenize(text: &str) -> Vec<&str> {
    TOKEN_PATTERN.find_iter(text).map(|m| m.as_str()).collect()
}

/// Count tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    TOKEN_PATTERN.find_iter(text).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_has_no_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("   \n\t"), 0);
    }

    #[test]
    fn test_punctuation_is_separate() {
        assert_eq!(tokenize("Hello, world!"), vec!["Hello", ",", "world", "!"]);
        assert_eq!(count_tokens("Hello, world!"), 4);
    }

    #[test]
    fn test_numbers_and_underscores_stay_together() {
        assert_eq!(tokenize("gpt_4o costs 0.15"), vec!["gpt_4o", "costs", "0", ".", "15"]);
    }

    #[test]
    fn test_unicode_letters() {
        assert_eq!(count_tokens("ação rápida"), 2);
    }
}
