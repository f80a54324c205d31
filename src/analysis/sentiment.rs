//! Lexicon-based sentiment scoring
//!
//! Tokenizes on word boundaries, matches against disjoint positive/negative
//! word lists, and flips a match's sign when it is immediately preceded by a
//! negation token ("not calm" counts as negative). The normalized score is
//! the signed sum divided by the number of matched tokens.

use crate::models::{round3, SentimentBand, SentimentResult};
use regex::Regex;
use std::collections::HashSet;

const POSITIVE_WORDS: &[&str] = &[
    "calm",
    "hope",
    "relief",
    "grateful",
    "progress",
    "better",
    "supported",
    "proud",
    "strong",
    "encouraged",
    "improving",
    "relaxed",
];

const NEGATIVE_WORDS: &[&str] = &[
    "sad",
    "angry",
    "upset",
    "anxious",
    "stressed",
    "scared",
    "lonely",
    "hopeless",
    "worthless",
    "tired",
    "empty",
    "numb",
    "depressed",
    "afraid",
    "ashamed",
    "guilty",
    "fail",
    "failure",
    "broken",
    "hurt",
];

const NEGATIONS: &[&str] = &["not", "never", "no", "hardly", "barely"];

/// Scores a message's emotional valence from a fixed lexicon.
pub struct SentimentAnalyzer {
    word_re: Regex,
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
    negations: HashSet<&'static str>,
}

impl Default for SentimentAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SentimentAnalyzer {
    pub fn new() -> Self {
        Self {
            // The pattern is a literal constant, so compilation cannot fail.
            word_re: Regex::new(r"[a-zA-Z']+").expect("valid word pattern"),
            positive: POSITIVE_WORDS.iter().copied().collect(),
            negative: NEGATIVE_WORDS.iter().copied().collect(),
            negations: NEGATIONS.iter().copied().collect(),
        }
    }

    /// Score `text`. Deterministic, no side effects.
    pub fn score(&self, text: &str) -> SentimentResult {
        let tokens: Vec<String> = self
            .word_re
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();

        let mut matched_tokens = Vec::new();
        let mut signed_sum = 0i64;
        let mut matched = 0u64;

        for (idx, token) in tokens.iter().enumerate() {
            let negated = idx > 0 && self.negations.contains(tokens[idx - 1].as_str());
            let modifier: i64 = if negated { -1 } else { 1 };

            if self.positive.contains(token.as_str()) {
                signed_sum += modifier;
                matched += 1;
                matched_tokens.push(token.clone());
            } else if self.negative.contains(token.as_str()) {
                signed_sum -= modifier;
                matched += 1;
                matched_tokens.push(token.clone());
            }
        }

        let normalized = if matched > 0 {
            signed_sum as f64 / matched as f64
        } else {
            0.0
        };

        SentimentResult {
            score: round3(normalized),
            band: SentimentBand::from_score(normalized),
            tokens: matched_tokens,
        }
    }
}
