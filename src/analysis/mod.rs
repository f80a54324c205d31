//! Message analysis: lexicon sentiment scoring and risk classification
//!
//! Both analyzers are pure and stateless once constructed, so a single
//! instance can be shared across request workers without locking.

mod risk;
mod sentiment;

pub use risk::{RiskAdapter, RiskClassifier};
pub use sentiment::SentimentAnalyzer;
