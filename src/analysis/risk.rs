//! Keyword-driven risk classification with pluggable adapters
//!
//! The classifier runs a fixed rule ladder (crisis phrases, high-severity
//! keywords, caution keywords, sentiment fallback, history escalation) and
//! then merges opinions from registered adapters at max severity. Adapter
//! failures are recorded as assessment notes and never abort a request.

use crate::models::{
    round3, ResourceDescriptor, RiskAssessment, RiskTier, SentimentBand, SentimentResult,
};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};

const CRISIS_PHRASES: &[&str] = &[
    "kill myself",
    "end my life",
    "suicide",
    "take my life",
    "hurt myself",
    "want to die",
    "ending it all",
];

const HIGH_KEYWORDS: &[&str] = &[
    "cut",
    "self-harm",
    "jump",
    "overdose",
    "plan",
    "no reason",
    "can't go on",
    "die",
];

const CAUTION_KEYWORDS: &[&str] = &[
    "numb",
    "worthless",
    "hopeless",
    "empty",
    "lost",
    "alone",
    "tired",
    "fail",
    "failure",
    "break",
    "breaking",
    "drowning",
    "spiral",
    "panic",
    "overwhelmed",
    "burnout",
    "grief",
    "insomnia",
];

/// An externally registered secondary risk opinion.
///
/// Adapters are invoked in registration order with the raw text and the
/// local sentiment result. Returning `Ok(None)` means "no opinion"; an
/// `Err` is logged as a note on the assessment without escalating the tier.
pub trait RiskAdapter: Send + Sync {
    /// Short identifier used in escalation/failure notes.
    fn name(&self) -> &str;

    fn assess(
        &self,
        text: &str,
        sentiment: &SentimentResult,
    ) -> anyhow::Result<Option<RiskAssessment>>;
}

/// Derives a risk tier and score from lexicon rules, sentiment, recent
/// history, and registered adapters.
pub struct RiskClassifier {
    word_re: Regex,
    adapters: Vec<Box<dyn RiskAdapter>>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskClassifier {
    pub fn new() -> Self {
        Self {
            word_re: Regex::new(r"[a-zA-Z']+").expect("valid word pattern"),
            adapters: Vec::new(),
        }
    }

    /// Register an external risk adapter. Adapters run in registration order.
    pub fn add_adapter(&mut self, adapter: Box<dyn RiskAdapter>) {
        self.adapters.push(adapter);
    }

    /// Assess `text` given its sentiment and the tiers of recent messages
    /// (oldest first).
    pub fn assess(
        &self,
        text: &str,
        sentiment: &SentimentResult,
        recent_tiers: &[RiskTier],
    ) -> RiskAssessment {
        let lowered = text.to_lowercase();
        let mut flagged: Vec<String> = Vec::new();
        let mut notes: Vec<String> = Vec::new();

        let mut tier = RiskTier::Ok;
        let mut score = 0.0f64;

        let crisis_hits = find_phrases(&lowered, CRISIS_PHRASES);
        if !crisis_hits.is_empty() {
            flagged.extend(crisis_hits);
            tier = RiskTier::Crisis;
            score = 1.0;
            notes.push("Crisis phrase detected.".to_string());
        } else {
            let high_hits = self.find_keywords(&lowered, HIGH_KEYWORDS);
            let caution_hits = self.find_keywords(&lowered, CAUTION_KEYWORDS);

            if !high_hits.is_empty() {
                flagged.extend(high_hits);
                tier = RiskTier::High;
                score = score.max(0.75);
                notes.push("High-risk language detected.".to_string());
            }
            if !caution_hits.is_empty() {
                flagged.extend(caution_hits);
                if tier == RiskTier::Ok {
                    tier = RiskTier::Caution;
                    score = score.max(0.4);
                }
                notes.push("Cautionary language present.".to_string());
            }

            if tier == RiskTier::Ok {
                score = score.max((-sentiment.score).max(0.0));
            }

            if tier == RiskTier::Ok && sentiment.band == SentimentBand::Negative {
                tier = RiskTier::Caution;
                score = score.max(sentiment.score.abs().min(0.4));
                notes.push("Negative sentiment triggered caution tier.".to_string());
            }

            // History escalation off the last buffered tiers.
            if !recent_tiers.is_empty() {
                let last_two_high = recent_tiers
                    .iter()
                    .rev()
                    .take(2)
                    .filter(|t| **t == RiskTier::High)
                    .count()
                    == 2;
                if last_two_high && tier != RiskTier::Crisis {
                    tier = RiskTier::High;
                    score = score.max(0.8);
                    notes.push("Repeated high risk in recent history.".to_string());
                }
                let elevated = |t: RiskTier| matches!(t, RiskTier::Caution | RiskTier::High);
                if elevated(tier) && recent_tiers.last().is_some_and(|t| elevated(*t)) {
                    score = score.max(0.6);
                    notes.push("Risk trend escalating.".to_string());
                }
            }
        }

        let (tier, score, adapter_flagged, adapter_notes) =
            self.apply_adapters(text, sentiment, tier, score);
        flagged.extend(adapter_flagged);
        notes.extend(adapter_notes);

        let unique_flagged: BTreeSet<String> = flagged.into_iter().collect();
        RiskAssessment {
            tier,
            score: round3(score),
            flagged_keywords: unique_flagged.into_iter().collect(),
            notes,
        }
    }

    /// Map flagged keywords onto the fixed resource table, appending the
    /// default crisis hotline for high/crisis tiers when none matched.
    pub fn suggest_resources<'a, I>(&self, keywords: I, tier: RiskTier) -> Vec<ResourceDescriptor>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut suggestions: Vec<ResourceDescriptor> = keywords
            .into_iter()
            .filter_map(|keyword| resource_for(keyword))
            .collect();

        let needs_hotline = matches!(tier, RiskTier::High | RiskTier::Crisis)
            && !suggestions.iter().any(|r| r.kind == "hotline");
        if needs_hotline {
            suggestions.push(ResourceDescriptor::new(
                "hotline",
                "988 Suicide & Crisis Lifeline",
                "tel:988",
            ));
        }
        suggestions
    }

    fn find_keywords(&self, text: &str, keywords: &[&str]) -> Vec<String> {
        let token_set: HashSet<&str> = self.word_re.find_iter(text).map(|m| m.as_str()).collect();
        keywords
            .iter()
            .filter(|keyword| {
                if keyword.contains(' ') {
                    text.contains(*keyword)
                } else {
                    token_set.contains(*keyword)
                }
            })
            .map(|k| k.to_string())
            .collect()
    }

    fn apply_adapters(
        &self,
        text: &str,
        sentiment: &SentimentResult,
        current_tier: RiskTier,
        current_score: f64,
    ) -> (RiskTier, f64, Vec<String>, Vec<String>) {
        let mut tier = current_tier;
        let mut score = current_score;
        let mut flagged = Vec::new();
        let mut notes = Vec::new();

        for adapter in &self.adapters {
            let result = match adapter.assess(text, sentiment) {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(adapter = adapter.name(), error = %err, "risk adapter failed");
                    notes.push(format!("Adapter '{}' failed: {}", adapter.name(), err));
                    continue;
                }
            };

            flagged.extend(result.flagged_keywords);
            if result.tier.severity() > tier.severity() {
                tier = result.tier;
                notes.push(format!(
                    "Adapter '{}' escalated tier to {}.",
                    adapter.name(),
                    result.tier
                ));
            }
            score = score.max(result.score);
            notes.extend(result.notes);
        }

        (tier, score, flagged, notes)
    }
}

fn find_phrases(text: &str, phrases: &[&str]) -> Vec<String> {
    phrases
        .iter()
        .filter(|phrase| text.contains(*phrase))
        .map(|p| p.to_string())
        .collect()
}

/// Fixed keyword-to-resource table.
fn resource_for(keyword: &str) -> Option<ResourceDescriptor> {
    let resource = match keyword {
        "suicide" => ResourceDescriptor::new("hotline", "988 Suicide & Crisis Lifeline", "tel:988"),
        "hurt myself" => ResourceDescriptor::new("hotline", "Crisis Text Line", "sms:741741"),
        "hopeless" => ResourceDescriptor::new(
            "article",
            "Grounding exercise: 5-4-3-2-1 method",
            "https://www.healthline.com/health/grounding-techniques",
        ),
        "lonely" => ResourceDescriptor::new(
            "resource",
            "Mental Health America peer support",
            "https://mhanational.org/peers",
        ),
        "anxious" => ResourceDescriptor::new(
            "exercise",
            "Box breathing technique",
            "https://www.va.gov/WHOLEHEALTHLIBRARY/tools/box-breathing.asp",
        ),
        "panic" => ResourceDescriptor::new(
            "exercise",
            "Panic attack grounding steps",
            "https://www.verywellmind.com/stop-a-panic-attack-2584406",
        ),
        "overwhelmed" => ResourceDescriptor::new(
            "article",
            "Guided journaling prompts for overwhelm",
            "https://www.therapistaid.com/worksheets/coping-skills-anxiety.pdf",
        ),
        "self-harm" => ResourceDescriptor::new(
            "hotline",
            "Self-Injury Outreach & Support",
            "https://sioutreach.org/dont-hurt-yourself/",
        ),
        "grief" => ResourceDescriptor::new(
            "resource",
            "Grief Share support groups",
            "https://www.griefshare.org/findagroup",
        ),
        "insomnia" => ResourceDescriptor::new(
            "exercise",
            "Sleep hygiene checklist",
            "https://www.sleepfoundation.org/sleep-hygiene",
        ),
        "burnout" => ResourceDescriptor::new(
            "article",
            "Burnout recovery micro-breaks",
            "https://www.apa.org/topics/burnout/recover",
        ),
        _ => return None,
    };
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::SentimentAnalyzer;

    fn assess(text: &str) -> RiskAssessment {
        let analyzer = SentimentAnalyzer::new();
        let classifier = RiskClassifier::new();
        let sentiment = analyzer.score(text);
        classifier.assess(text, &sentiment, &[])
    }

    #[test]
    fn test_crisis_phrase_short_circuits() {
        let result = assess("I want to kill myself tonight.");
        assert_eq!(result.tier, RiskTier::Crisis);
        assert_eq!(result.score, 1.0);
        assert!(result
            .flagged_keywords
            .contains(&"kill myself".to_string()));
    }

    #[test]
    fn test_crisis_regardless_of_sentiment() {
        // Positive words do not soften a crisis phrase.
        let result = assess("I feel calm and grateful but I still want to die.");
        assert_eq!(result.tier, RiskTier::Crisis);
        assert_eq!(result.score, 1.0);
    }

    #[test]
    fn test_high_keyword() {
        let result = assess("I keep thinking about an overdose.");
        assert_eq!(result.tier, RiskTier::High);
        assert!(result.score >= 0.75);
        assert!(result.flagged_keywords.contains(&"overdose".to_string()));
    }

    #[test]
    fn test_caution_keyword() {
        let result = assess("Everything feels overwhelmed lately.");
        assert_eq!(result.tier, RiskTier::Caution);
        assert!(result.score >= 0.4);
    }

    #[test]
    fn test_high_and_caution_keywords_accumulate() {
        let result = assess("I feel so alone, like I can't go on.");
        assert_eq!(result.tier, RiskTier::High);
        assert!(result.flagged_keywords.contains(&"alone".to_string()));
        assert!(result
            .flagged_keywords
            .contains(&"can't go on".to_string()));
    }

    #[test]
    fn test_negative_sentiment_forces_caution() {
        // "ashamed" is a sentiment word but not a risk keyword.
        let result = assess("I feel ashamed.");
        assert_eq!(result.tier, RiskTier::Caution);
        // Sentiment fallback already raised the score to |-1.0| before the
        // caution bump, so the bump's 0.4 floor does not lower it.
        assert_eq!(result.score, 1.0);
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("Negative sentiment")));
    }

    #[test]
    fn test_two_recent_highs_escalate() {
        let analyzer = SentimentAnalyzer::new();
        let classifier = RiskClassifier::new();
        let text = "Nothing special happened today.";
        let sentiment = analyzer.score(text);
        let result = classifier.assess(
            text,
            &sentiment,
            &[RiskTier::Ok, RiskTier::High, RiskTier::High],
        );
        assert_eq!(result.tier, RiskTier::High);
        assert!(result.score >= 0.8);
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("Repeated high risk")));
    }

    #[test]
    fn test_trend_bump_keeps_tier() {
        let analyzer = SentimentAnalyzer::new();
        let classifier = RiskClassifier::new();
        let text = "Still drowning in all of this.";
        let sentiment = analyzer.score(text);
        let result = classifier.assess(text, &sentiment, &[RiskTier::Caution]);
        assert_eq!(result.tier, RiskTier::Caution);
        assert!(result.score >= 0.6);
        assert!(result.notes.iter().any(|n| n.contains("escalating")));
    }

    struct CodeRedAdapter;

    impl RiskAdapter for CodeRedAdapter {
        fn name(&self) -> &str {
            "code-red"
        }

        fn assess(
            &self,
            text: &str,
            _sentiment: &SentimentResult,
        ) -> anyhow::Result<Option<RiskAssessment>> {
            if text.to_lowercase().contains("code red") {
                Ok(Some(RiskAssessment {
                    tier: RiskTier::High,
                    score: 0.9,
                    flagged_keywords: vec!["code red".to_string()],
                    notes: Vec::new(),
                }))
            } else {
                Ok(None)
            }
        }
    }

    struct FailingAdapter;

    impl RiskAdapter for FailingAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        fn assess(
            &self,
            _text: &str,
            _sentiment: &SentimentResult,
        ) -> anyhow::Result<Option<RiskAssessment>> {
            anyhow::bail!("backend offline")
        }
    }

    #[test]
    fn test_adapter_escalation_merges() {
        let analyzer = SentimentAnalyzer::new();
        let mut classifier = RiskClassifier::new();
        classifier.add_adapter(Box::new(CodeRedAdapter));

        let text = "This is a code red situation.";
        let sentiment = analyzer.score(text);
        let result = classifier.assess(text, &sentiment, &[]);

        assert_eq!(result.tier, RiskTier::High);
        assert!(result.score >= 0.9);
        assert!(result.flagged_keywords.contains(&"code red".to_string()));
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("'code-red' escalated tier to high")));
    }

    #[test]
    fn test_adapter_failure_is_note_not_error() {
        let analyzer = SentimentAnalyzer::new();
        let mut classifier = RiskClassifier::new();
        classifier.add_adapter(Box::new(FailingAdapter));

        let text = "Just checking in.";
        let sentiment = analyzer.score(text);
        let result = classifier.assess(text, &sentiment, &[]);

        assert_eq!(result.tier, RiskTier::Ok);
        assert!(result
            .notes
            .iter()
            .any(|n| n.contains("Adapter 'flaky' failed")));
    }

    #[test]
    fn test_flagged_keywords_sorted_and_deduped() {
        let result = assess("tired tired and alone, so tired");
        assert_eq!(
            result.flagged_keywords,
            vec!["alone".to_string(), "tired".to_string()]
        );
    }

    #[test]
    fn test_suggest_resources_hotline_fallback() {
        let classifier = RiskClassifier::new();
        let keywords = vec!["hopeless".to_string()];
        let resources = classifier.suggest_resources(keywords.iter(), RiskTier::High);
        assert!(resources.iter().any(|r| r.kind == "article"));
        assert!(resources.iter().any(|r| r.kind == "hotline"));

        // No hotline appended at caution tier.
        let resources = classifier.suggest_resources(keywords.iter(), RiskTier::Caution);
        assert!(!resources.iter().any(|r| r.kind == "hotline"));
    }

    #[test]
    fn test_suggest_resources_no_duplicate_hotline() {
        let classifier = RiskClassifier::new();
        let keywords = vec!["suicide".to_string()];
        let resources = classifier.suggest_resources(keywords.iter(), RiskTier::Crisis);
        assert_eq!(resources.iter().filter(|r| r.kind == "hotline").count(), 1);
    }
}
