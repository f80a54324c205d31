//! Core data model for sessions, messages, and risk assessments
//!
//! These types map one-to-one onto the stored rows (see `storage`) and the
//! JSON bodies served by the HTTP API. All enums use lowercase wire forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Return a timezone-aware UTC timestamp.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Round to three decimals, the precision used for all stored scores.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Ordinal risk level. Severity order: ok < caution < high < crisis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Ok,
    Caution,
    High,
    Crisis,
}

impl RiskTier {
    /// Numeric severity used for max-merges and history escalation.
    pub fn severity(self) -> u8 {
        match self {
            RiskTier::Ok => 0,
            RiskTier::Caution => 1,
            RiskTier::High => 2,
            RiskTier::Crisis => 3,
        }
    }

    /// All tiers in ascending severity order.
    pub fn all() -> [RiskTier; 4] {
        [
            RiskTier::Ok,
            RiskTier::Caution,
            RiskTier::High,
            RiskTier::Crisis,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Ok => "ok",
            RiskTier::Caution => "caution",
            RiskTier::High => "high",
            RiskTier::Crisis => "crisis",
        }
    }

    /// Parse the lowercase wire form. Unknown values map to `Ok` so that a
    /// malformed external risk payload degrades instead of failing the turn.
    pub fn parse_lenient(value: &str) -> RiskTier {
        match value.to_ascii_lowercase().as_str() {
            "caution" => RiskTier::Caution,
            "high" => RiskTier::High,
            "crisis" => RiskTier::Crisis,
            _ => RiskTier::Ok,
        }
    }

    /// The more severe of the two tiers.
    pub fn max_severity(self, other: RiskTier) -> RiskTier {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for RiskTier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RiskTier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentiment valence band derived from the normalized lexicon score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentBand {
    Positive,
    Neutral,
    Negative,
}

impl SentimentBand {
    pub fn all() -> [SentimentBand; 3] {
        [
            SentimentBand::Positive,
            SentimentBand::Neutral,
            SentimentBand::Negative,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SentimentBand::Positive => "positive",
            SentimentBand::Neutral => "neutral",
            SentimentBand::Negative => "negative",
        }
    }

    /// Band thresholds: > 0.1 positive, < -0.1 negative, else neutral.
    pub fn from_score(score: f64) -> SentimentBand {
        if score > 0.1 {
            SentimentBand::Positive
        } else if score < -0.1 {
            SentimentBand::Negative
        } else {
            SentimentBand::Neutral
        }
    }
}

impl fmt::Display for SentimentBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle state. `active -> ended` is the only transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<SessionStatus> {
        match value {
            "active" => Some(SessionStatus::Active),
            "ended" => Some(SessionStatus::Ended),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Assistant,
    System,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::User => "user",
            SenderRole::Assistant => "assistant",
            SenderRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<SenderRole> {
        match value {
            "user" => Some(SenderRole::User),
            "assistant" => Some(SenderRole::Assistant),
            "system" => Some(SenderRole::System),
            _ => None,
        }
    }
}

impl fmt::Display for SenderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked conversational session. Never physically deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tier of the most recently assessed message. Intentionally distinct
    /// from `SessionMetrics::max_risk_tier`; reconciled only at session end.
    pub active_risk_tier: RiskTier,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One message in the append-only log. Immutable once inserted; ordering is
/// defined by the store-assigned `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Option<i64>,
    pub session_id: String,
    pub sender: SenderRole,
    pub content: String,
    pub sentiment_score: f64,
    pub risk_tier: RiskTier,
    pub risk_score: f64,
    pub flagged_keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Transient sentiment score for a single text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentResult {
    pub score: f64,
    pub band: SentimentBand,
    pub tokens: Vec<String>,
}

/// Risk evaluation for a single message, also embedded in the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub score: f64,
    pub flagged_keywords: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// A support resource suggested from flagged keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub link: String,
}

impl ResourceDescriptor {
    pub fn new(kind: &str, label: &str, link: &str) -> Self {
        Self {
            kind: kind.to_string(),
            label: label.to_string(),
            link: link.to_string(),
        }
    }
}

/// Aggregate metrics recomputed from the full message log on each mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub message_count: usize,
    pub user_turns: usize,
    pub assistant_turns: usize,
    pub avg_sentiment: f64,
    /// Running maximum tier ever observed; monotonic for a session's life
    /// because the message log is append-only.
    pub max_risk_tier: RiskTier,
    pub tier_counts: HashMap<String, usize>,
    pub band_counts: HashMap<String, usize>,
    pub trend_notes: Vec<String>,
    pub suggested_resources: Vec<ResourceDescriptor>,
}

impl SessionMetrics {
    /// Empty metrics for a session with no messages yet.
    pub fn empty(session_id: &str) -> Self {
        let tier_counts = RiskTier::all()
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        let band_counts = SentimentBand::all()
            .iter()
            .map(|b| (b.as_str().to_string(), 0))
            .collect();
        Self {
            session_id: session_id.to_string(),
            message_count: 0,
            user_turns: 0,
            assistant_turns: 0,
            avg_sentiment: 0.0,
            max_risk_tier: RiskTier::Ok,
            tier_counts,
            band_counts,
            trend_notes: Vec::new(),
            suggested_resources: Vec::new(),
        }
    }
}

/// Rolling cache of the most recent `capacity` messages, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub session_id: String,
    pub messages: Vec<MessageRecord>,
    pub capacity: usize,
}

/// Read-only composite view of a session, valid in either lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: SessionRecord,
    pub metrics: SessionMetrics,
    pub duration_seconds: i64,
    pub flagged_keywords: Vec<String>,
    pub notes: Vec<String>,
}
