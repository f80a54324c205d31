//! Session lifecycle orchestration
//!
//! The tracker owns the analyzers, the guardrail engine, the storage handle,
//! and the optional external reply pipeline. Every public operation loads
//! what it needs, writes through storage, and refreshes the per-session
//! buffer and metrics caches before returning. Caches are last-writer-wins;
//! the append-only message log is the source of truth.

use crate::analysis::{RiskAdapter, RiskClassifier, SentimentAnalyzer};
use crate::guardrail::{GuardrailAction, GuardrailEngine, GuardrailRequest};
use crate::models::{
    round3, utc_now, BufferSnapshot, MessageRecord, RiskAssessment, RiskTier, SenderRole,
    SentimentBand, SentimentResult, SessionMetrics, SessionRecord, SessionStatus, SessionSummary,
};
use crate::pipeline::{PipelineRisk, ReplyPipeline, TurnOutcome, TurnRequest};
use crate::storage::SessionStorage;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

/// Failures surfaced to callers of tracker operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session '{0}' not found.")]
    NotFound(String),

    #[error("Session '{0}' is not active.")]
    Closed(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Tracker behavior knobs, normally filled from the config layer.
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub buffer_size: usize,
    pub rag_enabled: bool,
    pub rag_auto_reply: bool,
    pub rag_country_code: String,
    pub rag_model: String,
    pub rag_k: usize,
    pub rag_guardrails: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            buffer_size: 20,
            rag_enabled: false,
            rag_auto_reply: true,
            rag_country_code: "US".to_string(),
            rag_model: "default".to_string(),
            rag_k: 2,
            rag_guardrails: true,
        }
    }
}

/// Everything produced by one `append_message` call.
#[derive(Debug, Clone, Serialize)]
pub struct MessageAppendResult {
    pub message: MessageRecord,
    pub risk: RiskAssessment,
    pub buffer: BufferSnapshot,
    pub metrics: SessionMetrics,
    pub assistant_message: Option<MessageRecord>,
    pub pipeline: Option<TurnOutcome>,
}

/// Core orchestration layer for session tracking and analytics.
pub struct SessionTracker {
    storage: SessionStorage,
    options: TrackerOptions,
    sentiment_analyzer: SentimentAnalyzer,
    risk_classifier: RiskClassifier,
    guardrails: GuardrailEngine,
    reply_pipeline: Option<Box<dyn ReplyPipeline>>,
}

impl SessionTracker {
    pub fn new(storage: SessionStorage, options: TrackerOptions) -> Self {
        Self {
            storage,
            options,
            sentiment_analyzer: SentimentAnalyzer::new(),
            risk_classifier: RiskClassifier::new(),
            guardrails: GuardrailEngine::new(),
            reply_pipeline: None,
        }
    }

    /// Attach the external reply pipeline. Call before the tracker is shared.
    pub fn set_pipeline(&mut self, pipeline: Box<dyn ReplyPipeline>) {
        self.reply_pipeline = Some(pipeline);
    }

    /// Register an external risk adapter. Call before the tracker is shared.
    pub fn register_adapter(&mut self, adapter: Box<dyn RiskAdapter>) {
        self.risk_classifier.add_adapter(adapter);
    }

    // Session lifecycle ------------------------------------------------------

    pub fn create_session(
        &self,
        user_id: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<SessionRecord, SessionError> {
        if user_id.trim().is_empty() {
            return Err(SessionError::InvalidInput(
                "user_id must not be empty.".to_string(),
            ));
        }
        let session = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            status: SessionStatus::Active,
            created_at: utc_now(),
            updated_at: utc_now(),
            active_risk_tier: RiskTier::Ok,
            metadata,
        };
        self.storage.create_session(&session)?;
        self.storage.save_buffer(&BufferSnapshot {
            session_id: session.id.clone(),
            messages: Vec::new(),
            capacity: self.options.buffer_size,
        })?;
        debug!(session_id = %session.id, user_id, "session created");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        self.storage
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn list_sessions(
        &self,
        user_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.storage.list_sessions(user_id, status)?)
    }

    /// End a session. Idempotent: ending an ended session returns its
    /// summary unchanged. On the active-to-ended transition the session's
    /// active tier is reconciled to the running maximum.
    pub fn end_session(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        let session = self.get_session(session_id)?;
        if session.status == SessionStatus::Ended {
            return self.get_summary(session_id);
        }

        let (metrics, flagged) = self.recalculate_metrics(session_id)?;
        self.storage.update_session(
            session_id,
            Some(SessionStatus::Ended),
            Some(metrics.max_risk_tier),
            None,
        )?;
        let session = self.get_session(session_id)?;
        debug!(session_id, max_risk = %metrics.max_risk_tier, "session ended");
        Ok(build_summary(session, metrics, flagged))
    }

    // Message handling -------------------------------------------------------

    pub fn append_message(
        &self,
        session_id: &str,
        sender: SenderRole,
        content: &str,
        use_rag: Option<bool>,
        auto_reply: Option<bool>,
    ) -> Result<MessageAppendResult, SessionError> {
        let session = self.get_session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::Closed(session_id.to_string()));
        }
        if content.trim().is_empty() {
            return Err(SessionError::InvalidInput(
                "content must not be empty.".to_string(),
            ));
        }

        let rag_requested = use_rag.unwrap_or(self.options.rag_enabled);
        let auto_respond = auto_reply.unwrap_or(self.options.rag_auto_reply);

        let sentiment = self.sentiment_analyzer.score(content);
        let recent = self
            .storage
            .recent_messages(session_id, self.options.buffer_size)?;
        let recent_tiers: Vec<RiskTier> = recent.iter().map(|m| m.risk_tier).collect();
        let mut assessment = self
            .risk_classifier
            .assess(content, &sentiment, &recent_tiers);

        let mut outcome: Option<TurnOutcome> = None;
        if rag_requested && sender == SenderRole::User {
            let turn = self.run_pipeline_turn(session_id, content)?;
            if let Some(mapped) = map_pipeline_risk(turn.risk.as_ref(), &sentiment) {
                assessment = merge_assessments(assessment, mapped);
            } else if let Some(error) = &turn.error {
                assessment.notes.push(format!("RAG unavailable: {}", error));
            }
            outcome = Some(turn);
        }

        if let Some(turn) = outcome.as_mut() {
            let prev_reply = recent
                .iter()
                .rev()
                .find(|m| m.sender == SenderRole::Assistant)
                .map(|m| m.content.clone());
            self.apply_guardrails(turn, content, &mut assessment, prev_reply.as_deref());
        }

        let message = MessageRecord {
            id: None,
            session_id: session_id.to_string(),
            sender,
            content: content.to_string(),
            sentiment_score: sentiment.score,
            risk_tier: assessment.tier,
            risk_score: assessment.score,
            flagged_keywords: assessment.flagged_keywords.clone(),
            created_at: utc_now(),
        };
        let saved = self.storage.insert_message(&message)?;
        self.storage
            .update_session(session_id, None, Some(assessment.tier), None)?;
        let mut buffer = self.update_buffer(session_id)?;
        let (mut metrics, _) = self.recalculate_metrics(session_id)?;

        let mut assistant_message = None;
        let reply = outcome.as_ref().map(|o| o.reply.clone()).unwrap_or_default();
        if !reply.is_empty() && auto_respond && sender == SenderRole::User {
            assistant_message = Some(self.append_assistant_reply(session_id, &reply)?);
            buffer = self.update_buffer(session_id)?;
            metrics = self.recalculate_metrics(session_id)?.0;
        }

        Ok(MessageAppendResult {
            message: saved,
            risk: assessment,
            buffer,
            metrics,
            assistant_message,
            pipeline: if rag_requested { outcome } else { None },
        })
    }

    pub fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, SessionError> {
        self.get_session(session_id)?;
        Ok(self.storage.list_messages(session_id)?)
    }

    /// Load the cached buffer, rebuilding it from recent messages if the
    /// cache row is missing.
    pub fn get_buffer(&self, session_id: &str) -> Result<BufferSnapshot, SessionError> {
        if let Some(buffer) = self.storage.load_buffer(session_id)? {
            return Ok(buffer);
        }
        self.get_session(session_id)?;
        self.update_buffer(session_id)
    }

    /// Load the cached metrics, recomputing them if the cache row is missing.
    pub fn get_metrics(&self, session_id: &str) -> Result<SessionMetrics, SessionError> {
        self.get_session(session_id)?;
        match self.storage.get_metrics(session_id)? {
            Some(metrics) => Ok(metrics),
            None => Ok(self.recalculate_metrics(session_id)?.0),
        }
    }

    pub fn get_summary(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        let session = self.get_session(session_id)?;
        let (metrics, flagged) = match self.storage.get_metrics(session_id)? {
            Some(metrics) => (metrics, self.collect_flagged_keywords(session_id)?),
            None => self.recalculate_metrics(session_id)?,
        };
        Ok(build_summary(session, metrics, flagged))
    }

    // Pipeline integration ---------------------------------------------------

    fn run_pipeline_turn(
        &self,
        session_id: &str,
        content: &str,
    ) -> Result<TurnOutcome, SessionError> {
        let Some(pipeline) = self.reply_pipeline.as_ref() else {
            return Ok(TurnOutcome {
                error: Some("reply pipeline not configured".to_string()),
                ..TurnOutcome::default()
            });
        };
        let request = TurnRequest {
            user_text: content.to_string(),
            history_summary: self.build_history_summary(session_id)?,
            transcript_block: self.build_transcript_block(session_id, 5)?,
            country_code: self.options.rag_country_code.clone(),
            k: self.options.rag_k,
            model: self.options.rag_model.clone(),
            session_id: session_id.to_string(),
            use_guardrails: self.options.rag_guardrails,
        };
        match pipeline.run_turn(&request) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(session_id, %error, "reply pipeline failed");
                Ok(TurnOutcome {
                    error: Some(error.to_string()),
                    ..TurnOutcome::default()
                })
            }
        }
    }

    /// Enforce locally on the raw reply when enabled; otherwise keep the
    /// pipeline's own reply and record a bypass.
    fn apply_guardrails(
        &self,
        turn: &mut TurnOutcome,
        user_text: &str,
        assessment: &mut RiskAssessment,
        prev_reply: Option<&str>,
    ) {
        if turn.reply.is_empty() && turn.reply_raw.is_empty() {
            return;
        }

        if self.options.rag_guardrails {
            let candidate = if turn.reply_raw.is_empty() {
                turn.reply.clone()
            } else {
                turn.reply_raw.clone()
            };
            let emotion = turn.risk.as_ref().map(|r| r.emotion.clone()).unwrap_or_default();
            let result = self.guardrails.enforce(&GuardrailRequest {
                user_text,
                candidate_reply: &candidate,
                tier: assessment.tier,
                emotion_hint: if emotion.is_empty() { None } else { Some(&emotion) },
                country_code: Some(&self.options.rag_country_code),
                prev_reply,
            });
            assessment
                .notes
                .push(format!("Guardrail action: {}", result.action.as_str()));
            assessment.notes.push(result.notes.clone());
            turn.reply = result.final_text;
            turn.guardrail_action = Some(result.action.as_str().to_string());
            turn.guardrail_notes = Some(result.flags.join("; "));
        } else {
            let action = turn
                .guardrail_action
                .clone()
                .unwrap_or_else(|| GuardrailAction::Bypass.as_str().to_string());
            assessment.notes.push(format!("Guardrail action: {}", action));
            if let Some(notes) = &turn.guardrail_notes {
                if !notes.is_empty() {
                    assessment.notes.push(notes.clone());
                }
            }
            turn.guardrail_action = Some(action);
        }
    }

    fn build_history_summary(&self, session_id: &str) -> Result<String, SessionError> {
        let Some(metrics) = self.storage.get_metrics(session_id)? else {
            return Ok(String::new());
        };
        let mut parts = vec![
            format!("messages={}", metrics.message_count),
            format!("max_risk={}", metrics.max_risk_tier),
        ];
        if !metrics.trend_notes.is_empty() {
            parts.push(format!("notes={}", metrics.trend_notes.join("; ")));
        }
        Ok(parts.join(" | "))
    }

    fn build_transcript_block(
        &self,
        session_id: &str,
        max_pairs: usize,
    ) -> Result<String, SessionError> {
        let recent = self.storage.recent_messages(session_id, max_pairs * 2)?;
        let lines: Vec<String> = recent
            .iter()
            .map(|m| {
                let prefix = match m.sender {
                    SenderRole::User => "User",
                    SenderRole::Assistant => "Therapist",
                    SenderRole::System => "System",
                };
                format!("{}: {}", prefix, m.content)
            })
            .collect();
        Ok(lines.join("\n"))
    }

    fn append_assistant_reply(
        &self,
        session_id: &str,
        reply: &str,
    ) -> Result<MessageRecord, SessionError> {
        let sentiment = self.sentiment_analyzer.score(reply);
        let recent = self
            .storage
            .recent_messages(session_id, self.options.buffer_size)?;
        let recent_tiers: Vec<RiskTier> = recent.iter().map(|m| m.risk_tier).collect();
        let assessment = self.risk_classifier.assess(reply, &sentiment, &recent_tiers);
        let message = MessageRecord {
            id: None,
            session_id: session_id.to_string(),
            sender: SenderRole::Assistant,
            content: reply.to_string(),
            sentiment_score: sentiment.score,
            risk_tier: assessment.tier,
            risk_score: assessment.score,
            flagged_keywords: assessment.flagged_keywords,
            created_at: utc_now(),
        };
        let saved = self.storage.insert_message(&message)?;
        // Bump updated_at without touching the session's active tier.
        self.storage.update_session(session_id, None, None, None)?;
        Ok(saved)
    }

    // Internal helpers -------------------------------------------------------

    fn update_buffer(&self, session_id: &str) -> Result<BufferSnapshot, SessionError> {
        let recent = self
            .storage
            .recent_messages(session_id, self.options.buffer_size)?;
        let snapshot = BufferSnapshot {
            session_id: session_id.to_string(),
            messages: recent,
            capacity: self.options.buffer_size,
        };
        self.storage.save_buffer(&snapshot)?;
        Ok(snapshot)
    }

    fn collect_flagged_keywords(&self, session_id: &str) -> Result<Vec<String>, SessionError> {
        let messages = self.storage.list_messages(session_id)?;
        let keywords: BTreeSet<String> = messages
            .into_iter()
            .flat_map(|m| m.flagged_keywords)
            .collect();
        Ok(keywords.into_iter().collect())
    }

    /// Pure fold over the full message log, persisted as the metrics cache.
    /// Returns the metrics plus the sorted union of flagged keywords.
    fn recalculate_metrics(
        &self,
        session_id: &str,
    ) -> Result<(SessionMetrics, Vec<String>), SessionError> {
        let messages = self.storage.list_messages(session_id)?;
        let message_count = messages.len();
        let user_turns = messages.iter().filter(|m| m.sender == SenderRole::User).count();
        let assistant_turns = messages
            .iter()
            .filter(|m| m.sender == SenderRole::Assistant)
            .count();
        let avg_sentiment = if message_count > 0 {
            round3(messages.iter().map(|m| m.sentiment_score).sum::<f64>() / message_count as f64)
        } else {
            0.0
        };

        let mut tier_counts: HashMap<String, usize> = RiskTier::all()
            .iter()
            .map(|t| (t.as_str().to_string(), 0))
            .collect();
        let mut band_counts: HashMap<String, usize> = SentimentBand::all()
            .iter()
            .map(|b| (b.as_str().to_string(), 0))
            .collect();
        let mut flagged: BTreeSet<String> = BTreeSet::new();
        let mut tier_sequence: Vec<RiskTier> = Vec::with_capacity(message_count);

        for message in &messages {
            *tier_counts
                .entry(message.risk_tier.as_str().to_string())
                .or_default() += 1;
            let band = SentimentBand::from_score(message.sentiment_score);
            *band_counts.entry(band.as_str().to_string()).or_default() += 1;
            flagged.extend(message.flagged_keywords.iter().cloned());
            tier_sequence.push(message.risk_tier);
        }

        let max_risk_tier = tier_sequence
            .iter()
            .copied()
            .fold(RiskTier::Ok, RiskTier::max_severity);

        let mut trend_notes: Vec<String> = Vec::new();
        if !tier_sequence.is_empty() {
            let tail_start = tier_sequence.len().saturating_sub(3);
            if tier_sequence[tail_start..]
                .iter()
                .all(|t| *t >= RiskTier::Caution)
            {
                trend_notes.push("Sustained elevated risk across last three turns.".to_string());
            }
            if tier_sequence.len() >= 2
                && tier_sequence[tier_sequence.len() - 1] > tier_sequence[tier_sequence.len() - 2]
            {
                trend_notes.push("Risk climbing on most recent turn.".to_string());
            }
            if avg_sentiment < -0.3 {
                trend_notes.push("Overall negative sentiment.".to_string());
            }
        }

        let suggested_resources = self
            .risk_classifier
            .suggest_resources(flagged.iter(), max_risk_tier);

        let metrics = SessionMetrics {
            session_id: session_id.to_string(),
            message_count,
            user_turns,
            assistant_turns,
            avg_sentiment,
            max_risk_tier,
            tier_counts,
            band_counts,
            trend_notes,
            suggested_resources,
        };
        self.storage.upsert_metrics(&metrics)?;
        Ok((metrics, flagged.into_iter().collect()))
    }
}

fn build_summary(
    session: SessionRecord,
    metrics: SessionMetrics,
    flagged_keywords: Vec<String>,
) -> SessionSummary {
    let duration_seconds = (session.updated_at - session.created_at)
        .num_seconds()
        .max(0);
    let mut notes = metrics.trend_notes.clone();
    if session.status == SessionStatus::Ended {
        notes.push("Session marked as ended.".to_string());
    }
    SessionSummary {
        session,
        metrics,
        duration_seconds,
        flagged_keywords,
        notes,
    }
}

/// Map an external risk estimate into a local assessment. Unknown tiers
/// degrade to `ok`; a missing score falls back to the local sentiment
/// signal; dimension names become flagged keywords.
fn map_pipeline_risk(
    risk: Option<&PipelineRisk>,
    sentiment: &SentimentResult,
) -> Option<RiskAssessment> {
    let risk = risk?;
    let tier = RiskTier::parse_lenient(&risk.tier);
    let score = risk.score.unwrap_or_else(|| (-sentiment.score).max(0.0));
    let flagged: BTreeSet<String> = risk.dimensions.keys().cloned().collect();
    let mut notes = Vec::new();
    if !risk.emotion.is_empty() {
        notes.push(format!("Emotion: {}", risk.emotion));
    }
    if let Some(confidence) = risk.confidence {
        notes.push(format!("Confidence: {}", confidence));
    }
    Some(RiskAssessment {
        tier,
        score: round3(score),
        flagged_keywords: flagged.into_iter().collect(),
        notes,
    })
}

/// Max-severity merge of the local and external assessments.
fn merge_assessments(primary: RiskAssessment, secondary: RiskAssessment) -> RiskAssessment {
    let tier = primary.tier.max_severity(secondary.tier);
    let score = round3(primary.score.max(secondary.score));
    let flagged: BTreeSet<String> = primary
        .flagged_keywords
        .into_iter()
        .chain(secondary.flagged_keywords)
        .collect();
    let mut notes = primary.notes;
    for note in secondary.notes {
        if !notes.contains(&note) {
            notes.push(note);
        }
    }
    RiskAssessment {
        tier,
        score,
        flagged_keywords: flagged.into_iter().collect(),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    fn tracker() -> SessionTracker {
        let storage = SessionStorage::in_memory().unwrap();
        SessionTracker::new(storage, TrackerOptions::default())
    }

    fn tracker_with(options: TrackerOptions) -> SessionTracker {
        let storage = SessionStorage::in_memory().unwrap();
        SessionTracker::new(storage, options)
    }

    struct FixedPipeline {
        outcome: TurnOutcome,
        last_request: Mutex<Option<TurnRequest>>,
    }

    impl FixedPipeline {
        fn new(outcome: TurnOutcome) -> Self {
            Self {
                outcome,
                last_request: Mutex::new(None),
            }
        }
    }

    impl ReplyPipeline for FixedPipeline {
        fn run_turn(&self, request: &TurnRequest) -> anyhow::Result<TurnOutcome> {
            *self.last_request.lock().unwrap() = Some(request.clone());
            Ok(self.outcome.clone())
        }
    }

    impl ReplyPipeline for std::sync::Arc<FixedPipeline> {
        fn run_turn(&self, request: &TurnRequest) -> anyhow::Result<TurnOutcome> {
            self.as_ref().run_turn(request)
        }
    }

    struct FailingPipeline;

    impl ReplyPipeline for FailingPipeline {
        fn run_turn(&self, _request: &TurnRequest) -> anyhow::Result<TurnOutcome> {
            Err(anyhow!("connection refused"))
        }
    }

    #[test]
    fn test_create_session_initializes_empty_buffer() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.active_risk_tier, RiskTier::Ok);

        let buffer = t.get_buffer(&session.id).unwrap();
        assert!(buffer.messages.is_empty());
        assert_eq!(buffer.capacity, 20);
    }

    #[test]
    fn test_create_session_rejects_empty_user() {
        let t = tracker();
        let err = t.create_session("  ", HashMap::new()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
    }

    #[test]
    fn test_append_to_missing_session_is_not_found() {
        let t = tracker();
        let err = t
            .append_message("nope", SenderRole::User, "hi", None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn test_append_rejects_empty_content() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        let err = t
            .append_message(&session.id, SenderRole::User, "   ", None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));
    }

    #[test]
    fn test_append_to_ended_session_is_closed() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        t.end_session(&session.id).unwrap();
        let err = t
            .append_message(&session.id, SenderRole::User, "hi", None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed(_)));
    }

    #[test]
    fn test_end_session_is_idempotent() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        t.append_message(&session.id, SenderRole::User, "I feel hopeless", None, None)
            .unwrap();

        let first = t.end_session(&session.id).unwrap();
        let second = t.end_session(&session.id).unwrap();
        assert_eq!(first.session.status, SessionStatus::Ended);
        assert_eq!(second.session.status, SessionStatus::Ended);
        assert_eq!(first.metrics.message_count, second.metrics.message_count);
        assert!(first.notes.contains(&"Session marked as ended.".to_string()));
    }

    #[test]
    fn test_buffer_capacity_bounds_cache_but_not_log() {
        let mut options = TrackerOptions::default();
        options.buffer_size = 3;
        let t = tracker_with(options);
        let session = t.create_session("alice", HashMap::new()).unwrap();

        let mut last = None;
        for i in 0..5 {
            last = Some(
                t.append_message(
                    &session.id,
                    SenderRole::User,
                    &format!("I feel stressed about day {}", i),
                    None,
                    None,
                )
                .unwrap(),
            );
        }
        let result = last.unwrap();
        assert_eq!(result.buffer.messages.len(), 3);
        assert_eq!(result.metrics.message_count, 5);
        assert_eq!(t.get_messages(&session.id).unwrap().len(), 5);
        // Buffer holds the newest messages, oldest first.
        assert!(result.buffer.messages[0].content.contains("day 2"));
        assert!(result.buffer.messages[2].content.contains("day 4"));
    }

    #[test]
    fn test_max_tier_is_monotonic_while_active_tier_tracks_latest() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();

        let crisis = t
            .append_message(
                &session.id,
                SenderRole::User,
                "I keep thinking about ending it all",
                None,
                None,
            )
            .unwrap();
        assert_eq!(crisis.risk.tier, RiskTier::Crisis);
        assert_eq!(crisis.metrics.max_risk_tier, RiskTier::Crisis);

        let calm = t
            .append_message(&session.id, SenderRole::User, "I feel calm now", None, None)
            .unwrap();
        assert_eq!(calm.metrics.max_risk_tier, RiskTier::Crisis);

        let record = t.get_session(&session.id).unwrap();
        assert_eq!(record.active_risk_tier, RiskTier::Ok);

        // Ending reconciles the active tier to the running maximum.
        let summary = t.end_session(&session.id).unwrap();
        assert_eq!(summary.session.active_risk_tier, RiskTier::Crisis);
    }

    #[test]
    fn test_sustained_elevated_risk_trend_note() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        let mut result = None;
        for _ in 0..3 {
            result = Some(
                t.append_message(
                    &session.id,
                    SenderRole::User,
                    "I feel so stressed and overwhelmed",
                    None,
                    None,
                )
                .unwrap(),
            );
        }
        let metrics = result.unwrap().metrics;
        assert!(metrics
            .trend_notes
            .contains(&"Sustained elevated risk across last three turns.".to_string()));
    }

    #[test]
    fn test_pipeline_risk_merges_and_auto_reply_is_stored() {
        let mut options = TrackerOptions::default();
        options.rag_enabled = true;
        options.rag_guardrails = false;
        let mut t = tracker_with(options);
        let pipeline = std::sync::Arc::new(FixedPipeline::new(TurnOutcome {
            reply: "It sounds like a lot. What would help most right now?".to_string(),
            reply_raw: "raw reply".to_string(),
            risk: Some(PipelineRisk {
                tier: "high".to_string(),
                score: Some(0.9),
                emotion: "fear".to_string(),
                dimensions: HashMap::new(),
                confidence: Some(0.8),
            }),
            ..TurnOutcome::default()
        }));
        t.set_pipeline(Box::new(pipeline.clone()));

        let session = t.create_session("alice", HashMap::new()).unwrap();
        let result = t
            .append_message(&session.id, SenderRole::User, "Rough day at work", None, None)
            .unwrap();

        assert_eq!(result.risk.tier, RiskTier::High);
        assert_eq!(result.risk.score, 0.9);
        assert!(result.risk.notes.iter().any(|n| n == "Emotion: fear"));

        let request = pipeline.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.session_id, session.id);
        assert_eq!(request.user_text, "Rough day at work");
        assert!(!request.use_guardrails);

        let assistant = result.assistant_message.unwrap();
        assert_eq!(assistant.sender, SenderRole::Assistant);
        assert_eq!(result.metrics.message_count, 2);
        assert_eq!(result.metrics.assistant_turns, 1);
    }

    #[test]
    fn test_pipeline_failure_degrades_to_note() {
        let mut options = TrackerOptions::default();
        options.rag_enabled = true;
        let mut t = tracker_with(options);
        t.set_pipeline(Box::new(FailingPipeline));

        let session = t.create_session("alice", HashMap::new()).unwrap();
        let result = t
            .append_message(&session.id, SenderRole::User, "hello there", None, None)
            .unwrap();

        assert!(result
            .risk
            .notes
            .iter()
            .any(|n| n.starts_with("RAG unavailable:")));
        assert!(result.assistant_message.is_none());
        assert!(result.pipeline.unwrap().error.is_some());
    }

    #[test]
    fn test_local_guardrails_enforce_on_raw_reply() {
        let mut options = TrackerOptions::default();
        options.rag_enabled = true;
        options.rag_guardrails = true;
        let mut t = tracker_with(options);
        t.set_pipeline(Box::new(FixedPipeline::new(TurnOutcome {
            reply: "remote-enforced reply".to_string(),
            reply_raw: "You must stop complaining about this.".to_string(),
            ..TurnOutcome::default()
        })));

        let session = t.create_session("alice", HashMap::new()).unwrap();
        let result = t
            .append_message(&session.id, SenderRole::User, "I had a rough week", None, None)
            .unwrap();

        let pipeline = result.pipeline.unwrap();
        assert_ne!(pipeline.reply, "remote-enforced reply");
        assert!(pipeline.reply.contains("you might stop complaining"));
        assert!(result
            .risk
            .notes
            .iter()
            .any(|n| n.starts_with("Guardrail action:")));
    }

    #[test]
    fn test_guardrails_disabled_records_bypass() {
        let mut options = TrackerOptions::default();
        options.rag_enabled = true;
        options.rag_guardrails = false;
        options.rag_auto_reply = false;
        let mut t = tracker_with(options);
        t.set_pipeline(Box::new(FixedPipeline::new(TurnOutcome {
            reply: "remote reply".to_string(),
            reply_raw: "raw".to_string(),
            ..TurnOutcome::default()
        })));

        let session = t.create_session("alice", HashMap::new()).unwrap();
        let result = t
            .append_message(&session.id, SenderRole::User, "hello", None, None)
            .unwrap();

        assert!(result
            .risk
            .notes
            .contains(&"Guardrail action: bypass".to_string()));
        assert!(result.assistant_message.is_none());
        assert_eq!(result.pipeline.unwrap().reply, "remote reply");
    }

    #[test]
    fn test_transcript_block_labels_speakers() {
        let mut options = TrackerOptions::default();
        options.rag_enabled = true;
        options.rag_auto_reply = true;
        options.rag_guardrails = false;
        let mut t = tracker_with(options);
        t.set_pipeline(Box::new(FixedPipeline::new(TurnOutcome {
            reply: "How did that feel?".to_string(),
            reply_raw: "How did that feel?".to_string(),
            ..TurnOutcome::default()
        })));

        let session = t.create_session("alice", HashMap::new()).unwrap();
        t.append_message(&session.id, SenderRole::User, "First message", None, None)
            .unwrap();

        let block = t.build_transcript_block(&session.id, 5).unwrap();
        assert!(block.contains("User: First message"));
        assert!(block.contains("Therapist: How did that feel?"));
    }

    #[test]
    fn test_history_summary_format() {
        let t = tracker();
        let session = t.create_session("alice", HashMap::new()).unwrap();
        t.append_message(&session.id, SenderRole::User, "I feel hopeless", None, None)
            .unwrap();

        let summary = t.build_history_summary(&session.id).unwrap();
        assert!(summary.starts_with("messages=1 | max_risk="));
    }

    #[test]
    fn test_register_adapter_escalates_assessment() {
        struct CodeRed;
        impl RiskAdapter for CodeRed {
            fn name(&self) -> &str {
                "code-red"
            }
            fn assess(
                &self,
                _text: &str,
                _sentiment: &SentimentResult,
            ) -> anyhow::Result<Option<RiskAssessment>> {
                Ok(Some(RiskAssessment {
                    tier: RiskTier::High,
                    score: 0.9,
                    flagged_keywords: vec!["code-red".to_string()],
                    notes: Vec::new(),
                }))
            }
        }

        let mut t = tracker();
        t.register_adapter(Box::new(CodeRed));
        let session = t.create_session("alice", HashMap::new()).unwrap();
        let result = t
            .append_message(&session.id, SenderRole::User, "ordinary message", None, None)
            .unwrap();
        assert_eq!(result.risk.tier, RiskTier::High);
        assert!(result
            .risk
            .flagged_keywords
            .contains(&"code-red".to_string()));
    }

    #[test]
    fn test_pipeline_risk_without_score_falls_back_to_sentiment() {
        let risk = PipelineRisk {
            tier: "caution".to_string(),
            score: None,
            emotion: String::new(),
            dimensions: HashMap::new(),
            confidence: None,
        };

        let negative = SentimentResult {
            score: -0.5,
            band: SentimentBand::Negative,
            tokens: vec!["hopeless".to_string()],
        };
        let mapped = map_pipeline_risk(Some(&risk), &negative).unwrap();
        assert_eq!(mapped.tier, RiskTier::Caution);
        assert_eq!(mapped.score, 0.5);

        // Positive sentiment never produces a negative fallback score.
        let positive = SentimentResult {
            score: 0.4,
            band: SentimentBand::Positive,
            tokens: Vec::new(),
        };
        let mapped = map_pipeline_risk(Some(&risk), &positive).unwrap();
        assert_eq!(mapped.score, 0.0);
    }

    #[test]
    fn test_merge_prefers_higher_severity_and_unions_keywords() {
        let primary = RiskAssessment {
            tier: RiskTier::Caution,
            score: 0.4,
            flagged_keywords: vec!["stressed".to_string()],
            notes: vec!["a".to_string()],
        };
        let secondary = RiskAssessment {
            tier: RiskTier::High,
            score: 0.3,
            flagged_keywords: vec!["panic".to_string(), "stressed".to_string()],
            notes: vec!["a".to_string(), "b".to_string()],
        };
        let merged = merge_assessments(primary, secondary);
        assert_eq!(merged.tier, RiskTier::High);
        assert_eq!(merged.score, 0.4);
        assert_eq!(
            merged.flagged_keywords,
            vec!["panic".to_string(), "stressed".to_string()]
        );
        assert_eq!(merged.notes, vec!["a".to_string(), "b".to_string()]);
    }
}
