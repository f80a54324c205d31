//! External reply-generation seam
//!
//! Retrieval, routing, and prompt building live in a separate service. The
//! tracker only knows this one call: hand over the user turn plus session
//! context, get back a candidate reply and an optional risk estimate. The
//! trait keeps the tracker testable with an in-process fake.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One turn handed to the external pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRequest {
    pub user_text: String,
    /// Compact `messages=N | max_risk=t | notes=…` line for the router.
    pub history_summary: String,
    /// Last few user/assistant exchanges, labelled per speaker.
    pub transcript_block: String,
    pub country_code: String,
    pub k: usize,
    pub model: String,
    pub session_id: String,
    pub use_guardrails: bool,
}

/// External risk estimate, merged into the local assessment when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRisk {
    pub tier: String,
    /// Absent when the external analyzer could not score the turn; the
    /// tracker then falls back to the local sentiment signal.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub emotion: String,
    #[serde(default)]
    pub dimensions: HashMap<String, f64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What the pipeline produced for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Reply after the pipeline's own enforcement, if it ran any.
    #[serde(default)]
    pub reply: String,
    /// Unenforced candidate reply. Local enforcement starts from this.
    #[serde(default)]
    pub reply_raw: String,
    #[serde(default)]
    pub risk: Option<PipelineRisk>,
    #[serde(default)]
    pub guardrail_action: Option<String>,
    #[serde(default)]
    pub guardrail_notes: Option<String>,
    #[serde(default)]
    pub docs: Vec<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A reply generator reachable through a single fixed call.
pub trait ReplyPipeline: Send + Sync {
    fn run_turn(&self, request: &TurnRequest) -> Result<TurnOutcome>;
}

/// Pipeline reached over HTTP: POSTs the request as JSON and decodes the
/// outcome from the response body.
pub struct HttpReplyPipeline {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpReplyPipeline {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build pipeline HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }
}

impl ReplyPipeline for HttpReplyPipeline {
    fn run_turn(&self, request: &TurnRequest) -> Result<TurnOutcome> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .with_context(|| format!("Pipeline request to {} failed", self.endpoint))?
            .error_for_status()
            .context("Pipeline returned an error status")?;
        response
            .json::<TurnOutcome>()
            .context("Failed to decode pipeline response")
    }
}
