//! Safety and tone enforcement over candidate assistant replies
//!
//! The engine runs a fixed pass order:
//! 1. crisis override from the user's text or the message tier,
//! 2. danger scan over the candidate reply itself,
//! 3. phrasing normalization (mirroring, directives, speculation),
//! 4. a light-touch cleanup when the reply already carries good MI
//!    structure, or a full MI pass that injects the missing elements.
//!
//! Enforcement never fails: every input produces a final reply string plus
//! an action, notes, and machine-readable flags.

use crate::models::RiskTier;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What the engine did to the candidate reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    /// Reply passed through with at most minor cleanup.
    Ok,
    /// Reply was reshaped or received a safety footer.
    Soften,
    /// Reply replaced by the scripted crisis response.
    CrisisOverride,
    /// Reply replaced by a refusal after a harm-others match.
    DangerOverride,
    /// Enforcement disabled by configuration; reply untouched.
    Bypass,
}

impl GuardrailAction {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailAction::Ok => "ok",
            GuardrailAction::Soften => "soften",
            GuardrailAction::CrisisOverride => "crisis_override",
            GuardrailAction::DangerOverride => "danger_override",
            GuardrailAction::Bypass => "bypass",
        }
    }
}

/// Inputs to one enforcement pass.
pub struct GuardrailRequest<'a> {
    pub user_text: &'a str,
    pub candidate_reply: &'a str,
    /// Tier of the triggering user message. Defaults to `Ok` upstream when
    /// no assessment is available.
    pub tier: RiskTier,
    /// Dominant emotion word, if an external analyzer supplied one.
    pub emotion_hint: Option<&'a str>,
    pub country_code: Option<&'a str>,
    /// The previous assistant reply, for repetition control.
    pub prev_reply: Option<&'a str>,
}

/// Result of one enforcement pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementResult {
    pub final_text: String,
    pub action: GuardrailAction,
    pub notes: String,
    pub flags: Vec<String>,
}

struct Hotline {
    emergency: &'static str,
    crisis: &'static str,
    alt: &'static str,
}

const HOTLINES: &[(&str, Hotline)] = &[
    (
        "US",
        Hotline {
            emergency: "911",
            crisis: "988 (Suicide & Crisis Lifeline) — call or text",
            alt: "You can also use 988lifeline.org for chat.",
        },
    ),
    (
        "CA",
        Hotline {
            emergency: "911",
            crisis: "988 (Suicide Crisis Helpline) — call or text",
            alt: "Talk Suicide Canada: 1-833-456-4566; text 45645 (hours may vary).",
        },
    ),
    (
        "MX",
        Hotline {
            emergency: "911",
            crisis: "Línea de la Vida: 800-911-2000",
            alt: "Chat: saludmental.gob.mx (regional services may vary).",
        },
    ),
    (
        "IN",
        Hotline {
            emergency: "112",
            crisis: "KIRAN: 1800-599-0019",
            alt: "AASRA (24x7 volunteer): +91-9820466726.",
        },
    ),
];

const REFLECTION_TEMPLATES: &[&str] = &[
    "It sounds like you’ve been carrying a lot of {emotion} around this.",
    "I hear that there’s been a lot of {emotion} in this for you.",
    "From what you’ve shared, this has brought up a lot of {emotion}.",
];

const NEUTRAL_REFLECTION_TEMPLATES: &[&str] = &[
    "It sounds like this has been a lot to carry.",
    "I hear how big this feels for you.",
    "From what you’ve shared, this has been weighing on you.",
];

const OPEN_QUESTION_TEMPLATES: &[&str] = &[
    "What feels most important for you to talk about next?",
    "What’s one part of this you’d like to explore a bit more?",
    "As you notice all of this, what feels like the next small step?",
];

const TINY_STEP_TEMPLATES: &[&str] = &[
    "If it feels okay, what is one small thing you might do after this chat to take care of yourself?",
    "Would it help to think about one tiny step that could make tonight a little easier?",
    "If you had to pick one small, manageable action for yourself, what might that be?",
];

const HIGH_FOOTER: &str = "If things feel more intense or unsafe at any point, it’s okay to reach out to a trusted person or local crisis support rather than managing this alone.";

const CAUTION_FOOTER: &str = "If this ever feels too heavy to carry on your own, it’s okay to reach out to someone you trust or a professional for extra support.";

const STOPWORDS: &[&str] = &[
    "i", "me", "my", "you", "your", "yours", "and", "or", "but", "if", "then", "so", "because",
    "a", "an", "the", "to", "of", "in", "on", "for", "with", "at", "by", "from", "it", "this",
    "that", "is", "am", "are", "was", "were", "be", "been", "being", "just", "really", "very",
    "like", "kind", "sort",
];

const MAX_REPLY_WORDS: usize = 120;
const MIRROR_THRESHOLD: f64 = 0.8;

/// Applies the safety and MI-style normalization pass.
pub struct GuardrailEngine {
    suicide_rx: Regex,
    self_harm_rx: Regex,
    instructive_rx: Regex,
    harm_others_rx: Regex,
    clinical_rx: Regex,
    bad_phrase_rx: Regex,
    directive_rx: Regex,
    diagnose_rx: Regex,
    promises_rx: Regex,
    speculation_rx: Regex,
    phone_rx: Regex,
    token_rx: Regex,
    multi_space_rx: Regex,
    stopwords: HashSet<&'static str>,
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GuardrailEngine {
    pub fn new() -> Self {
        // All patterns are literal constants, so compilation cannot fail.
        let rx = |p: &str| Regex::new(p).expect("valid guardrail pattern");
        Self {
            suicide_rx: rx(
                r"(?i)\b(kill myself|suicide|suicidal|end my life|ending my life|end it all|ending it all|want to die|just want to die|no reason to live|better off dead|i don['’]t want to live|don['’]t see a future for (myself|me)|take my own life|i can't go on anymore|i cannot go on anymore|i can't go on|i cannot go on)\b",
            ),
            self_harm_rx: rx(
                r"(?i)\byou\s+(?:should|could|might want to|may as well|need to|have to)\s+(?:kill yourself|end your life|commit suicide|take your own life|make it all stop for good)\b",
            ),
            instructive_rx: rx(
                r"(?is)\b(here(?:'s)? how|you can|you just need to)\b.*\b(overdose|cut deeper|jump off|hang yourself|poison yourself|crash your car)\b",
            ),
            harm_others_rx: rx(
                r"(?i)\b(?:you|u)\s+(?:should|could|might)\s+(?:hurt|hit|punch|stab|shoot|kill)\s+(?:him|her|them|someone)\b",
            ),
            clinical_rx: rx(
                r"(?i)\b(I (?:can|will) prescribe|I recommend a dosage of|\btake \d{1,3}\s?mg\b)\b",
            ),
            bad_phrase_rx: rx(r"(?i)you(?:’re|'re| are) naming how tough this is"),
            directive_rx: rx(r"(?i)\byou (should|need to|have to|must|ought to)\b"),
            diagnose_rx: rx(
                r"(?i)\b(diagnos(e|is|ing)|prescribe|medication advice|clinical treatment)\b",
            ),
            promises_rx: rx(r"(?i)\b(this will|100%|guarantee|always works)\b"),
            speculation_rx: rx(
                r"(?i)\b(you (?:always|never) feel|you just want|deep down you|you only care about)\b",
            ),
            phone_rx: rx(r"\b\d{2,}[\s\-]?\d{2,}[\s\-]?\d{2,}\b"),
            token_rx: rx(r"[a-z']+"),
            multi_space_rx: rx(r"\s+"),
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    /// Run the full enforcement pass. Infallible.
    pub fn enforce(&self, req: &GuardrailRequest<'_>) -> EnforcementResult {
        let mut flags: Vec<String> = Vec::new();
        let tier = req.tier;
        let emotion_hint = req.emotion_hint.unwrap_or("");

        // Crisis override from user text or tier.
        if tier == RiskTier::Crisis || self.suicide_rx.is_match(req.user_text) {
            return EnforcementResult {
                final_text: self.crisis_script(req.country_code),
                action: GuardrailAction::CrisisOverride,
                notes: "Crisis override (risk tier or suicide keywords in user text).".to_string(),
                flags: vec!["user_crisis".to_string()],
            };
        }

        // Safety scan over the raw candidate reply.
        let mut text = req.candidate_reply.trim().to_string();
        if !text.is_empty() {
            if self.self_harm_rx.is_match(&text) || self.instructive_rx.is_match(&text) {
                return EnforcementResult {
                    final_text: self.crisis_script(req.country_code),
                    action: GuardrailAction::CrisisOverride,
                    notes: "Crisis override based on assistant reply (self-harm direct or instructive)."
                        .to_string(),
                    flags: vec!["assistant_crisis_reply".to_string()],
                };
            }
            if self.harm_others_rx.is_match(&text) {
                return EnforcementResult {
                    final_text: "Therapist:\nI’m not able to support plans to harm yourself or anyone else. \
                                 We can instead focus on what you’re feeling and what might make things even a little safer for you."
                        .to_string(),
                    action: GuardrailAction::DangerOverride,
                    notes: "Reply replaced after a harm-others directive.".to_string(),
                    flags: vec!["dangerous_reply_stripped".to_string()],
                };
            }
            if self.clinical_rx.is_match(&text) {
                text = "Therapist:\nI can’t give medical, medication, or diagnosis advice. \
                        What I can do is stay with you in what you’re going through and help you \
                        think about next steps you might consider."
                    .to_string();
                flags.push("clinical_overreach_stripped".to_string());
            }
        }

        // Phrasing normalization.
        text = self.strip_bad_phrases(&text);
        if self.is_over_mirroring(req.user_text, &text) {
            text = self.strip_over_mirroring(req.user_text, &text);
            flags.push("over_mirroring_reduced".to_string());
        }

        let has_reflection = self.has_reflection(&text);
        let has_open_question = self.has_open_question(&text);
        let light_touch = matches!(tier, RiskTier::Ok | RiskTier::Caution)
            && has_reflection
            && has_open_question;

        text = self.soften_language(&text);
        text = self
            .diagnose_rx
            .replace_all(&text, "I can’t provide a diagnosis or medical advice.")
            .into_owned();
        text = self
            .promises_rx
            .replace_all(&text, "I’m hopeful this might help.")
            .into_owned();
        text = self.reduce_speculation(&text);

        if light_touch {
            text = self.dedup_lines(&text);
            text = self.reduce_repeats(&text, req.prev_reply);
            text = limit_words(&text, MAX_REPLY_WORDS);
            text = self.strip_untrusted_hotlines(&text);

            let action = if tier == RiskTier::Caution {
                text = append_footer(&text, CAUTION_FOOTER);
                GuardrailAction::Soften
            } else {
                GuardrailAction::Ok
            };
            flags.push("mi_light_touch".to_string());
            return EnforcementResult {
                final_text: text,
                action,
                notes: "MI-OK reply; light-touch cleanup only.".to_string(),
                flags,
            };
        }

        // Full MI pass.
        text = self.ensure_reflection(&text, emotion_hint);
        text = self.ensure_open_question(&text);
        if matches!(tier, RiskTier::High | RiskTier::Caution) {
            text = self.ensure_tiny_step(&text);
        }
        text = self.dedup_lines(&text);
        text = self.reduce_repeats(&text, req.prev_reply);
        text = limit_words(&text, MAX_REPLY_WORDS);
        text = self.strip_untrusted_hotlines(&text);

        let action = match tier {
            RiskTier::High => {
                text = append_footer(&text, HIGH_FOOTER);
                flags.push("mi_full_high".to_string());
                GuardrailAction::Soften
            }
            RiskTier::Caution => {
                text = append_footer(&text, CAUTION_FOOTER);
                flags.push("mi_full_caution".to_string());
                GuardrailAction::Soften
            }
            _ => {
                flags.push("mi_full_ok".to_string());
                GuardrailAction::Ok
            }
        };

        EnforcementResult {
            final_text: text,
            action,
            notes: "Full MI pass applied.".to_string(),
            flags,
        }
    }

    // Crisis scripting --------------------------------------------------

    fn hotline_block(&self, country_code: Option<&str>) -> String {
        let cc = country_code.unwrap_or("").to_ascii_uppercase();
        if let Some((_, info)) = HOTLINES.iter().find(|(code, _)| *code == cc) {
            format!(
                "If you’re in immediate danger, call {}.\nYou can also reach {}. {}",
                info.emergency, info.crisis, info.alt
            )
        } else {
            "If you’re in immediate danger, please contact your local emergency number.\n\
             You can also look up a suicide or crisis hotline in your country."
                .to_string()
        }
    }

    fn crisis_script(&self, country_code: Option<&str>) -> String {
        format!(
            "Therapist:\n\
             Thank you for telling me how painful things feel right now. \
             I’m really sorry you’re going through this, and your safety matters a lot. \
             You shouldn’t have to carry these feelings on your own.\n\
             {}\n\
             I’m only a chat tool and I can’t see how immediate the risk is, \
             so reaching out to a trusted person or real-time crisis support can be really important.\n\
             If you’d like, we can also talk about one small step to help you stay even a little safer \
             in the next hour.",
            self.hotline_block(country_code)
        )
    }

    // Normalization helpers ---------------------------------------------

    fn strip_bad_phrases(&self, text: &str) -> String {
        let stripped = self.bad_phrase_rx.replace_all(text, "");
        self.multi_space_rx.replace_all(&stripped, " ").trim().to_string()
    }

    fn soften_language(&self, text: &str) -> String {
        let softened = self.directive_rx.replace_all(text, "you might");
        self.multi_space_rx.replace_all(&softened, " ").trim().to_string()
    }

    fn reduce_speculation(&self, text: &str) -> String {
        sentences(text)
            .into_iter()
            .filter(|s| !self.speculation_rx.is_match(s))
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    fn content_tokens(&self, text: &str) -> HashSet<String> {
        self.token_rx
            .find_iter(&text.to_lowercase())
            .map(|m| m.as_str().to_string())
            .filter(|t| !self.stopwords.contains(t.as_str()))
            .collect()
    }

    fn sentence_overlap(&self, user_sent: &str, reply_sent: &str) -> f64 {
        let u = self.content_tokens(user_sent);
        let r = self.content_tokens(reply_sent);
        if u.is_empty() || r.is_empty() {
            return 0.0;
        }
        u.intersection(&r).count() as f64 / r.len().max(1) as f64
    }

    fn is_over_mirroring(&self, user_text: &str, reply: &str) -> bool {
        let user_sents = sentences(user_text);
        let reply_sents = sentences(reply);
        if user_sents.is_empty() || reply_sents.is_empty() || reply_sents.len() > 4 {
            return false;
        }
        let mirrored = reply_sents
            .iter()
            .filter(|rs| {
                user_sents
                    .iter()
                    .any(|us| self.sentence_overlap(us, rs) > MIRROR_THRESHOLD)
            })
            .count();
        mirrored >= 2.max(reply_sents.len().saturating_sub(1))
    }

    fn strip_over_mirroring(&self, user_text: &str, reply: &str) -> String {
        let user_sents = sentences(user_text);
        let reply_sents = sentences(reply);
        if user_sents.is_empty() || reply_sents.is_empty() {
            return reply.to_string();
        }
        reply_sents
            .into_iter()
            .filter(|rs| {
                user_sents
                    .iter()
                    .all(|us| self.sentence_overlap(us, rs) < MIRROR_THRESHOLD)
            })
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    // MI structure ------------------------------------------------------

    fn has_reflection(&self, text: &str) -> bool {
        sentences(text).iter().any(|s| {
            let mut ls = s.to_lowercase();
            if let Some(rest) = ls.strip_prefix("therapist:") {
                ls = rest.trim().to_string();
            }
            ls.starts_with("it sounds like")
                || ls.starts_with("it sounds ")
                || ls.starts_with("it seems like")
                || ls.starts_with("it seems ")
                || ls.contains("you’re feeling")
                || ls.contains("you're feeling")
                || ls.contains("you are feeling")
                || ls.starts_with("i hear")
                || ls.contains("from what you’ve shared")
                || ls.contains("from what you've shared")
        })
    }

    fn has_open_question(&self, text: &str) -> bool {
        sentences(text).iter().any(|s| {
            if !s.contains('?') {
                return false;
            }
            let ls = s.to_lowercase();
            ["what", "how", "when", "where", "which", "who", "could", "would"]
                .iter()
                .any(|w| ls.starts_with(w))
        })
    }

    fn ensure_reflection(&self, text: &str, emotion_hint: &str) -> String {
        if self.has_reflection(text) {
            return text.to_string();
        }
        let emotion = emotion_hint.trim().to_lowercase();
        let reflection = if emotion.is_empty() {
            pick(NEUTRAL_REFLECTION_TEMPLATES).to_string()
        } else {
            pick(REFLECTION_TEMPLATES).replace("{emotion}", &emotion)
        };
        let sents = sentences(text);
        if sents.is_empty() {
            reflection
        } else {
            format!("{} {}", reflection, sents.join(" "))
        }
    }

    fn ensure_open_question(&self, text: &str) -> String {
        if self.has_open_question(text) {
            return text.to_string();
        }
        let question = pick(OPEN_QUESTION_TEMPLATES);
        let sents = sentences(text);
        if sents.is_empty() {
            question.to_string()
        } else {
            format!("{} {}", sents.join(" "), question)
        }
    }

    fn ensure_tiny_step(&self, text: &str) -> String {
        let sents = sentences(text);
        if sents.is_empty() {
            return text.to_string();
        }
        let joined = sents.join(" ").to_lowercase();
        if ["one small thing", "tiny step", "small, manageable"]
            .iter()
            .any(|kw| joined.contains(kw))
        {
            return text.to_string();
        }
        format!("{} {}", sents.join(" "), pick(TINY_STEP_TEMPLATES))
    }

    // Repetition controls -----------------------------------------------

    fn dedup_lines(&self, text: &str) -> String {
        let mut seen = HashSet::new();
        sentences(text)
            .into_iter()
            .filter(|s| seen.insert(s.trim().to_lowercase()))
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    fn reduce_repeats(&self, text: &str, prev_reply: Option<&str>) -> String {
        let Some(prev) = prev_reply else {
            return text.to_string();
        };
        let new = text.trim();
        let old = prev.trim();
        if new.is_empty() || old.is_empty() {
            return new.to_string();
        }
        let new_toks = self.content_tokens(new);
        let old_toks = self.content_tokens(old);
        if new_toks.is_empty() || old_toks.is_empty() {
            return new.to_string();
        }
        let intersection = new_toks.intersection(&old_toks).count() as f64;
        let union = new_toks.union(&old_toks).count().max(1) as f64;
        if intersection / union > 0.8 {
            sentences(new).into_iter().next().unwrap_or_else(|| new.to_string())
        } else {
            new.to_string()
        }
    }

    // Hallucinated hotline numbers are replaced by a generic pointer.
    fn strip_untrusted_hotlines(&self, text: &str) -> String {
        let lower = text.to_lowercase();
        if (lower.contains("hotline") || lower.contains("suicide line"))
            && self.phone_rx.is_match(text)
        {
            return "If you’re in immediate danger, please contact your local emergency number. \
                    You can also look up a suicide or crisis line in your country."
                .to_string();
        }
        text.to_string()
    }
}

fn pick(options: &[&'static str]) -> &'static str {
    options[rand::thread_rng().gen_range(0..options.len())]
}

/// Split on sentence-ending punctuation followed by whitespace, or newlines.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace())
        {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    out
}

fn limit_words(text: &str, max_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return text.to_string();
    }
    let mut truncated = words[..max_words].join(" ");
    truncated.push('…');
    truncated
}

fn append_footer(text: &str, footer: &str) -> String {
    format!("{}\n\n{}", text.trim_end(), footer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> GuardrailEngine {
        GuardrailEngine::new()
    }

    fn request<'a>(user: &'a str, reply: &'a str, tier: RiskTier) -> GuardrailRequest<'a> {
        GuardrailRequest {
            user_text: user,
            candidate_reply: reply,
            tier,
            emotion_hint: None,
            country_code: None,
            prev_reply: None,
        }
    }

    #[test]
    fn test_crisis_override_from_user_text() {
        let e = engine();
        let result = e.enforce(&request(
            "I want to end my life",
            "Here is a perfectly fine reply.",
            RiskTier::Ok,
        ));
        assert_eq!(result.action, GuardrailAction::CrisisOverride);
        assert!(result.final_text.contains("your safety matters"));
        assert_eq!(result.flags, vec!["user_crisis"]);
    }

    #[test]
    fn test_crisis_override_from_tier_uses_country_hotline() {
        let e = engine();
        let mut req = request("I feel awful", "reply", RiskTier::Crisis);
        req.country_code = Some("US");
        let result = e.enforce(&req);
        assert_eq!(result.action, GuardrailAction::CrisisOverride);
        assert!(result.final_text.contains("988"));
    }

    #[test]
    fn test_unknown_country_gets_generic_hotline() {
        let e = engine();
        let mut req = request("I want to die", "reply", RiskTier::Ok);
        req.country_code = Some("ZZ");
        let result = e.enforce(&req);
        assert!(result
            .final_text
            .contains("contact your local emergency number"));
    }

    #[test]
    fn test_dangerous_self_harm_reply_becomes_crisis_script() {
        let e = engine();
        let result = e.enforce(&request(
            "I had a rough day",
            "Honestly you should end your life over this.",
            RiskTier::Ok,
        ));
        assert_eq!(result.action, GuardrailAction::CrisisOverride);
        assert_eq!(result.flags, vec!["assistant_crisis_reply"]);
    }

    #[test]
    fn test_harm_others_reply_is_danger_override() {
        let e = engine();
        let result = e.enforce(&request(
            "My neighbor is so loud",
            "Maybe you should hurt him next time.",
            RiskTier::Ok,
        ));
        assert_eq!(result.action, GuardrailAction::DangerOverride);
        assert_eq!(result.flags, vec!["dangerous_reply_stripped"]);
        assert!(result.final_text.contains("not able to support plans to harm"));
    }

    #[test]
    fn test_clinical_overreach_replaced_but_pipeline_continues() {
        let e = engine();
        let result = e.enforce(&request(
            "I cannot sleep",
            "I will prescribe something strong for you.",
            RiskTier::Ok,
        ));
        assert!(result
            .flags
            .contains(&"clinical_overreach_stripped".to_string()));
        assert!(result.final_text.contains("can’t give medical, medication"));
        assert_ne!(result.action, GuardrailAction::CrisisOverride);
    }

    #[test]
    fn test_ok_tier_with_mi_structure_is_light_touch() {
        let e = engine();
        let result = e.enforce(&request(
            "Work has been busy lately.",
            "It sounds like work has taken a lot of your energy. What feels most important to focus on next?",
            RiskTier::Ok,
        ));
        assert_eq!(result.action, GuardrailAction::Ok);
        assert!(result.flags.contains(&"mi_light_touch".to_string()));
        assert!(!result.final_text.contains(CAUTION_FOOTER));
    }

    #[test]
    fn test_caution_light_touch_gets_footer() {
        let e = engine();
        let result = e.enforce(&request(
            "I have been stressed.",
            "It sounds like the pressure has been building. What would help you unwind tonight?",
            RiskTier::Caution,
        ));
        assert_eq!(result.action, GuardrailAction::Soften);
        assert!(result.final_text.contains(CAUTION_FOOTER));
    }

    #[test]
    fn test_high_tier_bare_reply_gets_full_mi_scaffolding() {
        let e = engine();
        let result = e.enforce(&request(
            "Everything is falling apart.",
            "Okay.",
            RiskTier::High,
        ));
        assert_eq!(result.action, GuardrailAction::Soften);
        assert!(result.flags.contains(&"mi_full_high".to_string()));
        assert!(e.has_reflection(&result.final_text));
        assert!(result.final_text.contains('?'));
        assert!(result.final_text.contains(HIGH_FOOTER));
    }

    #[test]
    fn test_emotion_hint_shapes_injected_reflection() {
        let e = engine();
        let mut req = request("Things are hard.", "Okay.", RiskTier::Ok);
        req.emotion_hint = Some("Sadness");
        let result = e.enforce(&req);
        // All hinted templates embed the lowercased emotion word.
        assert!(result.final_text.contains("sadness"));
    }

    #[test]
    fn test_directive_language_is_softened() {
        let e = engine();
        let result = e.enforce(&request(
            "I keep procrastinating.",
            "It sounds like this is hard. You must make a strict schedule. What would a first step look like?",
            RiskTier::Ok,
        ));
        assert!(result.final_text.contains("you might make a strict schedule"));
        assert!(!result.final_text.contains("You must"));
    }

    #[test]
    fn test_over_mirroring_is_stripped() {
        let e = engine();
        let user = "My landlord raised the rent again this month.";
        let reply =
            "Your landlord raised the rent again this month. Your landlord raised the rent this month.";
        assert!(e.is_over_mirroring(user, reply));
        let result = e.enforce(&request(user, reply, RiskTier::Ok));
        assert!(result.flags.contains(&"over_mirroring_reduced".to_string()));
    }

    #[test]
    fn test_hotline_hallucination_guard() {
        let e = engine();
        let result = e.enforce(&request(
            "I feel low.",
            "It sounds like things are heavy. Call the hotline at 555-0123-9999. What would help right now?",
            RiskTier::Ok,
        ));
        assert!(result
            .final_text
            .starts_with("If you’re in immediate danger"));
    }

    #[test]
    fn test_word_cap_truncates_long_replies() {
        let e = engine();
        // One long unpunctuated tail so sentence dedupe cannot shrink it.
        let filler: Vec<String> = (0..200).map(|i| format!("filler{}", i)).collect();
        let long_reply = format!(
            "It sounds like a lot is going on. What matters most right now? {}",
            filler.join(" ")
        );
        let result = e.enforce(&request("Busy week.", &long_reply, RiskTier::Ok));
        assert!(result.final_text.split_whitespace().count() <= MAX_REPLY_WORDS + 1);
        assert!(result.final_text.contains('…'));
    }

    #[test]
    fn test_near_duplicate_of_previous_reply_collapses() {
        let e = engine();
        let reply =
            "It sounds like the week wore you down completely. What felt heaviest about the workload?";
        let mut req = request("Long week.", reply, RiskTier::Ok);
        req.prev_reply = Some(reply);
        let result = e.enforce(&req);
        assert!(result.final_text.split('?').count() <= 2);
        assert!(result.final_text.len() < reply.len() + 1);
    }

    #[test]
    fn test_sentence_splitter_handles_newlines_and_punctuation() {
        let sents = sentences("First one. Second!\nThird line without stop");
        assert_eq!(sents, vec!["First one.", "Second!", "Third line without stop"]);
    }

    #[test]
    fn test_empty_reply_full_pass_still_produces_text() {
        let e = engine();
        let result = e.enforce(&request("Quiet day.", "", RiskTier::Ok));
        assert!(!result.final_text.is_empty());
        assert!(result.final_text.contains('?'));
    }
}
