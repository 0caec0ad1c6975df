// Autonomous decision making with confidence-based escalation

//! # Decision Engine
//!
//! Given a question and a free-form context map, produce a [`Decision`]
//! with a confidence score. Onboarding-document evidence is preferred over
//! LLM reasoning: a keyword-overlap hit in the onboarding corpus answers at
//! a fixed 0.95 confidence, while LLM-sourced answers are calibrated and
//! clamped to [0.3, 0.9].
//!
//! When the final confidence falls below [`ESCALATION_THRESHOLD`] the
//! sentinel `[ESCALATION REQUIRED: ...]` is appended to the reasoning. The
//! engine never enqueues escalations itself; the workflow engine inspects
//! the sentinel and decides.

use crate::llm::{InvokeOptions, LLMClient};
use crate::models::{Decision, DecisionSource};
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Confidence below this escalates. Fixed by the methodology.
pub const ESCALATION_THRESHOLD: f64 = 0.75;

/// Fixed confidence for onboarding-sourced answers.
const ONBOARDING_CONFIDENCE: f64 = 0.95;

/// Clamp range for LLM-sourced confidence.
const LLM_CONFIDENCE_MIN: f64 = 0.3;
const LLM_CONFIDENCE_MAX: f64 = 0.9;

/// Minimum token length considered meaningful for onboarding matching.
const MIN_TOKEN_LEN: usize = 4;

/// Tokens that must overlap before an onboarding document counts as a hit.
const MIN_OVERLAP: usize = 2;

const CERTAINTY_MARKERS: [&str; 3] = ["definitely", "clearly", "certain"];
const UNCERTAINTY_MARKERS: [&str; 5] = ["maybe", "unsure", "might", "need more", "missing"];

#[derive(Debug, Clone)]
pub struct DecisionEngineConfig {
    /// Directory of read-only `.md` onboarding documents
    pub onboarding_dir: PathBuf,
    /// Sampling temperature for the reasoning call
    pub temperature: f64,
}

impl DecisionEngineConfig {
    pub fn new(onboarding_dir: impl Into<PathBuf>) -> Self {
        Self {
            onboarding_dir: onboarding_dir.into(),
            temperature: 0.3,
        }
    }
}

/// Confidence-scored autonomous answers.
pub struct DecisionEngine {
    config: DecisionEngineConfig,
    client: Arc<dyn LLMClient>,
}

impl DecisionEngine {
    pub fn new(config: DecisionEngineConfig, client: Arc<dyn LLMClient>) -> Self {
        Self { config, client }
    }

    /// Answer `question`, preferring onboarding evidence over the LLM.
    pub async fn decide(
        &self,
        question: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Decision> {
        if let Some(decision) = self.decide_from_onboarding(question, context).await {
            return Ok(decision);
        }
        self.decide_from_llm(question, context).await
    }

    /// Scan the onboarding corpus for a keyword-overlap hit. Any I/O
    /// failure here falls through silently to LLM reasoning.
    async fn decide_from_onboarding(
        &self,
        question: &str,
        context: &HashMap<String, Value>,
    ) -> Option<Decision> {
        let tokens = question_tokens(question);
        if tokens.is_empty() {
            return None;
        }

        let mut entries = match fs::read_dir(&self.config.onboarding_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.config.onboarding_dir.display(), %e, "onboarding directory unavailable");
                return None;
            }
        };

        // Deterministic scan order
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "md") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            let haystack = content.to_lowercase();
            let overlap = tokens.iter().filter(|t| haystack.contains(*t)).count();
            if overlap >= MIN_OVERLAP {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                debug!(file = %file_name, overlap, "onboarding hit");
                return Some(Decision {
                    question: question.to_string(),
                    decision: Value::String(excerpt(&content)),
                    confidence: ONBOARDING_CONFIDENCE,
                    reasoning: format!(
                        "Answered from onboarding document '{file_name}' ({overlap} overlapping terms)"
                    ),
                    source: DecisionSource::Onboarding,
                    timestamp: Utc::now(),
                    context: context.clone(),
                });
            }
        }
        None
    }

    async fn decide_from_llm(
        &self,
        question: &str,
        context: &HashMap<String, Value>,
    ) -> Result<Decision> {
        let context_json = serde_json::to_string(context)?;
        let prompt = format!(
            "Answer the question below. Respond with JSON containing the fields \
             \"decision\", \"confidence\" (a number between 0 and 1), and \"reasoning\".\n\n\
             Question: {question}\n\nContext: {context_json}"
        );

        let response = self
            .client
            .invoke(
                &prompt,
                Some(InvokeOptions::with_temperature(self.config.temperature)),
            )
            .await?;

        let (decision_value, base_confidence, reasoning) = match parse_llm_json(&response) {
            Some((decision, confidence, reasoning)) => (decision, confidence, reasoning),
            None => {
                warn!("LLM response was not the requested JSON; deriving confidence from markers");
                (
                    Value::String(response.trim().to_string()),
                    marker_confidence(&response),
                    response.trim().to_string(),
                )
            }
        };

        let confidence = calibrate(base_confidence, &reasoning);
        let mut reasoning = reasoning;
        if confidence < ESCALATION_THRESHOLD {
            reasoning.push_str(&format!(
                "\n[ESCALATION REQUIRED: confidence {confidence:.2} below threshold {ESCALATION_THRESHOLD}]"
            ));
        }

        Ok(Decision {
            question: question.to_string(),
            decision: decision_value,
            confidence,
            reasoning,
            source: DecisionSource::Llm,
            timestamp: Utc::now(),
            context: context.clone(),
        })
    }
}

/// Lowercase tokens of length >= 4 from the question.
fn question_tokens(question: &str) -> HashSet<String> {
    question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= MIN_TOKEN_LEN)
        .map(str::to_string)
        .collect()
}

/// First few lines of a document, for use as the decision value.
fn excerpt(content: &str) -> String {
    const MAX: usize = 280;
    let trimmed = content.trim();
    if trimmed.len() <= MAX {
        return trimmed.to_string();
    }
    let mut cut = MAX;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

/// Try to parse the response as the requested JSON object, tolerating
/// surrounding prose or code fences.
fn parse_llm_json(response: &str) -> Option<(Value, f64, String)> {
    let candidate = match serde_json::from_str::<Value>(response.trim()) {
        Ok(value) => value,
        Err(_) => {
            let start = response.find('{')?;
            let end = response.rfind('}')?;
            serde_json::from_str::<Value>(&response[start..=end]).ok()?
        }
    };
    let object = candidate.as_object()?;
    let decision = object.get("decision")?.clone();
    let confidence = object.get("confidence")?.as_f64()?;
    let reasoning = object.get("reasoning")?.as_str()?.to_string();
    Some((decision, confidence, reasoning))
}

/// Confidence derived from certainty/uncertainty markers when the response
/// was not parseable JSON.
fn marker_confidence(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let certain = CERTAINTY_MARKERS.iter().filter(|m| lower.contains(**m)).count() as f64;
    let uncertain = UNCERTAINTY_MARKERS.iter().filter(|m| lower.contains(**m)).count() as f64;
    (0.6 + 0.1 * certain - 0.1 * uncertain).clamp(LLM_CONFIDENCE_MIN, LLM_CONFIDENCE_MAX)
}

/// Nudge the reported confidence by the markers present in the reasoning,
/// then clamp to the LLM-source range.
fn calibrate(confidence: f64, reasoning: &str) -> f64 {
    let lower = reasoning.to_lowercase();
    let mut adjusted = confidence;
    for marker in CERTAINTY_MARKERS {
        if lower.contains(marker) {
            adjusted += 0.05;
        }
    }
    for marker in UNCERTAINTY_MARKERS {
        if lower.contains(marker) {
            adjusted -= 0.1;
        }
    }
    adjusted.clamp(LLM_CONFIDENCE_MIN, LLM_CONFIDENCE_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLLMClient, MockResponse};

    fn context() -> HashMap<String, Value> {
        HashMap::from([("step".to_string(), Value::from(2))])
    }

    async fn engine_with(
        onboarding: &std::path::Path,
        client: MockLLMClient,
    ) -> DecisionEngine {
        DecisionEngine::new(DecisionEngineConfig::new(onboarding), Arc::new(client))
    }

    #[tokio::test]
    async fn onboarding_hit_answers_at_fixed_confidence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("database.md"),
            "# Database\nWe standardise on Postgres for relational storage.",
        )
        .unwrap();

        let client = MockLLMClient::with_response("should not be called");
        let engine = engine_with(dir.path(), client).await;

        let decision = engine
            .decide("Which database should the service use?", &context())
            .await
            .unwrap();

        assert_eq!(decision.source, DecisionSource::Onboarding);
        assert_eq!(decision.confidence, 0.95);
        assert!(decision.reasoning.contains("database.md"));
        assert!(!decision.requires_escalation());
        assert_eq!(decision.question, "Which database should the service use?");
    }

    #[tokio::test]
    async fn non_markdown_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("database.txt"),
            "database service standard answer",
        )
        .unwrap();

        let client = MockLLMClient::with_response(
            r#"{"decision": "postgres", "confidence": 0.85, "reasoning": "Common choice."}"#,
        );
        let engine = engine_with(dir.path(), client).await;
        let decision = engine
            .decide("Which database should the service use?", &context())
            .await
            .unwrap();
        assert_eq!(decision.source, DecisionSource::Llm);
    }

    #[tokio::test]
    async fn missing_onboarding_dir_falls_back_to_llm() {
        let client = MockLLMClient::with_response(
            r#"{"decision": "yes", "confidence": 0.8, "reasoning": "Clearly supported."}"#,
        );
        let engine = engine_with(std::path::Path::new("/nonexistent/onboarding"), client).await;

        let decision = engine.decide("Proceed?", &context()).await.unwrap();
        assert_eq!(decision.source, DecisionSource::Llm);
        // 0.8 + 0.05 (clearly), still within [0.3, 0.9]
        assert!(decision.confidence > 0.8 && decision.confidence <= 0.9);
        assert!(!decision.requires_escalation());
    }

    #[tokio::test]
    async fn low_confidence_appends_escalation_sentinel() {
        let client = MockLLMClient::with_response(
            r#"{"decision": "unsure", "confidence": 0.6, "reasoning": "Not enough information."}"#,
        );
        let engine = engine_with(std::path::Path::new("/nonexistent"), client).await;

        let decision = engine.decide("Proceed?", &context()).await.unwrap();
        assert!(decision.confidence < ESCALATION_THRESHOLD);
        assert!(decision.requires_escalation());
        assert!(decision.reasoning.contains("below threshold 0.75"));
    }

    #[tokio::test]
    async fn unparseable_response_uses_marker_confidence() {
        let client = MockLLMClient::with_response(
            "I am unsure; we might need more context before deciding.",
        );
        let engine = engine_with(std::path::Path::new("/nonexistent"), client).await;

        let decision = engine.decide("Proceed?", &context()).await.unwrap();
        assert_eq!(decision.source, DecisionSource::Llm);
        // unsure + might + "need more" drag the base below threshold
        assert!(decision.confidence < ESCALATION_THRESHOLD);
        assert!(decision.requires_escalation());
    }

    #[tokio::test]
    async fn reported_confidence_is_clamped_to_llm_range() {
        let client = MockLLMClient::with_response(
            r#"{"decision": "yes", "confidence": 0.99, "reasoning": "It is definitely and clearly certain."}"#,
        );
        let engine = engine_with(std::path::Path::new("/nonexistent"), client).await;
        let decision = engine.decide("Proceed?", &context()).await.unwrap();
        assert!(decision.confidence <= 0.9);
    }

    #[tokio::test]
    async fn llm_errors_propagate() {
        let client =
            MockLLMClient::with_script(vec![MockResponse::Failure("provider down".to_string())]);
        let engine = engine_with(std::path::Path::new("/nonexistent"), client).await;
        assert!(engine.decide("Proceed?", &context()).await.is_err());
    }
}
