// Decision engine output

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Sentinel embedded in `reasoning` when confidence falls below the
/// escalation threshold. The workflow engine inspects for this and enqueues
/// the escalation; the decision engine itself never touches the queue.
pub const ESCALATION_SENTINEL: &str = "ESCALATION REQUIRED";

/// Where a decision's answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Answered from the onboarding document corpus
    Onboarding,
    /// Answered by LLM reasoning
    Llm,
}

/// An autonomous answer to an ambiguous question, with a confidence score.
///
/// The original `question` and `context` are echoed back verbatim so that an
/// escalation built from a low-confidence decision carries everything a
/// human needs to answer it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub question: String,
    pub decision: Value,
    /// In [0, 1]; LLM-sourced decisions are clamped to [0.3, 0.9]
    pub confidence: f64,
    pub reasoning: String,
    pub source: DecisionSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl Decision {
    /// True when the reasoning carries the escalation sentinel.
    pub fn requires_escalation(&self) -> bool {
        self.reasoning.contains(ESCALATION_SENTINEL)
    }
}
