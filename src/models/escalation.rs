// Durable escalation records - the human-in-the-loop channel

//! # Escalations
//!
//! An [`Escalation`] is a question whose autonomous answer lacked
//! confidence, persisted as one JSON file under the escalation directory
//! until a human responds. The JSON field names below are the file format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Stable prefix for escalation ids; the UUID follows in canonical form.
pub const ESCALATION_ID_PREFIX: &str = "esc-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Resolved,
}

/// The caller-supplied portion of an escalation; the queue assigns id,
/// status, and creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub workflow_id: String,
    /// Step number the workflow paused at
    pub step: u32,
    pub question: String,
    pub ai_reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// Durable escalation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub id: String,
    pub workflow_id: String,
    pub step: u32,
    pub question: String,
    pub ai_reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Milliseconds from creation to resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_time: Option<i64>,
}

impl Escalation {
    /// Build a fresh pending record from a request, assigning the id and
    /// creation timestamp.
    pub fn from_request(request: EscalationRequest) -> Self {
        Self {
            id: format!("{ESCALATION_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            workflow_id: request.workflow_id,
            step: request.step,
            question: request.question,
            ai_reasoning: request.ai_reasoning,
            confidence: request.confidence,
            context: request.context,
            status: EscalationStatus::Pending,
            created_at: Utc::now(),
            response: None,
            resolved_at: None,
            resolution_time: None,
        }
    }

    /// Apply a human response, marking the record resolved.
    pub fn resolve(&mut self, response: impl Into<String>) {
        let now = Utc::now();
        self.response = Some(response.into());
        self.status = EscalationStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolution_time = Some((now - self.created_at).num_milliseconds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EscalationRequest {
        EscalationRequest {
            workflow_id: "wf-1".to_string(),
            step: 2,
            question: "Proceed with schema migration?".to_string(),
            ai_reasoning: "Low confidence.".to_string(),
            confidence: 0.6,
            context: HashMap::new(),
        }
    }

    #[test]
    fn from_request_assigns_prefixed_id_and_pending_status() {
        let esc = Escalation::from_request(request());
        assert!(esc.id.starts_with(ESCALATION_ID_PREFIX));
        // esc- prefix plus a 36-char canonical UUID
        assert_eq!(esc.id.len(), ESCALATION_ID_PREFIX.len() + 36);
        assert_eq!(esc.status, EscalationStatus::Pending);
        assert!(esc.response.is_none());
        assert!(esc.resolved_at.is_none());
    }

    #[test]
    fn resolve_sets_response_and_non_negative_resolution_time() {
        let mut esc = Escalation::from_request(request());
        esc.resolve("yes");
        assert_eq!(esc.status, EscalationStatus::Resolved);
        assert_eq!(esc.response.as_deref(), Some("yes"));
        assert!(esc.resolved_at.is_some());
        assert!(esc.resolution_time.unwrap() >= 0);
    }
}
