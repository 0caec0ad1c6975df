// Agent snapshots and lifecycle event payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a running agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(String);

impl AgentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The context snapshot handed to an agent at creation. Immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    /// Onboarding documents the agent may consult
    #[serde(default)]
    pub onboarding_docs: Vec<String>,
    /// Excerpt of the workflow state at creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_state: Option<Value>,
    pub task_description: String,
}

/// Read-only snapshot of a running agent.
///
/// The bound LLM client and the admission permit live inside the pool; a
/// snapshot is everything a caller may observe.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    /// Configured agent role this instance was created as
    pub name: String,
    /// Loaded persona text
    pub persona: String,
    pub context: AgentContext,
    pub start_time: DateTime<Utc>,
    /// Accumulated estimated cost across invocations, in dollars
    pub estimated_cost: f64,
}

/// Agent lifecycle event kinds, rendered as the dotted wire strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentEventType {
    #[serde(rename = "agent.started")]
    Started,
    #[serde(rename = "agent.invoked")]
    Invoked,
    #[serde(rename = "agent.error")]
    Error,
    #[serde(rename = "agent.completed")]
    Completed,
}

impl AgentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "agent.started",
            Self::Invoked => "agent.invoked",
            Self::Error => "agent.error",
            Self::Completed => "agent.completed",
        }
    }
}

/// Fire-and-forget observer notification emitted by the agent pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event: AgentEventType,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AgentEvent {
    pub fn new(
        event: AgentEventType,
        agent_id: AgentId,
        agent_name: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            event,
            agent_id,
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}
