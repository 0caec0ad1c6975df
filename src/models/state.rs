// Checkpointable workflow state - the unit of crash recovery

//! # Workflow State
//!
//! [`WorkflowState`] is the execution state the engine checkpoints after
//! every step, keyed by project id. It is created the first time a workflow
//! executes, mutated only by the workflow engine through the state manager,
//! and never destroyed; completed and failed states are retained for audit.
//!
//! Serde renames follow the on-disk YAML format (`currentStep`,
//! `agentActivity`, `startTime`, ...), which is also the wire shape the
//! dashboard reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Project metadata carried on the workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Status of a single agent activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Started,
    Completed,
    Failed,
}

/// Append-only record of one agent action within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub agent_id: String,
    pub agent_name: String,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    pub status: ActivityStatus,
    pub duration_ms: u64,
}

impl AgentActivity {
    pub fn completed(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        action: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            action: action.into(),
            timestamp: Utc::now(),
            status: ActivityStatus::Completed,
            duration_ms,
        }
    }

    pub fn failed(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        action: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            action: action.into(),
            timestamp: Utc::now(),
            status: ActivityStatus::Failed,
            duration_ms,
        }
    }
}

/// The checkpointable execution state of one project's workflow.
///
/// `current_step` is `i64` rather than an unsigned type so that state read
/// back from hand-edited files can carry an invalid negative value; the
/// state manager rejects it at save time rather than panicking at parse
/// time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub project: ProjectInfo,
    /// Path of the workflow currently executing
    pub current_workflow: String,
    /// Highest checkpointed step number; 0 before any step completes
    pub current_step: i64,
    pub status: WorkflowStatus,
    /// Free-form variable scope; may contain nested maps and lists
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Ordered, append-only activity log
    #[serde(default)]
    pub agent_activity: Vec<AgentActivity>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl WorkflowState {
    /// Fresh state for a project about to run `workflow`.
    pub fn new(project: ProjectInfo, workflow: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project,
            current_workflow: workflow.into(),
            current_step: 0,
            status: WorkflowStatus::Running,
            variables: HashMap::new(),
            agent_activity: Vec::new(),
            start_time: now,
            last_update: now,
        }
    }

    /// Record completion of step `number` and touch `last_update`.
    pub fn checkpoint_step(&mut self, number: u32) {
        self.current_step = i64::from(number);
        self.last_update = Utc::now();
    }

    pub fn append_activity(&mut self, activity: AgentActivity) {
        self.agent_activity.push(activity);
        self.last_update = Utc::now();
    }

    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.last_update = Utc::now();
    }
}
