// Core domain models for the orchestration core
// These are pure, serializable data structures with no I/O attached

//! # Domain Models Module
//!
//! Everything the engine layer persists, checkpoints, or passes across
//! component boundaries is defined here: workflow definitions and steps,
//! checkpointable workflow state, agent snapshots and lifecycle events,
//! decisions, escalations, and worktree records.
//!
//! The on-disk formats (state YAML, escalation JSON, worktree registry)
//! serialize these types directly, so field names here are the file formats.

// Workflow definitions and numbered steps
pub mod workflow;

// Checkpointable execution state and agent activity records
pub mod state;

// Agent snapshots, context, and lifecycle event payloads
pub mod agent;

// Decision engine output
pub mod decision;

// Durable human-in-the-loop escalation records
pub mod escalation;

// Per-story worktree records and the registry file shape
pub mod worktree;

// Re-export for a flat API
pub use agent::{Agent, AgentContext, AgentEvent, AgentEventType, AgentId};
pub use decision::{Decision, DecisionSource};
pub use escalation::{Escalation, EscalationRequest, EscalationStatus};
pub use state::{ActivityStatus, AgentActivity, ProjectInfo, WorkflowState, WorkflowStatus};
pub use workflow::{Step, WorkflowDefinition};
pub use worktree::{Worktree, WorktreeRegistryFile, WorktreeStatus};
