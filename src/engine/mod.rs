// Orchestration engine
// Execution, persistence, and scheduling on top of the domain models

//! # Engine Module
//!
//! The engine layer contains the seven cooperating components of the
//! orchestration core plus their shared plumbing:
//!
//! - [`workflow`]: the top-level conductor interpreting step scripts
//! - [`agents`]: bounded-concurrency agent pool with FIFO admission
//! - [`decision`]: confidence-scored autonomous answers
//! - [`escalation`]: durable pause/resume channel for humans
//! - [`state`]: atomic, cached workflow state persistence
//! - [`worktree`]: isolated per-story git worktrees
//! - [`retry`]: error classification, backoff, and failure escalation
//!
//! Shared plumbing: the step-script [`parser`], the [`conditions`]
//! expression evaluator, the [`template`] renderer, the external
//! [`config`] source, and the lifecycle [`events`] bus.
//!
//! Dependency direction follows the component graph: `state` and `retry`
//! are leaves; `agents` depends on state metrics and the LLM factory;
//! `workflow` conducts everything.

pub mod agents;
pub mod conditions;
pub mod config;
pub mod decision;
pub mod escalation;
pub mod events;
pub mod parser;
pub mod retry;
pub mod state;
pub mod template;
pub mod workflow;
pub mod worktree;

pub use agents::{AgentFilter, AgentPool, AgentPoolConfig};
pub use conditions::evaluate_condition;
pub use config::ConfigSource;
pub use decision::{DecisionEngine, DecisionEngineConfig};
pub use escalation::{EscalationFilter, EscalationMetrics, EscalationQueue};
pub use events::EventBus;
pub use parser::{parse_step_script, StepTag};
pub use retry::{ErrorClass, ErrorEscalation, ErrorMetric, EscalationLevel, RetryConfig, RetryHandler};
pub use state::StateManager;
pub use template::{render_template, render_template_file, TemplateMode};
pub use workflow::{WorkflowEngine, WorkflowEngineConfig};
pub use worktree::{WorktreeManager, WorktreeManagerConfig};
