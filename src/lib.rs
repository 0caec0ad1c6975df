// Agent Orchestrator - Autonomous Orchestration Core
// Drives declarative multi-phase workflows through a pool of LLM-backed agents

//! # Agent Orchestrator Library
//!
//! This is the library root for the autonomous orchestration core. The crate
//! interprets declarative workflow definitions and executes their step scripts
//! through a set of cooperating components, pausing for a human only when an
//! autonomous decision falls below the confidence threshold.
//!
//! ## Core Components
//!
//! - [`WorkflowEngine`]: top-level conductor that parses workflow definitions and
//!   step scripts, resolves variables, executes steps, checkpoints state
//! - [`AgentPool`]: bounded-concurrency lifecycle manager for LLM-backed agents
//!   with FIFO admission and cost accounting
//! - [`DecisionEngine`]: autonomous answer generation with confidence-based
//!   escalation, preferring onboarding-document evidence over LLM reasoning
//! - [`EscalationQueue`]: durable human-in-the-loop pause/resume channel
//! - [`StateManager`]: atomic, cached, crash-recoverable workflow state
//! - [`WorktreeManager`]: isolated per-story git worktrees for parallel
//!   development
//! - [`RetryHandler`]: error classification, exponential backoff with jitter,
//!   and escalation of persistent failures
//!
//! ## Layering
//!
//! - **Domain models** (`models/`): pure serializable types with no I/O
//! - **Engine layer** (`engine/`): execution, persistence, and scheduling
//! - **LLM contract** (`llm/`): the provider-opaque client interface the
//!   agent pool binds agents to
//!
//! The dashboard, messaging-bot, and CLI surfaces live outside this crate and
//! consume it through the types re-exported below.

pub mod models;

pub mod engine;

// LLM client contract. Providers are opaque to the core; anything satisfying
// the trait in `llm::traits` can back an agent.
pub mod llm;

// Structured logging bootstrap.
pub mod logging;

// Scripted test doubles for the LLM contract. Public so downstream crates can
// drive the orchestrator in their own tests.
pub mod testing;

// Re-export core domain types for easy access
pub use models::{
    ActivityStatus,     // Status of one agent activity record
    Agent,              // A running LLM-backed agent instance
    AgentActivity,      // Append-only activity record on workflow state
    AgentContext,       // Immutable snapshot handed to an agent at creation
    AgentEvent,         // Lifecycle event payload emitted by the pool
    AgentEventType,     // agent.started / invoked / error / completed
    AgentId,            // Unique agent identifier
    Decision,           // Output of the decision engine
    DecisionSource,     // onboarding | llm
    Escalation,         // Durable unresolved-question record
    EscalationRequest,  // Caller-supplied portion of a new escalation
    EscalationStatus,   // pending | resolved
    ProjectInfo,        // Project metadata on workflow state
    Step,               // One numbered step of a step script
    WorkflowDefinition, // Parsed declarative workflow document
    WorkflowState,      // Checkpointable execution state
    WorkflowStatus,     // running | paused | completed | failed
    Worktree,           // Per-story worktree record
    WorktreeStatus,     // active | pr-created | merged
};

// Re-export engine types for convenience
pub use engine::{
    agents::{AgentFilter, AgentPool, AgentPoolConfig},
    conditions::evaluate_condition,
    config::ConfigSource,
    decision::{DecisionEngine, DecisionEngineConfig},
    escalation::{EscalationFilter, EscalationMetrics, EscalationQueue},
    events::EventBus,
    parser::{parse_step_script, StepTag},
    retry::{
        ErrorClass, ErrorEscalation, ErrorMetric, EscalationLevel, RetryConfig, RetryHandler,
    },
    state::StateManager,
    template::{render_template, render_template_file, TemplateMode},
    workflow::{WorkflowEngine, WorkflowEngineConfig},
    worktree::{WorktreeManager, WorktreeManagerConfig},
};

// Re-export the LLM contract and cost tracking
pub use llm::{Budget, BudgetStatus, CostTracker, InvokeOptions, LLMClient, LLMClientFactory, TokenUsage};

use thiserror::Error;

/// Custom error types for orchestrator operations.
///
/// One tagged sum covers the whole taxonomy: transient kinds the retry
/// handler may replay, fatal kinds that surface immediately, and domain
/// kinds that are surfaced verbatim to the caller. The retry decision and
/// the escalation level are pure functions over the tag (see
/// [`engine::retry`]).
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Transient failure; eligible for retry with backoff
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Non-retryable failure; surfaces immediately
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Provider-side LLM API failure
    #[error("LLM API error: {0}")]
    LlmApi(String),

    /// Provider rate limit; transient
    #[error("LLM rate limit exceeded: {0}")]
    LlmRateLimit(String),

    /// Provider rejected the credentials; fatal
    #[error("LLM authentication failed: {0}")]
    LlmAuthentication(String),

    /// A bounded resource (budget, quota, disk) is exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Workflow definition or step script failed to load
    #[error("Workflow parse error: {0}")]
    WorkflowParse(String),

    /// A step or tag handler failed during execution
    #[error("Workflow execution error: {0}")]
    WorkflowExecution(String),

    /// State validation or persistence failure
    #[error("State manager error: {0}")]
    StateManager(String),

    /// Agent pool lifecycle failure
    #[error("Agent pool error: {0}")]
    AgentPool(String),

    /// Worktree operation failure not covered by a more specific kind
    #[error("Worktree error: {0}")]
    Worktree(String),

    /// A worktree is already tracked for this story
    #[error("Worktree already exists for story {0}")]
    WorktreeExists(String),

    /// No worktree is tracked for this story
    #[error("Worktree not found for story {0}")]
    WorktreeNotFound(String),

    /// Referenced template file does not exist
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Template text failed to parse
    #[error("Template syntax error: {0}")]
    TemplateSyntax(String),

    /// Strict-mode rendering hit an undefined variable with no default
    #[error("Undefined variable: {0}")]
    VariableUndefined(String),

    /// A durable write (state, escalation, registry) failed
    #[error("File write error: {0}")]
    FileWrite(String),

    /// An operation exceeded its deadline; transient unless the wrapped
    /// operation kind is explicitly fatal
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// The calling context was cancelled mid-operation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Wrapped failure from an external collaborator (git, filesystem)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Stable kind name used as the error-metrics key.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "RetryableError",
            Self::Fatal(_) => "FatalError",
            Self::LlmApi(_) => "LLMAPIError",
            Self::LlmRateLimit(_) => "LLMRateLimitError",
            Self::LlmAuthentication(_) => "LLMAuthenticationError",
            Self::ResourceExhausted(_) => "ResourceExhaustedError",
            Self::WorkflowParse(_) => "WorkflowParseError",
            Self::WorkflowExecution(_) => "WorkflowExecutionError",
            Self::StateManager(_) => "StateManagerError",
            Self::AgentPool(_) => "AgentPoolError",
            Self::Worktree(_) => "WorktreeError",
            Self::WorktreeExists(_) => "WorktreeExistsError",
            Self::WorktreeNotFound(_) => "WorktreeNotFoundError",
            Self::TemplateNotFound(_) => "TemplateNotFoundError",
            Self::TemplateSyntax(_) => "TemplateSyntaxError",
            Self::VariableUndefined(_) => "VariableUndefinedError",
            Self::FileWrite(_) => "FileWriteError",
            Self::Timeout(_) => "TimeoutError",
            Self::Cancelled(_) => "CancelledError",
            Self::Serialization(_) => "SerializationError",
            Self::Yaml(_) => "YamlError",
            Self::Internal(_) => "InternalError",
        }
    }
}

/// Type alias for Results that use the orchestrator error type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
