// Workflow engine - the top-level conductor

//! # Workflow Engine
//!
//! Interprets a declarative workflow definition plus its step script and
//! drives the other components: the decision engine for elicitations, the
//! escalation queue when confidence is too low, the agent pool for cost
//! visibility, and the state manager for a checkpoint after every step.
//!
//! Execution contract per step, in order:
//!
//! 1. an `if` guard that evaluates false skips the step (logged)
//! 2. `optional="true"` steps are skipped in yolo mode
//! 3. inner tags execute in document order (see [`StepTag`])
//! 4. completion checkpoints `currentStep` and appends an activity record
//!
//! `resume_from_state` restarts at `currentStep + 1`; checkpointed steps
//! never re-execute. A tag failure persists a `failed` state and re-raises
//! as a workflow execution error. Cancellation between tags stops execution
//! without marking the workflow failed; a workflow paused on an escalation
//! stays durably `paused`.

use crate::engine::agents::AgentPool;
use crate::engine::conditions::evaluate_condition;
use crate::engine::config::{value_to_display_string, yaml_to_json, ConfigSource};
use crate::engine::decision::DecisionEngine;
use crate::engine::escalation::EscalationQueue;
use crate::engine::parser::{parse_step_script, parse_step_tags, StepTag};
use crate::engine::retry::RetryHandler;
use crate::engine::state::{write_atomic, StateManager};
use crate::engine::template::{render_template, TemplateMode};
use crate::engine::worktree::WorktreeManager;
use crate::models::{
    AgentActivity, EscalationRequest, ProjectInfo, Step, WorkflowDefinition, WorkflowState,
    WorkflowStatus,
};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Guard against workflow invocation cycles.
const MAX_INVOKE_DEPTH: usize = 10;

#[derive(Debug, Clone)]
pub struct WorkflowEngineConfig {
    /// Expansion of `{project-root}`
    pub project_root: PathBuf,
    /// Auto-approve prompts and skip optional steps
    pub yolo_mode: bool,
    /// Undefined `{{name}}` without default is an error when true, empty
    /// string otherwise
    pub strict_variables: bool,
}

impl WorkflowEngineConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            yolo_mode: false,
            strict_variables: true,
        }
    }
}

/// A definition, its configuration source, and its parsed steps.
struct LoadedWorkflow {
    definition: WorkflowDefinition,
    steps: Vec<Step>,
    /// Path the definition was loaded from, as recorded on the state
    path: String,
}

/// Top-level conductor for declarative workflows.
pub struct WorkflowEngine {
    config: WorkflowEngineConfig,
    state: Arc<StateManager>,
    pool: Arc<AgentPool>,
    decisions: Arc<DecisionEngine>,
    escalations: Arc<EscalationQueue>,
    worktrees: Option<Arc<WorktreeManager>>,
    retry: Arc<RetryHandler>,
    cancel: CancellationToken,
    /// Rendered `<action>`/`<output>` lines, for observability and tests
    action_log: Mutex<Vec<String>>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowEngineConfig,
        state: Arc<StateManager>,
        pool: Arc<AgentPool>,
        decisions: Arc<DecisionEngine>,
        escalations: Arc<EscalationQueue>,
    ) -> Self {
        Self {
            config,
            state,
            pool,
            decisions,
            escalations,
            worktrees: None,
            retry: Arc::new(RetryHandler::default()),
            cancel: CancellationToken::new(),
            action_log: Mutex::new(Vec::new()),
        }
    }

    /// Attach the worktree manager used by isolated-development workflows.
    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    /// Replace the retry handler wrapped around decision calls.
    pub fn with_retry(mut self, retry: Arc<RetryHandler>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn worktrees(&self) -> Option<&Arc<WorktreeManager>> {
        self.worktrees.as_ref()
    }

    /// Rendered action/output lines executed so far.
    pub fn action_log(&self) -> Vec<String> {
        self.action_log.lock().unwrap().clone()
    }

    /// Execute a workflow from its first step with fresh state.
    pub async fn execute_workflow(
        &self,
        workflow_path: impl AsRef<Path>,
        project: ProjectInfo,
    ) -> Result<WorkflowState> {
        let workflow_path = self.config.project_root.join(workflow_path.as_ref());
        let loaded = self.load_workflow(&workflow_path).await?;

        let mut state = WorkflowState::new(project, loaded.path.clone());
        state.variables.extend(loaded.definition.variables.clone());

        self.run(loaded, state, 0).await
    }

    /// Resume a previously-persisted workflow at `currentStep + 1`,
    /// reusing the persisted variables.
    pub async fn resume_from_state(&self, mut state: WorkflowState) -> Result<WorkflowState> {
        let workflow_path = PathBuf::from(&state.current_workflow);
        let loaded = self.load_workflow(&workflow_path).await?;

        // Definition variables are defaults; persisted values win
        for (key, value) in &loaded.definition.variables {
            state.variables.entry(key.clone()).or_insert(value.clone());
        }

        let resume_after = state.current_step;
        info!(
            project = %state.project.id,
            resume_after,
            "resuming workflow"
        );
        self.run(loaded, state, resume_after).await
    }

    async fn run(
        &self,
        loaded: LoadedWorkflow,
        mut state: WorkflowState,
        resume_after: i64,
    ) -> Result<WorkflowState> {
        state.set_status(WorkflowStatus::Running);
        self.checkpoint(&mut state).await?;

        for step in &loaded.steps {
            if i64::from(step.number) <= resume_after {
                continue;
            }
            if self.cancel.is_cancelled() {
                self.checkpoint(&mut state).await?;
                return Err(OrchestratorError::Cancelled(format!(
                    "workflow '{}' cancelled before step {}",
                    loaded.definition.name, step.number
                )));
            }

            if let Some(condition) = &step.condition {
                if !evaluate_condition(condition, &state.variables)? {
                    info!(step = step.number, %condition, "skipping step: condition is false");
                    state.checkpoint_step(step.number);
                    self.checkpoint(&mut state).await?;
                    continue;
                }
            }
            if step.optional && self.config.yolo_mode {
                info!(step = step.number, "skipping optional step in yolo mode");
                state.checkpoint_step(step.number);
                self.checkpoint(&mut state).await?;
                continue;
            }

            debug!(step = step.number, goal = %step.goal, "executing step");
            let started = Instant::now();
            let tags = parse_step_tags(&step.content)?;

            let step_result = self.execute_tags(&tags, &loaded, step, &mut state, 0).await;
            match step_result {
                Ok(()) => {
                    let duration = started.elapsed().as_millis() as u64;
                    state.append_activity(AgentActivity::completed(
                        "orchestrator",
                        "orchestrator",
                        format!("step {}: {}", step.number, step.goal),
                        duration,
                    ));
                    state.checkpoint_step(step.number);
                    self.checkpoint(&mut state).await?;
                }
                Err(OrchestratorError::Cancelled(message)) => {
                    // Durable state keeps whatever status the pause left it
                    // in; a cancelled pause stays `paused`
                    self.checkpoint(&mut state).await?;
                    return Err(OrchestratorError::Cancelled(message));
                }
                Err(error) => {
                    let duration = started.elapsed().as_millis() as u64;
                    state.append_activity(AgentActivity::failed(
                        "orchestrator",
                        "orchestrator",
                        format!("step {}: {}", step.number, step.goal),
                        duration,
                    ));
                    state.set_status(WorkflowStatus::Failed);
                    self.checkpoint(&mut state).await?;
                    return Err(OrchestratorError::WorkflowExecution(format!(
                        "step {} of '{}' failed: {error}",
                        step.number, loaded.definition.name
                    )));
                }
            }
        }

        state.set_status(WorkflowStatus::Completed);
        self.checkpoint(&mut state).await?;
        info!(workflow = %loaded.definition.name, "workflow completed");
        Ok(state)
    }

    /// Persist the state, folding in the pool's cost metrics so the state
    /// files always carry the spend so far.
    async fn checkpoint(&self, state: &mut WorkflowState) -> Result<()> {
        let costs = self.pool.cost_metrics().await;
        if !costs.is_empty() {
            state
                .variables
                .insert("costMetrics".to_string(), json!(costs));
        }
        self.state.save_state(state).await
    }

    fn execute_tags<'a>(
        &'a self,
        tags: &'a [StepTag],
        loaded: &'a LoadedWorkflow,
        step: &'a Step,
        state: &'a mut WorkflowState,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            for tag in tags {
                if self.cancel.is_cancelled() {
                    return Err(OrchestratorError::Cancelled(format!(
                        "cancelled in step {}",
                        step.number
                    )));
                }
                match tag {
                    StepTag::Action(text) => {
                        let rendered = self.render(text, state)?;
                        info!(step = step.number, "action: {rendered}");
                        self.action_log.lock().unwrap().push(rendered);
                    }
                    StepTag::Output(text) => {
                        let rendered = self.render(text, state)?;
                        info!(step = step.number, "output: {rendered}");
                        self.action_log.lock().unwrap().push(rendered);
                    }
                    StepTag::Ask(prompt) | StepTag::ElicitRequired(prompt) => {
                        if self.config.yolo_mode {
                            debug!(step = step.number, "yolo mode: skipping elicitation");
                            continue;
                        }
                        let prompt = self.render(prompt, state)?;
                        self.elicit(&prompt, loaded, step, state).await?;
                    }
                    StepTag::TemplateOutput { file, content } => {
                        if !self.config.yolo_mode {
                            let prompt = format!(
                                "Approve writing the generated document '{file}'?"
                            );
                            self.elicit(&prompt, loaded, step, state).await?;
                        }
                        self.write_template_output(file, content, state).await?;
                    }
                    StepTag::Check { condition, body } => {
                        if evaluate_condition(condition, &state.variables)? {
                            self.execute_tags(body, loaded, step, state, depth).await?;
                        } else {
                            debug!(step = step.number, %condition, "check condition is false");
                        }
                    }
                    StepTag::InvokeWorkflow { path } => {
                        if depth >= MAX_INVOKE_DEPTH {
                            return Err(OrchestratorError::WorkflowExecution(format!(
                                "workflow invocation exceeds depth {MAX_INVOKE_DEPTH}; cycle suspected"
                            )));
                        }
                        let rendered = self.render(path, state)?;
                        self.invoke_nested(&rendered, state, depth + 1).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Ask the decision engine; enqueue an escalation and pause when the
    /// answer lacks confidence.
    async fn elicit(
        &self,
        prompt: &str,
        loaded: &LoadedWorkflow,
        step: &Step,
        state: &mut WorkflowState,
    ) -> Result<()> {
        let mut context = HashMap::new();
        context.insert("workflowId".to_string(), json!(loaded.definition.name));
        context.insert("projectId".to_string(), json!(state.project.id));
        context.insert("step".to_string(), json!(step.number));
        context.insert("goal".to_string(), json!(step.goal));

        // Transient provider failures retry here, inside the tag handler;
        // the step itself is never re-run
        let decision = self
            .retry
            .execute_with_retry("decision", || self.decisions.decide(prompt, &context))
            .await?;

        if !decision.requires_escalation() {
            debug!(
                step = step.number,
                confidence = decision.confidence,
                "autonomous decision accepted"
            );
            state
                .variables
                .insert("last_decision".to_string(), decision.decision.clone());
            return Ok(());
        }

        let escalation_id = self
            .escalations
            .add(EscalationRequest {
                workflow_id: loaded.definition.name.clone(),
                step: step.number,
                question: prompt.to_string(),
                ai_reasoning: decision.reasoning.clone(),
                confidence: decision.confidence,
                context: decision.context.clone(),
            })
            .await?;

        state.set_status(WorkflowStatus::Paused);
        self.checkpoint(state).await?;
        warn!(
            step = step.number,
            escalation = %escalation_id,
            "workflow paused awaiting human response"
        );

        let resolved = self
            .escalations
            .wait_for_resolution(&escalation_id, &self.cancel)
            .await?;

        state.variables.insert(
            "last_escalation_response".to_string(),
            json!(resolved.response),
        );
        state.set_status(WorkflowStatus::Running);
        self.checkpoint(state).await?;
        info!(step = step.number, escalation = %escalation_id, "workflow resumed");
        Ok(())
    }

    /// Render and emit a `<template-output>` artifact under the output
    /// folder (or the project root when none is configured).
    async fn write_template_output(
        &self,
        file: &str,
        content: &str,
        state: &mut WorkflowState,
    ) -> Result<()> {
        let rendered_name = self.render(file, state)?;
        let rendered_content = self.render(content, state)?;

        let base = state
            .variables
            .get("output_folder")
            .and_then(Value::as_str)
            .map(|folder| self.config.project_root.join(folder))
            .unwrap_or_else(|| self.config.project_root.clone());
        let path = base.join(&rendered_name);

        write_atomic(&path, &rendered_content).await?;
        info!(path = %path.display(), "template output written");
        self.action_log
            .lock()
            .unwrap()
            .push(format!("wrote {rendered_name}"));
        Ok(())
    }

    /// Recursively execute another workflow with the current variable
    /// scope. Nested runs persist variables and activities through the same
    /// state manager but never checkpoint step numbers; the parent's
    /// `currentStep` stays authoritative and monotone.
    async fn invoke_nested(
        &self,
        path: &str,
        state: &mut WorkflowState,
        depth: usize,
    ) -> Result<()> {
        let workflow_path = self.config.project_root.join(path);
        let loaded = self.load_workflow(&workflow_path).await?;
        info!(workflow = %loaded.definition.name, depth, "invoking nested workflow");

        for (key, value) in &loaded.definition.variables {
            state.variables.entry(key.clone()).or_insert(value.clone());
        }

        for step in &loaded.steps {
            if let Some(condition) = &step.condition {
                if !evaluate_condition(condition, &state.variables)? {
                    continue;
                }
            }
            if step.optional && self.config.yolo_mode {
                continue;
            }
            let tags = parse_step_tags(&step.content)?;
            self.execute_tags(&tags, &loaded, step, state, depth).await?;
            state.append_activity(AgentActivity::completed(
                "orchestrator",
                "orchestrator",
                format!("{}: step {}: {}", loaded.definition.name, step.number, step.goal),
                0,
            ));
            self.checkpoint(state).await?;
        }
        Ok(())
    }

    fn render(&self, text: &str, state: &WorkflowState) -> Result<String> {
        let mode = if self.config.strict_variables {
            TemplateMode::Strict
        } else {
            TemplateMode::Lenient
        };
        render_template(text, &state.variables, mode)
    }

    /// Load a workflow definition and its step script, resolving
    /// `{project-root}`, `{installed_path}`, `{config_source}:key`
    /// references and the `system-generated` date.
    async fn load_workflow(&self, path: &Path) -> Result<LoadedWorkflow> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            OrchestratorError::WorkflowParse(format!(
                "cannot read workflow definition {}: {e}",
                path.display()
            ))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| {
            OrchestratorError::WorkflowParse(format!(
                "invalid workflow definition {}: {e}",
                path.display()
            ))
        })?;
        let Value::Object(mut raw) = yaml_to_json(yaml) else {
            return Err(OrchestratorError::WorkflowParse(format!(
                "workflow definition {} is not a mapping",
                path.display()
            )));
        };

        let take_string = |raw: &mut serde_json::Map<String, Value>, key: &str| {
            raw.remove(key).map(|v| value_to_display_string(&v))
        };

        let name = take_string(&mut raw, "name").unwrap_or_default();
        let description = take_string(&mut raw, "description");
        let author = take_string(&mut raw, "author");
        let config_source = take_string(&mut raw, "config_source").unwrap_or_default();
        let instructions = take_string(&mut raw, "instructions").unwrap_or_default();
        let output_folder = take_string(&mut raw, "output_folder");
        let installed_path = take_string(&mut raw, "installed_path");
        let date = take_string(&mut raw, "date");

        // Explicit variables block plus any unrecognised keys
        let mut variables: HashMap<String, Value> = HashMap::new();
        if let Some(Value::Object(block)) = raw.remove("variables") {
            variables.extend(block);
        }
        variables.extend(raw);

        let installed_path = installed_path.map(|p| self.expand_path_tokens(&p, None));
        let config_source =
            self.expand_path_tokens(&config_source, installed_path.as_deref());
        let instructions =
            self.expand_path_tokens(&instructions, installed_path.as_deref());
        let output_folder = output_folder
            .map(|f| self.expand_path_tokens(&f, installed_path.as_deref()));

        let date = date.map(|d| {
            if d == crate::models::workflow::SYSTEM_GENERATED {
                Utc::now().format("%Y-%m-%d").to_string()
            } else {
                d
            }
        });

        let mut definition = WorkflowDefinition {
            name,
            description,
            author,
            config_source,
            instructions,
            output_folder,
            installed_path,
            date,
            variables,
        };
        definition.validate()?;

        let config =
            ConfigSource::load(self.config.project_root.join(&definition.config_source)).await?;

        // Resolve {config_source}:key references; unresolved is fatal
        definition.instructions = resolve_config_refs(&definition.instructions, &config)?;
        if let Some(folder) = definition.output_folder.take() {
            definition.output_folder = Some(resolve_config_refs(&folder, &config)?);
        }
        let mut resolved_variables = HashMap::new();
        for (key, value) in std::mem::take(&mut definition.variables) {
            resolved_variables.insert(key, self.resolve_value(value, &config)?);
        }
        definition.variables = resolved_variables;

        // Reserved values visible to templates and conditions
        if let Some(date) = &definition.date {
            definition
                .variables
                .entry("date".to_string())
                .or_insert_with(|| json!(date));
        }
        if let Some(folder) = &definition.output_folder {
            definition
                .variables
                .insert("output_folder".to_string(), json!(folder));
        }

        let script_path = self.config.project_root.join(&definition.instructions);
        let script = tokio::fs::read_to_string(&script_path).await.map_err(|e| {
            OrchestratorError::WorkflowParse(format!(
                "cannot read step script {}: {e}",
                script_path.display()
            ))
        })?;
        let steps = parse_step_script(&script)?;

        Ok(LoadedWorkflow {
            definition,
            steps,
            path: path.display().to_string(),
        })
    }

    fn expand_path_tokens(&self, text: &str, installed_path: Option<&str>) -> String {
        let root = self.config.project_root.display().to_string();
        let mut expanded = text.replace("{project-root}", &root);
        if let Some(installed) = installed_path {
            expanded = expanded.replace("{installed_path}", installed);
        }
        expanded
    }

    fn resolve_value(&self, value: Value, config: &ConfigSource) -> Result<Value> {
        Ok(match value {
            Value::String(s) => {
                let expanded = self.expand_path_tokens(&s, None);
                Value::String(resolve_config_refs(&expanded, config)?)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.resolve_value(item, config))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::new();
                for (key, item) in map {
                    resolved.insert(key, self.resolve_value(item, config)?);
                }
                Value::Object(resolved)
            }
            other => other,
        })
    }
}

/// Replace every `{config_source}:dotted.path` token. A reference that
/// resolves to nothing is a fatal load error.
fn resolve_config_refs(text: &str, config: &ConfigSource) -> Result<String> {
    const MARKER: &str = "{config_source}:";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(found) = rest.find(MARKER) {
        out.push_str(&rest[..found]);
        let after = &rest[found + MARKER.len()..];
        let path_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'))
            .unwrap_or(after.len());
        let dotted = &after[..path_len];
        if dotted.is_empty() {
            return Err(OrchestratorError::Fatal(
                "empty {config_source}: reference".to_string(),
            ));
        }
        let value = config.require(dotted)?;
        out.push_str(&value_to_display_string(value));
        rest = &after[path_len..];
    }
    out.push_str(rest);
    Ok(out)
}
