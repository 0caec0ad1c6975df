// Durable workflow state with an in-memory read-through cache

//! # State Manager
//!
//! Per project, two files live under `<base>/bmad/<projectId>/`:
//!
//! - `sprint-status.yaml`: the canonical serialised [`WorkflowState`]
//! - `workflow-status.md`: a human-readable rendering of the same state
//!
//! Both are written atomically (tmp + rename) back-to-back on every save,
//! so they are always mutually consistent and no partial write can survive
//! a crash. Reads go through an in-memory cache keyed by project id.
//!
//! The cache is **not** invalidated when someone edits the files externally;
//! call [`StateManager::clear_cache`] to force a re-read. This mirrors the
//! engine's ownership rule: the workflow engine is the sole writer.

use crate::models::{WorkflowState, WorkflowStatus};
use crate::{OrchestratorError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Write `contents` to `path` atomically via `<path>.tmp` + rename,
/// creating parent directories as needed. Shared by every durable store in
/// the engine.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|e| {
            OrchestratorError::FileWrite(format!("mkdir {}: {e}", parent.display()))
        })?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)
        .await
        .map_err(|e| OrchestratorError::FileWrite(format!("write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| OrchestratorError::FileWrite(format!("rename {} -> {}: {e}", tmp.display(), path.display())))?;
    Ok(())
}

/// Parse a status string, rejecting anything outside the four lifecycle
/// values. Used wherever a status enters the system as text.
pub fn parse_status(raw: &str) -> Result<WorkflowStatus> {
    match raw {
        "running" => Ok(WorkflowStatus::Running),
        "paused" => Ok(WorkflowStatus::Paused),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        other => Err(OrchestratorError::StateManager(format!(
            "status must be one of running, paused, completed, failed (got '{other}')"
        ))),
    }
}

/// Atomic, cached, crash-recoverable workflow state store.
pub struct StateManager {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, WorkflowState>>,
}

impl StateManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        self.base_dir.join("bmad").join(project_id)
    }

    fn yaml_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("sprint-status.yaml")
    }

    fn markdown_path(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("workflow-status.md")
    }

    fn validate(state: &WorkflowState) -> Result<()> {
        if state.project.id.trim().is_empty() {
            return Err(OrchestratorError::StateManager(
                "project.id must be non-empty".to_string(),
            ));
        }
        if state.project.name.trim().is_empty() {
            return Err(OrchestratorError::StateManager(
                "project.name must be non-empty".to_string(),
            ));
        }
        if state.current_step < 0 {
            return Err(OrchestratorError::StateManager(format!(
                "currentStep must be a non-negative number (got {})",
                state.current_step
            )));
        }
        Ok(())
    }

    /// Validate and persist `state`, updating the cache.
    pub async fn save_state(&self, state: &WorkflowState) -> Result<()> {
        Self::validate(state)?;

        let yaml = serde_yaml::to_string(state)?;
        write_atomic(&self.yaml_path(&state.project.id), &yaml).await?;
        write_atomic(
            &self.markdown_path(&state.project.id),
            &render_markdown(state),
        )
        .await?;

        self.cache
            .write()
            .await
            .insert(state.project.id.clone(), state.clone());
        debug!(project = %state.project.id, step = state.current_step, status = %state.status, "state saved");
        Ok(())
    }

    /// Load state for a project. Returns `None` for an unknown project and
    /// (deliberately) for a corrupt state file, which is logged rather
    /// than raised so a damaged file never wedges the orchestrator.
    pub async fn load_state(&self, project_id: &str) -> Result<Option<WorkflowState>> {
        if let Some(cached) = self.cache.read().await.get(project_id) {
            return Ok(Some(cached.clone()));
        }

        let path = self.yaml_path(project_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(OrchestratorError::StateManager(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        match serde_yaml::from_str::<WorkflowState>(&text) {
            Ok(state) => {
                self.cache
                    .write()
                    .await
                    .insert(project_id.to_string(), state.clone());
                Ok(Some(state))
            }
            Err(e) => {
                error!(project = project_id, path = %path.display(), %e, "corrupt state file");
                Ok(None)
            }
        }
    }

    /// Drop every cached entry; subsequent loads re-read from disk.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    /// Classify the project's methodology phase from its current workflow
    /// path.
    pub async fn get_project_phase(&self, project_id: &str) -> Result<String> {
        let Some(state) = self.load_state(project_id).await? else {
            return Ok("Unknown".to_string());
        };
        let workflow = state.current_workflow.as_str();
        let phase = if workflow.contains("product-brief") {
            "Analysis"
        } else if workflow.contains("prd") {
            "Planning"
        } else if workflow.contains("architecture") {
            "Solutioning"
        } else if workflow.contains("dev-story") {
            "Implementation"
        } else {
            "Unknown"
        };
        Ok(phase.to_string())
    }

    /// Story status recorded in the variables map under
    /// `story_<storyId with dots replaced by underscores>`, augmented with
    /// the literal `storyId`. Missing story yields `None`.
    pub async fn get_story_status(
        &self,
        project_id: &str,
        story_id: &str,
    ) -> Result<Option<Value>> {
        let Some(state) = self.load_state(project_id).await? else {
            return Ok(None);
        };
        let key = format!("story_{}", story_id.replace('.', "_"));
        let Some(value) = state.variables.get(&key) else {
            return Ok(None);
        };
        let mut object = match value {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("status".to_string(), other.clone());
                map
            }
        };
        object.insert("storyId".to_string(), Value::String(story_id.to_string()));
        Ok(Some(Value::Object(object)))
    }
}

fn render_markdown(state: &WorkflowState) -> String {
    use std::fmt::Write as _;

    let mut md = String::new();
    let _ = writeln!(md, "# Workflow Status\n");
    let _ = writeln!(md, "## Project\n");
    let _ = writeln!(md, "- **ID**: {}", state.project.id);
    let _ = writeln!(md, "- **Name**: {}", state.project.name);
    if let Some(level) = &state.project.level {
        let _ = writeln!(md, "- **Level**: {level}");
    }
    let _ = writeln!(md, "\n## Status\n");
    let _ = writeln!(md, "{}", state.status);
    let _ = writeln!(md, "\n## Current Workflow\n");
    let _ = writeln!(md, "- **Path**: {}", state.current_workflow);
    let _ = writeln!(md, "- **Step**: {}", state.current_step);
    let _ = writeln!(md, "- **Started**: {}", state.start_time.to_rfc3339());
    let _ = writeln!(md, "- **Updated**: {}", state.last_update.to_rfc3339());

    let _ = writeln!(md, "\n## Agent Activity\n");
    if state.agent_activity.is_empty() {
        let _ = writeln!(md, "_No activity recorded._");
    } else {
        let _ = writeln!(md, "| Agent | Action | Status | Duration (ms) | Timestamp |");
        let _ = writeln!(md, "|-------|--------|--------|---------------|-----------|");
        for activity in &state.agent_activity {
            let _ = writeln!(
                md,
                "| {} | {} | {:?} | {} | {} |",
                activity.agent_name,
                activity.action,
                activity.status,
                activity.duration_ms,
                activity.timestamp.to_rfc3339()
            );
        }
    }

    let _ = writeln!(md, "\n## Variables\n");
    if state.variables.is_empty() {
        let _ = writeln!(md, "_None._");
    } else {
        let _ = writeln!(md, "```yaml");
        if let Ok(yaml) = serde_yaml::to_string(&state.variables) {
            md.push_str(&yaml);
        }
        let _ = writeln!(md, "```");
    }

    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentActivity, ProjectInfo};
    use serde_json::json;

    fn state(project_id: &str) -> WorkflowState {
        let mut state = WorkflowState::new(
            ProjectInfo {
                id: project_id.to_string(),
                name: "Demo Project".to_string(),
                level: Some("2".to_string()),
            },
            "bmad/workflows/prd/workflow.yaml",
        );
        state
            .variables
            .insert("nested".to_string(), json!({"key": "value", "list": [1, 2]}));
        state.append_activity(AgentActivity::completed("a-1", "analyst", "step 1", 42));
        state
    }

    #[tokio::test]
    async fn save_then_load_from_cleared_cache_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let state = state("proj-rt");

        manager.save_state(&state).await.unwrap();
        manager.clear_cache().await;
        let loaded = manager.load_state("proj-rt").await.unwrap().unwrap();
        assert_eq!(loaded, state);

        // Both files exist, no .tmp remains
        let project_dir = dir.path().join("bmad").join("proj-rt");
        assert!(project_dir.join("sprint-status.yaml").is_file());
        assert!(project_dir.join("workflow-status.md").is_file());
        let leftovers: Vec<_> = std::fs::read_dir(&project_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unknown_project_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        assert!(manager.load_state("never-saved").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_yaml_loads_as_none_without_raising() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let project_dir = dir.path().join("bmad").join("proj-x");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("sprint-status.yaml"), "status: [unclosed").unwrap();

        assert!(manager.load_state("proj-x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn negative_current_step_is_rejected_with_message() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let mut bad = state("proj-neg");
        bad.current_step = -1;

        let err = manager.save_state(&bad).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("currentStep must be a non-negative number"));
    }

    #[tokio::test]
    async fn empty_project_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());

        let mut bad = state("proj-id");
        bad.project.id = String::new();
        assert!(manager.save_state(&bad).await.is_err());

        let mut bad = state("proj-name");
        bad.project.name = "  ".to_string();
        assert!(manager.save_state(&bad).await.is_err());
    }

    #[test]
    fn status_strings_outside_the_lifecycle_are_rejected() {
        assert!(parse_status("running").is_ok());
        let err = parse_status("done").unwrap_err();
        assert!(err.to_string().contains("status must be one of"));
    }

    #[tokio::test]
    async fn cache_serves_stale_reads_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let mut s = state("proj-cache");
        manager.save_state(&s).await.unwrap();

        // External edit behind the cache's back
        s.current_step = 9;
        let yaml = serde_yaml::to_string(&s).unwrap();
        std::fs::write(
            dir.path().join("bmad").join("proj-cache").join("sprint-status.yaml"),
            yaml,
        )
        .unwrap();

        let cached = manager.load_state("proj-cache").await.unwrap().unwrap();
        assert_eq!(cached.current_step, 0);

        manager.clear_cache().await;
        let fresh = manager.load_state("proj-cache").await.unwrap().unwrap();
        assert_eq!(fresh.current_step, 9);
    }

    #[tokio::test]
    async fn project_phase_classification() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());

        for (workflow, phase) in [
            ("bmad/workflows/product-brief/workflow.yaml", "Analysis"),
            ("bmad/workflows/prd/workflow.yaml", "Planning"),
            ("bmad/workflows/architecture/workflow.yaml", "Solutioning"),
            ("bmad/workflows/dev-story/workflow.yaml", "Implementation"),
            ("bmad/workflows/custom/workflow.yaml", "Unknown"),
        ] {
            let mut s = state("proj-phase");
            s.current_workflow = workflow.to_string();
            manager.save_state(&s).await.unwrap();
            assert_eq!(manager.get_project_phase("proj-phase").await.unwrap(), phase);
        }

        assert_eq!(manager.get_project_phase("missing").await.unwrap(), "Unknown");
    }

    #[tokio::test]
    async fn story_status_lookup_augments_story_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path());
        let mut s = state("proj-story");
        s.variables.insert(
            "story_1_6".to_string(),
            json!({"status": "in-progress", "assignee": "dev"}),
        );
        manager.save_state(&s).await.unwrap();

        let status = manager
            .get_story_status("proj-story", "1.6")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status["storyId"], "1.6");
        assert_eq!(status["status"], "in-progress");

        assert!(manager
            .get_story_status("proj-story", "9.9")
            .await
            .unwrap()
            .is_none());
    }
}
