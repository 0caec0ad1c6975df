// Isolated per-story git worktrees

//! # Worktree Manager
//!
//! One isolated working copy per story, so stories develop in parallel
//! without touching each other's files:
//!
//! - path: `<projectRoot>/wt/story-<X>-<Y>`
//! - branch: `story/<X>-<Y>` cut from the configured base branch
//! - registry: `<projectRoot>/.bmad/worktrees.json`, written atomically
//!
//! [`WorktreeManager::initialize`] fails fast outside a git repository,
//! loads the registry (tolerating a missing or corrupt file), then syncs it
//! against `git worktree list --porcelain`: entries whose directory is gone
//! are dropped, and unmanaged worktrees under `wt/story-*` are adopted.
//!
//! Git runs through the CLI; any non-zero exit is an error. Create and
//! destroy are safe to call concurrently for distinct stories; registry
//! writes serialise behind the manager's lock.

use crate::engine::state::write_atomic;
use crate::models::{Worktree, WorktreeRegistryFile, WorktreeStatus};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorktreeManagerConfig {
    pub project_root: PathBuf,
    /// Branch new story branches are cut from
    pub base_branch: String,
}

impl WorktreeManagerConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            base_branch: "main".to_string(),
        }
    }
}

/// Lifecycle manager for per-story worktrees.
pub struct WorktreeManager {
    config: WorktreeManagerConfig,
    registry: RwLock<HashMap<String, Worktree>>,
}

impl WorktreeManager {
    pub fn new(config: WorktreeManagerConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(HashMap::new()),
        }
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.config.project_root.join("wt")
    }

    fn registry_path(&self) -> PathBuf {
        self.config.project_root.join(".bmad").join("worktrees.json")
    }

    fn story_path(&self, story_id: &str) -> PathBuf {
        self.worktrees_dir().join(format!("story-{story_id}"))
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.config.project_root)
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::Internal(anyhow::anyhow!("failed to run git: {e}"))
            })?;
        if !output.status.success() {
            return Err(OrchestratorError::Worktree(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Fail fast outside a git repository, prepare `wt/`, load the
    /// registry, and reconcile it against the worktrees git actually knows.
    pub async fn initialize(&self) -> Result<()> {
        self.git(&["rev-parse", "--git-dir"]).await.map_err(|_| {
            OrchestratorError::Worktree(format!(
                "{} is not a git repository",
                self.config.project_root.display()
            ))
        })?;

        tokio::fs::create_dir_all(self.worktrees_dir())
            .await
            .map_err(|e| {
                OrchestratorError::FileWrite(format!(
                    "mkdir {}: {e}",
                    self.worktrees_dir().display()
                ))
            })?;

        let mut loaded: HashMap<String, Worktree> = HashMap::new();
        match tokio::fs::read_to_string(self.registry_path()).await {
            Ok(text) => match serde_json::from_str::<WorktreeRegistryFile>(&text) {
                Ok(file) => {
                    for worktree in file.worktrees {
                        loaded.insert(worktree.story_id.clone(), worktree);
                    }
                }
                Err(e) => {
                    warn!(%e, "worktree registry is corrupt; starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(%e, "worktree registry is unreadable; starting empty");
            }
        }

        // Reconcile with git's view of the world
        let porcelain = self.git(&["worktree", "list", "--porcelain"]).await?;
        let actual: Vec<PathBuf> = porcelain
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect();

        loaded.retain(|story_id, worktree| {
            let present = worktree.path.exists();
            if !present {
                info!(story = %story_id, "dropping registry entry for removed worktree");
            }
            present
        });

        let wt_dir = self.worktrees_dir();
        let wt_canonical = wt_dir.canonicalize().ok();
        for path in &actual {
            let parent = path.parent();
            let under_wt = parent == Some(wt_dir.as_path())
                || (wt_canonical.is_some() && parent == wt_canonical.as_deref());
            if !under_wt {
                continue;
            }
            let Some(story_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("story-"))
            else {
                continue;
            };
            if !is_valid_story_id(story_id) || loaded.contains_key(story_id) {
                continue;
            }
            info!(story = story_id, "adopting unmanaged worktree");
            loaded.insert(
                story_id.to_string(),
                Worktree {
                    story_id: story_id.to_string(),
                    path: path.clone(),
                    branch: format!("story/{story_id}"),
                    base_branch: self.config.base_branch.clone(),
                    status: WorktreeStatus::Active,
                    created_at: Utc::now(),
                },
            );
        }

        let mut registry = self.registry.write().await;
        *registry = loaded;
        self.persist(&registry).await?;
        debug!(count = registry.len(), "worktree registry initialized");
        Ok(())
    }

    /// Create a worktree for `story_id` on a new `story/<id>` branch.
    pub async fn create_worktree(
        &self,
        story_id: &str,
        base_branch: Option<&str>,
    ) -> Result<Worktree> {
        if !is_valid_story_id(story_id) {
            return Err(OrchestratorError::Worktree(format!(
                "invalid story id '{story_id}': expected <digits>-<digits>"
            )));
        }

        let path = self.story_path(story_id);
        let worktree = Worktree {
            story_id: story_id.to_string(),
            path: path.clone(),
            branch: format!("story/{story_id}"),
            base_branch: base_branch.unwrap_or(&self.config.base_branch).to_string(),
            status: WorktreeStatus::Active,
            created_at: Utc::now(),
        };

        // Reserve the id first so concurrent creates for the same story
        // conflict here instead of inside git
        {
            let mut registry = self.registry.write().await;
            if registry.contains_key(story_id) {
                return Err(OrchestratorError::WorktreeExists(story_id.to_string()));
            }
            registry.insert(story_id.to_string(), worktree.clone());
        }

        let path_str = path.to_string_lossy().into_owned();
        let add = self
            .git(&[
                "worktree",
                "add",
                "-b",
                &worktree.branch,
                &path_str,
                &worktree.base_branch,
            ])
            .await;

        match add {
            Ok(_) => {
                let registry = self.registry.write().await;
                self.persist(&registry).await?;
                info!(story = story_id, path = %path.display(), "worktree created");
                Ok(worktree)
            }
            Err(e) => {
                self.registry.write().await.remove(story_id);
                Err(e)
            }
        }
    }

    /// Push the story branch to origin and mark the worktree `pr-created`.
    pub async fn push_branch(&self, story_id: &str) -> Result<Worktree> {
        let branch = {
            let registry = self.registry.read().await;
            registry
                .get(story_id)
                .ok_or_else(|| OrchestratorError::WorktreeNotFound(story_id.to_string()))?
                .branch
                .clone()
        };

        self.git(&["push", "-u", "origin", &branch]).await?;

        let mut registry = self.registry.write().await;
        let worktree = registry
            .get_mut(story_id)
            .ok_or_else(|| OrchestratorError::WorktreeNotFound(story_id.to_string()))?;
        worktree.status = WorktreeStatus::PrCreated;
        let updated = worktree.clone();
        self.persist(&registry).await?;
        info!(story = story_id, branch = %updated.branch, "branch pushed");
        Ok(updated)
    }

    /// Remove the worktree and its branch. The directory may already be
    /// gone (removed externally); that is tolerated with a warning. A
    /// missing registry entry raises `WorktreeNotFound`.
    pub async fn destroy_worktree(&self, story_id: &str) -> Result<()> {
        let worktree = {
            let registry = self.registry.read().await;
            registry
                .get(story_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::WorktreeNotFound(story_id.to_string()))?
        };

        let path_str = worktree.path.to_string_lossy().into_owned();
        if let Err(e) = self
            .git(&["worktree", "remove", "--force", &path_str])
            .await
        {
            warn!(story = story_id, %e, "git worktree remove failed; continuing");
        }
        if let Err(e) = self.git(&["branch", "-D", &worktree.branch]).await {
            warn!(story = story_id, %e, "git branch -D failed; continuing");
        }

        let mut registry = self.registry.write().await;
        registry.remove(story_id);
        self.persist(&registry).await?;
        info!(story = story_id, "worktree destroyed");
        Ok(())
    }

    /// Worktrees still in flight (`active` or `pr-created`), oldest first.
    pub async fn list_active_worktrees(&self) -> Vec<Worktree> {
        let registry = self.registry.read().await;
        let mut active: Vec<Worktree> = registry
            .values()
            .filter(|w| w.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|w| w.created_at);
        active
    }

    pub async fn get_worktree(&self, story_id: &str) -> Option<Worktree> {
        self.registry.read().await.get(story_id).cloned()
    }

    async fn persist(&self, registry: &HashMap<String, Worktree>) -> Result<()> {
        let mut worktrees: Vec<Worktree> = registry.values().cloned().collect();
        worktrees.sort_by(|a, b| a.story_id.cmp(&b.story_id));
        let file = WorktreeRegistryFile {
            worktrees,
            last_sync: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        write_atomic(&self.registry_path(), &json).await
    }
}

/// `<digits>-<digits>`
fn is_valid_story_id(story_id: &str) -> bool {
    match story_id.split_once('-') {
        Some((epic, story)) => {
            !epic.is_empty()
                && !story.is_empty()
                && epic.chars().all(|c| c.is_ascii_digit())
                && story.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed in {}", dir.display());
    }

    /// A repo with one commit on `main`.
    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        run_git(dir.path(), &["init", "--quiet"]);
        run_git(dir.path(), &["config", "user.email", "ci@example.com"]);
        run_git(dir.path(), &["config", "user.name", "CI"]);
        run_git(dir.path(), &["checkout", "-q", "-b", "main"]);
        std::fs::write(dir.path().join("README.md"), "# demo\n").unwrap();
        run_git(dir.path(), &["add", "."]);
        run_git(dir.path(), &["commit", "-q", "-m", "initial"]);
        dir
    }

    async fn manager_for(dir: &Path) -> WorktreeManager {
        let manager = WorktreeManager::new(WorktreeManagerConfig::new(dir));
        manager.initialize().await.unwrap();
        manager
    }

    #[test]
    fn story_id_validation() {
        assert!(is_valid_story_id("1-6"));
        assert!(is_valid_story_id("12-345"));
        assert!(!is_valid_story_id("1"));
        assert!(!is_valid_story_id("a-6"));
        assert!(!is_valid_story_id("1-"));
        assert!(!is_valid_story_id("-6"));
        assert!(!is_valid_story_id("1-6-2"));
    }

    #[tokio::test]
    async fn initialize_fails_outside_a_git_repository() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(WorktreeManagerConfig::new(dir.path()));
        let err = manager.initialize().await.unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[tokio::test]
    async fn worktree_roundtrip() {
        let repo = init_repo();
        let manager = manager_for(repo.path()).await;

        let worktree = manager.create_worktree("1-6", None).await.unwrap();
        assert_eq!(worktree.branch, "story/1-6");
        assert!(worktree.path.ends_with("wt/story-1-6"));
        assert!(worktree.path.is_dir());

        // Branch exists
        let branch = std::process::Command::new("git")
            .args(["rev-parse", "--verify", "story/1-6"])
            .current_dir(repo.path())
            .status()
            .unwrap();
        assert!(branch.success());

        // Registry file lists exactly one entry
        let registry: WorktreeRegistryFile = serde_json::from_str(
            &std::fs::read_to_string(repo.path().join(".bmad").join("worktrees.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(registry.worktrees.len(), 1);
        assert_eq!(registry.worktrees[0].story_id, "1-6");

        manager.destroy_worktree("1-6").await.unwrap();
        assert!(!repo.path().join("wt").join("story-1-6").exists());
        let branch = std::process::Command::new("git")
            .args(["rev-parse", "--verify", "story/1-6"])
            .current_dir(repo.path())
            .status()
            .unwrap();
        assert!(!branch.success());

        let err = manager.destroy_worktree("1-6").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorktreeNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_creation_is_rejected() {
        let repo = init_repo();
        let manager = manager_for(repo.path()).await;

        manager.create_worktree("2-1", None).await.unwrap();
        let err = manager.create_worktree("2-1", None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::WorktreeExists(_)));
    }

    #[tokio::test]
    async fn invalid_story_ids_never_reach_git() {
        let repo = init_repo();
        let manager = manager_for(repo.path()).await;
        for bad in ["abc", "1_2", "x-y", ""] {
            let err = manager.create_worktree(bad, None).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Worktree(_)));
        }
    }

    #[tokio::test]
    async fn initialize_adopts_unmanaged_and_drops_stale_entries() {
        let repo = init_repo();

        // Unmanaged worktree created directly with git
        run_git(
            repo.path(),
            &["worktree", "add", "-b", "story/3-2", "wt/story-3-2", "main"],
        );

        // Stale registry entry pointing at a directory that never existed
        let stale = WorktreeRegistryFile {
            worktrees: vec![Worktree {
                story_id: "9-9".to_string(),
                path: repo.path().join("wt").join("story-9-9"),
                branch: "story/9-9".to_string(),
                base_branch: "main".to_string(),
                status: WorktreeStatus::Active,
                created_at: Utc::now(),
            }],
            last_sync: Utc::now(),
        };
        std::fs::create_dir_all(repo.path().join(".bmad")).unwrap();
        std::fs::write(
            repo.path().join(".bmad").join("worktrees.json"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let manager = manager_for(repo.path()).await;
        let active = manager.list_active_worktrees().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].story_id, "3-2");
    }

    #[tokio::test]
    async fn corrupt_registry_starts_empty() {
        let repo = init_repo();
        std::fs::create_dir_all(repo.path().join(".bmad")).unwrap();
        std::fs::write(repo.path().join(".bmad").join("worktrees.json"), "{broken").unwrap();

        let manager = manager_for(repo.path()).await;
        assert!(manager.list_active_worktrees().await.is_empty());
    }

    #[tokio::test]
    async fn push_branch_marks_pr_created() {
        let repo = init_repo();

        // A bare repository standing in for origin
        let origin = tempfile::tempdir().unwrap();
        run_git(origin.path(), &["init", "--bare", "--quiet"]);
        let origin_path = origin.path().to_string_lossy().into_owned();
        run_git(repo.path(), &["remote", "add", "origin", &origin_path]);

        let manager = manager_for(repo.path()).await;
        manager.create_worktree("4-1", None).await.unwrap();
        let pushed = manager.push_branch("4-1").await.unwrap();
        assert_eq!(pushed.status, WorktreeStatus::PrCreated);

        let active = manager.list_active_worktrees().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, WorktreeStatus::PrCreated);

        assert!(matches!(
            manager.push_branch("8-8").await.unwrap_err(),
            OrchestratorError::WorktreeNotFound(_)
        ));
    }

    #[tokio::test]
    async fn destroy_tolerates_externally_removed_directory() {
        let repo = init_repo();
        let manager = manager_for(repo.path()).await;

        let worktree = manager.create_worktree("5-5", None).await.unwrap();
        std::fs::remove_dir_all(&worktree.path).unwrap();

        manager.destroy_worktree("5-5").await.unwrap();
        assert!(manager.get_worktree("5-5").await.is_none());
    }

    #[tokio::test]
    async fn active_listing_is_sorted_by_creation_time() {
        let repo = init_repo();
        let manager = manager_for(repo.path()).await;

        manager.create_worktree("1-1", None).await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        manager.create_worktree("1-2", None).await.unwrap();

        let active = manager.list_active_worktrees().await;
        let ids: Vec<&str> = active.iter().map(|w| w.story_id.as_str()).collect();
        assert_eq!(ids, vec!["1-1", "1-2"]);
    }
}
