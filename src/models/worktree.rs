// Per-story worktree records and the registry file shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorktreeStatus {
    Active,
    PrCreated,
    Merged,
}

/// One isolated working copy, dedicated to a single story.
///
/// Invariants maintained by the worktree manager: `branch` is
/// `story/<story_id>` and `path` ends with `wt/story-<story_id>` under the
/// project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worktree {
    /// `<digits>-<digits>`, e.g. `1-6`
    pub story_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub created_at: DateTime<Utc>,
}

impl Worktree {
    /// True for entries a developer is still expected to act on.
    pub fn is_active(&self) -> bool {
        matches!(self.status, WorktreeStatus::Active | WorktreeStatus::PrCreated)
    }
}

/// On-disk shape of `.bmad/worktrees.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeRegistryFile {
    pub worktrees: Vec<Worktree>,
    pub last_sync: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WorktreeStatus::PrCreated).unwrap(),
            "\"pr-created\""
        );
        assert_eq!(
            serde_json::from_str::<WorktreeStatus>("\"merged\"").unwrap(),
            WorktreeStatus::Merged
        );
    }

    #[test]
    fn merged_worktrees_are_not_active() {
        let wt = Worktree {
            story_id: "1-2".to_string(),
            path: PathBuf::from("/repo/wt/story-1-2"),
            branch: "story/1-2".to_string(),
            base_branch: "main".to_string(),
            status: WorktreeStatus::Merged,
            created_at: Utc::now(),
        };
        assert!(!wt.is_active());
    }
}
