use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory under the repository root holding all managed worktrees.
pub const WORKTREE_DIR_NAME: &str = ".cantina-worktrees";

/// Branch namespace for parallel batches.
pub const BRANCH_PREFIX: &str = "parallel/";

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeStatus {
    Active,
    Merged,
    Failed,
    Cleaned,
}

/// Metadata for a single managed git worktree.
///
/// Git itself is the source of truth; these records are derived from
/// `git worktree list --porcelain` or returned fresh from creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    /// Parsed from the branch suffix; `None` when the suffix is not a
    /// task index (still a managed worktree, still cleaned up).
    pub task_index: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub status: WorktreeStatus,
}

/// Branch name for one task of one batch: `parallel/<batch>/<index>`.
pub fn branch_name(batch_id: &str, task_index: u32) -> String {
    format!("{BRANCH_PREFIX}{batch_id}/{task_index}")
}

/// Directory name for one task's worktree: `<batch>-<index>`.
pub fn worktree_dir_name(batch_id: &str, task_index: u32) -> String {
    format!("{batch_id}-{task_index}")
}

/// Parse `git worktree list --porcelain` output, keeping only entries
/// whose path lives under `root` and whose branch is in the parallel
/// namespace.
///
/// Porcelain entries are blank-line separated, but the final entry may
/// not be followed by one, so the last pending entry is flushed at EOF.
pub fn parse_porcelain(output: &str, root: &Path) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch: Option<String> = None;

    let mut flush = |path: &mut Option<PathBuf>, branch: &mut Option<String>| {
        if let (Some(p), Some(b)) = (path.take(), branch.take()) {
            if b.starts_with(BRANCH_PREFIX) && p.starts_with(root) {
                let task_index = b.rsplit('/').next().and_then(|s| s.parse().ok());
                worktrees.push(WorktreeInfo {
                    path: p,
                    branch: b,
                    task_index,
                    created_at: Utc::now(),
                    status: WorktreeStatus::Active,
                });
            }
        }
    };

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            flush(&mut current_path, &mut current_branch);
            current_path = Some(PathBuf::from(path));
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            current_branch = Some(branch.to_string());
        } else if line.is_empty() {
            flush(&mut current_path, &mut current_branch);
        }
    }
    flush(&mut current_path, &mut current_branch);

    worktrees
}
