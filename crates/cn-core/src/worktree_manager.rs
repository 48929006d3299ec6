use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::git::{GitOutput, GitRunner, SystemGitRunner, DEFAULT_GIT_TIMEOUT};
use crate::worktree::{
    branch_name, parse_porcelain, worktree_dir_name, WorktreeInfo, WorktreeStatus,
    BRANCH_PREFIX, WORKTREE_DIR_NAME,
};

/// Merges get a longer leash than ordinary git calls.
const MERGE_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Create, track, merge, and clean up git worktrees for parallel batches.
///
/// Worktrees live under `<repo>/.cantina-worktrees/<batch>-<index>/` on
/// branches named `parallel/<batch>/<index>`. The manager holds no state
/// of its own; `git worktree list` is consulted fresh each time.
#[derive(Debug)]
pub struct WorktreeManager {
    project_path: PathBuf,
    worktree_root: PathBuf,
    git: Box<dyn GitRunner>,
}

impl WorktreeManager {
    /// Create a manager for the repository at `project_path`.
    pub fn new(project_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_git_runner(project_path, Box::new(SystemGitRunner))
    }

    /// Create a manager with a custom git runner (for testing).
    pub fn with_git_runner(
        project_path: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
    ) -> Result<Self> {
        let project_path: PathBuf = project_path.into();
        let project_path =
            std::fs::canonicalize(&project_path).unwrap_or(project_path);
        if !project_path.join(".git").exists() {
            return Err(WorktreeManagerError::NotARepository(project_path));
        }
        let worktree_root = project_path.join(WORKTREE_DIR_NAME);
        Ok(Self {
            project_path,
            worktree_root,
            git,
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Run git in `dir`, folding runner failures into a failed output so
    /// callers classify instead of unwinding.
    fn git_in(&self, dir: &Path, args: &[&str], timeout: Duration) -> GitOutput {
        match self.git.run_git(dir, args, timeout) {
            Ok(out) => out,
            Err(e) => GitOutput {
                success: false,
                stdout: String::new(),
                stderr: e,
            },
        }
    }

    fn git(&self, args: &[&str]) -> GitOutput {
        self.git_in(&self.project_path, args, DEFAULT_GIT_TIMEOUT)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a new worktree for a task in a parallel batch, branched
    /// from `base_ref`.
    pub fn create_worktree(
        &self,
        batch_id: &str,
        task_index: u32,
        base_ref: &str,
    ) -> Result<WorktreeInfo> {
        self.ensure_gitignore()?;
        std::fs::create_dir_all(&self.worktree_root)?;

        let branch = branch_name(batch_id, task_index);
        let path = self
            .worktree_root
            .join(worktree_dir_name(batch_id, task_index));
        let path_str = path.to_string_lossy().into_owned();

        info!(
            batch_id,
            task_index,
            branch = %branch,
            path = %path.display(),
            "creating worktree"
        );

        let out = self.git(&["worktree", "add", "-b", &branch, &path_str, base_ref]);
        if !out.success {
            return Err(WorktreeManagerError::GitCommand(format!(
                "failed to create worktree for task {task_index}: {}",
                if out.stderr.is_empty() { out.stdout } else { out.stderr }
            )));
        }

        self.symlink_node_modules(&path);

        Ok(WorktreeInfo {
            path,
            branch,
            task_index: Some(task_index),
            created_at: Utc::now(),
            status: WorktreeStatus::Active,
        })
    }

    /// Add the worktree directory to `.gitignore` exactly once.
    fn ensure_gitignore(&self) -> std::io::Result<()> {
        let gitignore = self.project_path.join(".gitignore");
        let entry = format!("/{WORKTREE_DIR_NAME}/");
        if gitignore.exists() {
            let mut content = std::fs::read_to_string(&gitignore)?;
            if content.contains(WORKTREE_DIR_NAME) {
                return Ok(());
            }
            if !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&entry);
            content.push('\n');
            std::fs::write(&gitignore, content)
        } else {
            std::fs::write(&gitignore, format!("{entry}\n"))
        }
    }

    /// Symlink `node_modules` trees from the main checkout into a fresh
    /// worktree. Worktrees don't include gitignored directories, and
    /// without these links type-check tooling inside the worktree fails.
    fn symlink_node_modules(&self, worktree_path: &Path) {
        // Root-level node_modules.
        let root_nm = self.project_path.join("node_modules");
        if root_nm.is_dir() {
            link_dir(&root_nm, &worktree_path.join("node_modules"));
        }

        // One level deep into subprojects.
        let Ok(entries) = std::fs::read_dir(&self.project_path) else {
            return;
        };
        for entry in entries.flatten() {
            let child = entry.path();
            let name = entry.file_name();
            if !child.is_dir() || name.to_string_lossy().starts_with('.') {
                continue;
            }
            let nm = child.join("node_modules");
            if nm.is_dir() {
                let target = worktree_path.join(&name).join("node_modules");
                if target.parent().is_some_and(Path::exists) {
                    link_dir(&nm, &target);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listing / removal
    // -----------------------------------------------------------------------

    /// List all cantina-managed worktrees, fresh from git.
    pub fn list_worktrees(&self) -> Vec<WorktreeInfo> {
        let out = self.git(&["worktree", "list", "--porcelain"]);
        if !out.success {
            return Vec::new();
        }
        let root = std::fs::canonicalize(&self.worktree_root)
            .unwrap_or_else(|_| self.worktree_root.clone());
        parse_porcelain(&out.stdout, &root)
    }

    /// Remove a single worktree. Returns `(success, message)`.
    pub fn remove_worktree(&self, worktree_path: &Path, force: bool) -> (bool, String) {
        let path_str = worktree_path.to_string_lossy().into_owned();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        let out = self.git(&args);
        if !out.success {
            // Idempotent when the worktree is already gone.
            if !worktree_path.exists() {
                return (true, format!("worktree {} already removed", worktree_path.display()));
            }
            let msg = if out.stderr.is_empty() { out.stdout } else { out.stderr };
            return (
                false,
                if msg.is_empty() {
                    format!("failed to remove worktree {}", worktree_path.display())
                } else {
                    msg
                },
            );
        }
        (true, format!("removed worktree {}", worktree_path.display()))
    }

    /// Remove all worktrees and branches for a batch, prune stale
    /// references, and drop the root directory if it is empty. Returns
    /// the number of worktrees cleaned.
    pub fn cleanup_batch(&self, batch_id: &str) -> usize {
        let prefix = format!("{BRANCH_PREFIX}{batch_id}/");
        let mut cleaned = 0;
        for wt in self.list_worktrees() {
            if wt.branch.starts_with(&prefix) {
                let (ok, msg) = self.remove_worktree(&wt.path, true);
                if ok {
                    self.delete_branch(&wt.branch);
                    cleaned += 1;
                } else {
                    warn!(branch = %wt.branch, %msg, "failed to clean worktree");
                }
            }
        }
        self.git(&["worktree", "prune"]);
        self.try_remove_empty_root();
        cleaned
    }

    /// Remove every cantina-managed worktree and branch. Intended for
    /// startup and for the precondition block of a new batch, so crashes
    /// never leave stale checkouts behind.
    pub fn cleanup_orphans(&self) -> usize {
        let mut cleaned = 0;
        for wt in self.list_worktrees() {
            let (ok, msg) = self.remove_worktree(&wt.path, true);
            if ok {
                self.delete_branch(&wt.branch);
                cleaned += 1;
            } else {
                warn!(branch = %wt.branch, %msg, "failed to clean orphan worktree");
            }
        }
        self.git(&["worktree", "prune"]);
        self.try_remove_empty_root();
        cleaned
    }

    fn try_remove_empty_root(&self) {
        if let Ok(mut entries) = std::fs::read_dir(&self.worktree_root) {
            if entries.next().is_none() {
                let _ = std::fs::remove_dir(&self.worktree_root);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge `branch` into the current branch (or `into` when it is not
    /// `HEAD`). Returns `(success, message, conflict_files)`.
    ///
    /// Conflicted merges are always aborted; the main tree is never
    /// left mid-merge.
    pub fn merge_branch(&self, branch: &str, into: &str) -> (bool, String, Vec<String>) {
        if into != "HEAD" {
            let out = self.git(&["checkout", into]);
            if !out.success {
                return (
                    false,
                    format!("failed to checkout {into}: {}", out.stderr),
                    Vec::new(),
                );
            }
        }

        let out = self.git_in(
            &self.project_path,
            &["merge", "--no-ff", branch],
            MERGE_TIMEOUT,
        );
        if out.success {
            return (true, format!("merged {branch} successfully"), Vec::new());
        }

        let conflicts: Vec<String> = self
            .git(&["diff", "--name-only", "--diff-filter=U"])
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();

        if !conflicts.is_empty() {
            let abort = self.git(&["merge", "--abort"]);
            if !abort.success {
                warn!(branch, stderr = %abort.stderr, "merge --abort failed");
            }
            return (
                false,
                format!("merge conflicts in {} file(s)", conflicts.len()),
                conflicts,
            );
        }

        let msg = if out.stdout.is_empty() { out.stderr } else { out.stdout };
        (
            false,
            if msg.is_empty() { "merge failed".into() } else { msg },
            Vec::new(),
        )
    }

    /// Delete a local branch.
    pub fn delete_branch(&self, branch: &str) -> bool {
        self.git(&["branch", "-D", branch]).success
    }

    // -----------------------------------------------------------------------
    // Working tree state
    // -----------------------------------------------------------------------

    /// Whether the working tree has no uncommitted tracked changes.
    /// Untracked files are ignored; they don't affect worktree ops.
    pub fn is_working_tree_clean(&self) -> bool {
        let out = self.git(&["status", "--porcelain", "--untracked-files=no"]);
        out.success && out.stdout.lines().all(|l| l.trim().is_empty())
    }

    /// Dirty tracked files (modified, staged, deleted).
    pub fn get_dirty_files(&self) -> Vec<String> {
        let out = self.git(&["status", "--porcelain", "--untracked-files=no"]);
        if !out.success {
            return Vec::new();
        }
        out.stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            // Porcelain format is "XY filename".
            .map(|l| l.get(3..).unwrap_or(l).trim().to_string())
            .collect()
    }

    /// Stage all changes including untracked files.
    pub fn stage_all(&self) -> bool {
        self.git(&["add", "-A"]).success
    }

    /// Stage specific files by path.
    pub fn stage_files(&self, paths: &[String]) -> bool {
        if paths.is_empty() {
            return true;
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.git(&args).success
    }

    /// Commit staged changes. Returns `(success, sha_or_error)`.
    pub fn commit(&self, message: &str) -> (bool, String) {
        let out = self.git(&["commit", "-m", message]);
        if !out.success {
            return (false, "nothing to commit or commit failed".into());
        }
        (true, self.head_sha())
    }

    /// Commit even when nothing is staged (batch boundary markers).
    pub fn commit_allow_empty(&self, message: &str) -> (bool, String) {
        let out = self.git(&["commit", "--allow-empty", "-m", message]);
        if !out.success {
            return (false, if out.stderr.is_empty() { "commit failed".into() } else { out.stderr });
        }
        (true, self.head_sha())
    }

    /// Current branch name, `"unknown"` when it cannot be determined.
    pub fn current_branch(&self) -> String {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]);
        if out.stdout.is_empty() {
            "unknown".into()
        } else {
            out.stdout
        }
    }

    /// Current HEAD commit sha.
    pub fn head_sha(&self) -> String {
        self.git(&["rev-parse", "HEAD"]).stdout
    }

    /// Estimate disk usage in bytes for `task_count` worktrees. Worktrees
    /// share the object store, so only working-tree bytes count.
    pub fn estimate_disk_usage(&self, task_count: u64) -> u64 {
        let out = self.git(&["ls-files", "-z", "--cached"]);
        if !out.success {
            return 0;
        }
        let total: u64 = out
            .stdout
            .split('\0')
            .filter(|f| !f.is_empty())
            .filter_map(|f| std::fs::metadata(self.project_path.join(f)).ok())
            .map(|m| m.len())
            .sum();
        total * task_count
    }

    // -----------------------------------------------------------------------
    // Commit-before-remove
    // -----------------------------------------------------------------------

    /// Commit everything an agent produced inside a worktree.
    ///
    /// `git worktree remove` silently discards uncommitted changes, so
    /// this MUST run before removal or agent work is lost. Returns
    /// `true` when a commit was created, `false` when the agent wrote
    /// nothing; which is not an error.
    pub fn commit_worktree_changes(&self, worktree_path: &Path, batch_id: &str) -> bool {
        let add = self.git_in(worktree_path, &["add", "-A"], DEFAULT_GIT_TIMEOUT);
        if !add.success {
            warn!(path = %worktree_path.display(), stderr = %add.stderr, "git add failed in worktree");
            return false;
        }

        let status = self.git_in(
            worktree_path,
            &["status", "--porcelain"],
            DEFAULT_GIT_TIMEOUT,
        );
        if status.stdout.lines().all(|l| l.trim().is_empty()) {
            debug!(path = %worktree_path.display(), "no agent changes to commit");
            return false;
        }

        let message = format!("Agent work for batch {batch_id}");
        let commit = self.git_in(
            worktree_path,
            &["commit", "-m", &message],
            DEFAULT_GIT_TIMEOUT,
        );
        if !commit.success {
            warn!(path = %worktree_path.display(), stderr = %commit.stderr, "worktree commit failed");
            return false;
        }
        info!(path = %worktree_path.display(), batch_id, "committed agent work");
        true
    }
}

#[cfg(unix)]
fn link_dir(source: &Path, target: &Path) {
    if !target.exists() {
        let _ = std::os::unix::fs::symlink(source, target);
    }
}

#[cfg(not(unix))]
fn link_dir(_source: &Path, _target: &Path) {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
