//! Worktree manager: git-level isolation per session.
//!
//! Each session gets `<repo>/.agentz/worktrees/<id>` on branch
//! `agentz/session-<id>`. Task-bound sessions sharing a task file share
//! one worktree keyed by the `<!-- taskId: ... -->` marker, so sequential
//! plan/implement/verify passes accumulate on one branch. Git operations
//! on a repo serialize through one mutex per repo root.

use az_core::SessionId;
use az_storage::paths;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Wall-clock bound on any single git invocation.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("not a git repository: {0}")]
    NotARepo(PathBuf),
    #[error("invalid branch name: {0}")]
    InvalidBranch(String),
    #[error("git failed: {0}")]
    Git(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A created (or reused) worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Default)]
pub struct WorktreeManager {
    repo_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_lock(&self, repo_root: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.repo_locks
            .lock()
            .entry(repo_root.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Create the isolated worktree for a session.
    ///
    /// A leftover branch from a previous crash is deleted first.
    pub async fn create_for_session(
        &self,
        repo_root: &Path,
        id: &SessionId,
    ) -> Result<WorktreeHandle, WorktreeError> {
        let branch = paths::session_branch(id);
        self.create(repo_root, id.as_str(), &branch).await
    }

    /// Create or reuse the shared worktree for a task file.
    ///
    /// Falls back to the per-session worktree when the task file carries
    /// no `taskId` marker.
    pub async fn create_for_task(
        &self,
        repo_root: &Path,
        task_path: &Path,
        id: &SessionId,
    ) -> Result<WorktreeHandle, WorktreeError> {
        let task_id = match tokio::fs::read_to_string(task_path).await {
            Ok(content) => extract_task_id(&content),
            Err(_) => None,
        };
        match task_id {
            Some(task_id) => {
                let key = format!("task-{task_id}");
                let branch = paths::task_branch(&task_id);
                let existing = paths::worktree_path(repo_root, &key);
                if existing.is_dir() {
                    return Ok(WorktreeHandle { path: existing, branch });
                }
                self.create(repo_root, &key, &branch).await
            }
            None => self.create_for_session(repo_root, id).await,
        }
    }

    async fn create(
        &self,
        repo_root: &Path,
        key: &str,
        branch: &str,
    ) -> Result<WorktreeHandle, WorktreeError> {
        validate_branch(branch)?;
        if !is_git_repo(repo_root) {
            return Err(WorktreeError::NotARepo(repo_root.to_path_buf()));
        }

        let lock = self.repo_lock(repo_root);
        let _guard = lock.lock().await;

        let path = paths::worktree_path(repo_root, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Leftover branch from a crashed run blocks `worktree add -b`
        if branch_exists(repo_root, branch).await {
            let _ = run_git(repo_root, &["branch", "-D", branch]).await;
        }

        let path_str = path.display().to_string();
        run_git(repo_root, &["worktree", "add", "-b", branch, &path_str, "HEAD"]).await?;
        Ok(WorktreeHandle { path, branch: branch.to_string() })
    }

    /// Remove a worktree and its branch. Best-effort: failures are logged
    /// and the directory is removed regardless.
    pub async fn remove(&self, repo_root: &Path, path: &Path, branch: Option<&str>) {
        let lock = self.repo_lock(repo_root);
        let _guard = lock.lock().await;

        let path_str = path.display().to_string();
        if let Err(e) = run_git(repo_root, &["worktree", "remove", "--force", &path_str]).await {
            tracing::warn!(path = %path.display(), error = %e, "git worktree remove failed; removing directory");
        }
        if path.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(path).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove worktree directory");
            }
        }
        if let Some(branch) = branch {
            if let Err(e) = run_git(repo_root, &["branch", "-D", branch]).await {
                tracing::debug!(branch, error = %e, "branch delete failed");
            }
        }
    }

    /// Delete worktrees under `.agentz/worktrees/` whose key is not in
    /// `known`. Returns how many were removed.
    pub async fn sweep_orphans(&self, repo_root: &Path, known: &HashSet<String>) -> usize {
        let dir = paths::worktrees_dir(repo_root);
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return 0;
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if known.contains(&name) {
                continue;
            }
            let branch = if let Some(task_id) = name.strip_prefix("task-") {
                paths::task_branch(task_id)
            } else {
                paths::session_branch(&SessionId::new(name.clone()))
            };
            tracing::info!(worktree = %name, "removing orphan worktree");
            self.remove(repo_root, &entry.path(), Some(&branch)).await;
            removed += 1;
        }
        removed
    }
}

/// Extract the task id from a `<!-- taskId: ... -->` marker.
pub fn extract_task_id(content: &str) -> Option<String> {
    let start = content.find("<!-- taskId:")?;
    let rest = &content[start + "<!-- taskId:".len()..];
    let end = rest.find("-->")?;
    let id = rest[..end].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Check a branch name against git ref-naming rules.
pub fn validate_branch(name: &str) -> Result<(), WorktreeError> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.ends_with('.')
        || name.ends_with(".lock")
        || name.contains("..")
        || name.contains("//")
        || name.contains("@{")
        || name.contains('\\')
        || name
            .chars()
            .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '['));
    if invalid {
        return Err(WorktreeError::InvalidBranch(name.to_string()));
    }
    Ok(())
}

fn is_git_repo(root: &Path) -> bool {
    root.join(".git").exists()
}

async fn branch_exists(repo_root: &Path, branch: &str) -> bool {
    run_git(repo_root, &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
        .await
        .is_ok()
}

/// Run one git command under the repo, with a timeout.
async fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let mut cmd = tokio::process::Command::new("git");
    cmd.arg("-C")
        .arg(repo_root)
        .args(args)
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .kill_on_drop(true);

    let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output())
        .await
        .map_err(|_| WorktreeError::Git(format!("git {} timed out", args.join(" "))))?
        .map_err(|e| WorktreeError::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorktreeError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
#[path = "worktree_tests.rs"]
mod tests;
