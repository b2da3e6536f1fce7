//! On-disk layout under the repository root.
//!
//! Everything the core writes lives under `.agentz/`:
//!
//! ```text
//! <repo>/.agentz/
//!   streams/registry.log            global registry stream
//!   streams/sessions/<id>.log       per-session streams
//!   sessions.json                   snapshot
//!   worktrees/<id>/                 per-session worktrees
//!   daemons/<pid>.nonce             liveness side-channel
//! ```

use az_core::SessionId;
use std::path::{Path, PathBuf};

/// Name of the product dot-directory.
pub const DOT_DIR: &str = ".agentz";

/// Branch prefix for session worktrees.
pub const BRANCH_PREFIX: &str = "agentz";

pub fn dot_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(DOT_DIR)
}

pub fn streams_dir(repo_root: &Path) -> PathBuf {
    dot_dir(repo_root).join("streams")
}

pub fn registry_log_path(repo_root: &Path) -> PathBuf {
    streams_dir(repo_root).join("registry.log")
}

pub fn session_log_path(repo_root: &Path, id: &SessionId) -> PathBuf {
    streams_dir(repo_root).join("sessions").join(format!("{id}.log"))
}

pub fn snapshot_path(repo_root: &Path) -> PathBuf {
    dot_dir(repo_root).join("sessions.json")
}

pub fn worktrees_dir(repo_root: &Path) -> PathBuf {
    dot_dir(repo_root).join("worktrees")
}

pub fn worktree_path(repo_root: &Path, key: &str) -> PathBuf {
    worktrees_dir(repo_root).join(key)
}

/// Branch name for a session worktree: `agentz/session-<id>`.
pub fn session_branch(id: &SessionId) -> String {
    format!("{BRANCH_PREFIX}/session-{id}")
}

/// Branch name for a task-shared worktree: `agentz/task-<taskId>`.
pub fn task_branch(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}/task-{task_id}")
}

/// Human-readable per-session activity logs.
pub fn logs_dir(repo_root: &Path) -> PathBuf {
    dot_dir(repo_root).join("logs")
}

pub fn daemons_dir(repo_root: &Path) -> PathBuf {
    dot_dir(repo_root).join("daemons")
}

/// Nonce side-channel file for the daemon liveness probe.
pub fn nonce_path(repo_root: &Path, pid: u32) -> PathBuf {
    daemons_dir(repo_root).join(format!("{pid}.nonce"))
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
