//! Supervisor configuration.

use std::path::PathBuf;

/// Default concurrency cap on live backends.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Anchor for `.agentz/` state (streams, snapshot, worktrees) and the
    /// default working dir for spawn requests.
    pub root: PathBuf,
    /// Concurrency cap counted over live adapter turns in this process.
    pub max_concurrent: usize,
    /// Per-session worktree isolation; `DISABLE_WORKTREE_ISOLATION=true`
    /// turns it off.
    pub worktree_isolation: bool,
    /// Stream publish batching (1 = publish immediately, the real-time
    /// default).
    pub buffer_size: usize,
}

impl SupervisorConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let isolation_disabled = std::env::var("DISABLE_WORKTREE_ISOLATION")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            root: root.into(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            worktree_isolation: !isolation_disabled,
            buffer_size: 1,
        }
    }

    az_core::setters! {
        set {
            max_concurrent: usize,
            worktree_isolation: bool,
            buffer_size: usize,
        }
    }
}

/// Tracing env-filter directive for the embedding binary: `DEBUG=true`
/// turns on verbose logging.
pub fn log_filter() -> &'static str {
    let debug = std::env::var("DEBUG").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false);
    if debug {
        "debug"
    } else {
        "info"
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
