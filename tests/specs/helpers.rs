//! Shared fixtures for the end-to-end scenarios.

use az_adapters::{AgentAdapter, FakeAdapter};
use az_core::{FakeClock, Session, SessionId, SessionStatus};
use az_engine::{AdapterFactory, NoopHooks, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub supervisor: Supervisor<FakeClock>,
    pub adapter: Arc<FakeAdapter>,
}

/// Supervisor over a temp dir with a scripted fake backend.
pub fn harness_with(configure: impl FnOnce(SupervisorConfig) -> SupervisorConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::with_approval_support());
    let factory: AdapterFactory = {
        let adapter = Arc::clone(&adapter);
        Arc::new(move |_session: &Session| Ok(Arc::clone(&adapter) as Arc<dyn AgentAdapter>))
    };
    let config = configure(SupervisorConfig::new(dir.path()).worktree_isolation(false));
    let supervisor =
        Supervisor::start_with(config, FakeClock::new(), Arc::new(NoopHooks), factory).unwrap();
    Harness { dir, supervisor, adapter }
}

pub fn harness() -> Harness {
    harness_with(|config| config)
}

pub async fn wait_for_status(
    supervisor: &Supervisor<FakeClock>,
    id: &SessionId,
    status: SessionStatus,
) {
    for _ in 0..600 {
        if supervisor.get_session(id).map(|s| s.status) == Some(status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "session {id} never reached {status}; currently {:?}",
        supervisor.get_session(id).map(|s| s.status)
    );
}

/// A throwaway git repo with one commit.
pub fn git_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(args)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    };
    run(&["init", "-q", "-b", "main"]);
    std::fs::write(dir.path().join("README.md"), "hello").unwrap();
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "init"]);
    dir
}
