//! Worktree isolation laws: spawn→cancel→delete leaves no trace, and
//! isolation degrades gracefully outside a git repo.

use crate::helpers::{git_repo, wait_for_status};
use az_adapters::{AgentAdapter, FakeAdapter, FakeStep};
use az_core::{AgentKind, FakeClock, Session, SessionStatus, SpawnRequest};
use az_engine::{AdapterFactory, NoopHooks, Supervisor, SupervisorConfig};
use std::sync::Arc;

fn supervisor_in(root: &std::path::Path, adapter: &Arc<FakeAdapter>) -> Supervisor<FakeClock> {
    let factory: AdapterFactory = {
        let adapter = Arc::clone(adapter);
        Arc::new(move |_s: &Session| Ok(Arc::clone(&adapter) as Arc<dyn AgentAdapter>))
    };
    Supervisor::start_with(
        SupervisorConfig::new(root),
        FakeClock::new(),
        Arc::new(NoopHooks),
        factory,
    )
    .unwrap()
}

fn branch_list(root: &std::path::Path) -> String {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["branch", "--list"])
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test]
async fn spawn_isolates_in_a_worktree_on_a_session_branch() {
    let repo = git_repo();
    let adapter = Arc::new(FakeAdapter::new());
    let supervisor = supervisor_in(repo.path(), &adapter);
    adapter.script_simple_completion("done");

    let session = supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "work"))
        .await
        .unwrap();
    wait_for_status(&supervisor, &session.id, SessionStatus::Idle).await;

    let recovered = supervisor.get_session(&session.id).unwrap();
    let worktree = recovered.worktree_path.clone().unwrap();
    assert!(worktree.starts_with(repo.path().join(".agentz/worktrees")));
    assert!(worktree.join("README.md").exists());
    assert_eq!(
        recovered.branch.as_deref(),
        Some(format!("agentz/session-{}", session.id).as_str())
    );
    assert!(branch_list(repo.path()).contains(&format!("agentz/session-{}", session.id)));
}

#[tokio::test]
async fn spawn_cancel_delete_leaves_no_worktree_or_branch() {
    let repo = git_repo();
    let adapter = Arc::new(FakeAdapter::new());
    let supervisor = supervisor_in(repo.path(), &adapter);
    adapter.script_turn(vec![FakeStep::HangUntilCancelled]);

    let session = supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "work"))
        .await
        .unwrap();
    wait_for_status(&supervisor, &session.id, SessionStatus::Running).await;
    let worktree = supervisor.get_session(&session.id).unwrap().worktree_path.clone().unwrap();
    assert!(worktree.is_dir());

    assert!(supervisor.cancel(&session.id));
    wait_for_status(&supervisor, &session.id, SessionStatus::Cancelled).await;
    assert!(supervisor.delete(&session.id).await);

    assert!(!worktree.exists(), "worktree removed on delete");
    assert!(
        !branch_list(repo.path()).contains(&format!("agentz/session-{}", session.id)),
        "branch removed on delete"
    );
    assert!(supervisor.get_session(&session.id).is_none());
}

#[tokio::test]
async fn non_git_working_dir_degrades_to_base_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::new());
    let supervisor = supervisor_in(dir.path(), &adapter);
    adapter.script_simple_completion("done");

    // Isolation is on, but the root is not a git repo: the spawn still
    // succeeds and runs in the base directory
    let session = supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "work"))
        .await
        .unwrap();
    wait_for_status(&supervisor, &session.id, SessionStatus::Idle).await;

    let recovered = supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.worktree_path, None);
    assert_eq!(recovered.effective_dir(), &dir.path().to_path_buf());
}

#[tokio::test]
async fn restart_sweeps_orphan_worktrees() {
    let repo = git_repo();
    let adapter = Arc::new(FakeAdapter::new());

    // First process: session with a worktree, then the process "dies"
    // and the session is deleted from the snapshot out-of-band
    let orphan_path = {
        let supervisor = supervisor_in(repo.path(), &adapter);
        adapter.script_simple_completion("done");
        let session = supervisor
            .spawn(SpawnRequest::new(AgentKind::SdkChat, "work"))
            .await
            .unwrap();
        wait_for_status(&supervisor, &session.id, SessionStatus::Idle).await;
        let path = supervisor.get_session(&session.id).unwrap().worktree_path.clone().unwrap();
        // Forget the session but leave the worktree behind
        supervisor.shutdown().await;
        path
    };
    // Wipe persisted state so the worktree is orphaned
    std::fs::remove_file(az_storage::paths::snapshot_path(repo.path())).ok();
    std::fs::remove_file(az_storage::paths::registry_log_path(repo.path())).unwrap();
    assert!(orphan_path.is_dir());

    let supervisor = supervisor_in(repo.path(), &adapter);
    // The sweep runs as a background task at startup
    for _ in 0..200 {
        if !orphan_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!orphan_path.exists(), "orphan worktree swept on startup");
    supervisor.shutdown().await;
}
