use super::*;
use crate::bus::Notification;
use az_adapters::{FakeAdapter, FakeStep};
use az_core::{FakeClock, OutputChunk, TokenUsage};
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    supervisor: Supervisor<FakeClock>,
    adapter: Arc<FakeAdapter>,
    hooks: Arc<RecordingHooks>,
}

#[derive(Default)]
struct RecordingHooks {
    reviewed: Mutex<Vec<SessionId>>,
}

impl TaskHooks for RecordingHooks {
    fn post_process_task_review(&self, session_id: &SessionId) {
        self.reviewed.lock().push(session_id.clone());
    }
}

fn harness() -> Harness {
    harness_with_cap(3)
}

fn harness_with_cap(cap: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let adapter = Arc::new(FakeAdapter::with_approval_support());
    let hooks = Arc::new(RecordingHooks::default());
    let factory: AdapterFactory = {
        let adapter = Arc::clone(&adapter);
        Arc::new(move |_session: &Session| {
            Ok(Arc::clone(&adapter) as Arc<dyn AgentAdapter>)
        })
    };
    let config = SupervisorConfig::new(dir.path())
        .max_concurrent(cap)
        .worktree_isolation(false);
    let supervisor =
        Supervisor::start_with(config, FakeClock::new(), Arc::clone(&hooks) as Arc<dyn TaskHooks>, factory)
            .unwrap();
    Harness { _dir: dir, supervisor, adapter, hooks }
}

async fn wait_for_status(
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

#[tokio::test]
async fn spawn_without_task_path_runs_to_idle() {
    let h = harness();
    h.adapter.script_simple_completion("hello there");

    let session = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "say hello"))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Pending);
    assert_eq!(session.id.as_str().len(), 12);

    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.output.len(), 1);
    assert_eq!(recovered.output[0].content, "hello there");
    assert_eq!(recovered.tokens, TokenUsage { input: 100, output: 20 });
    assert!(recovered.completed_at_ms.is_none(), "idle is not terminal");
}

#[tokio::test]
async fn spawn_with_task_path_completes_and_fires_review_hook() {
    let h = harness();
    h.adapter.script_simple_completion("done");

    let request = SpawnRequest::new(AgentKind::SdkChat, "review the change")
        .task_path("/tmp/task.md")
        .title("Review: auth flow");
    let session = h.supervisor.spawn(request).await.unwrap();

    wait_for_status(&h.supervisor, &session.id, SessionStatus::Completed).await;

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert!(recovered.completed_at_ms.is_some());
    assert_eq!(h.hooks.reviewed.lock().as_slice(), &[session.id.clone()]);
}

#[tokio::test]
async fn plain_titles_do_not_fire_the_review_hook() {
    let h = harness();
    h.adapter.script_simple_completion("done");

    let request =
        SpawnRequest::new(AgentKind::SdkChat, "implement").task_path("/tmp/task.md");
    let session = h.supervisor.spawn(request).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Completed).await;

    assert!(h.hooks.reviewed.lock().is_empty());
}

#[tokio::test]
async fn adapter_error_fails_the_session() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("partial", 1)),
        FakeStep::Error("backend exploded".into()),
    ]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Failed).await;

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.error.as_deref(), Some("backend exploded"));
    assert!(recovered.completed_at_ms.is_some());
}

#[tokio::test]
async fn invalid_spawns_rejected_synchronously() {
    let h = harness();

    let err = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::InvalidArgument(_)));

    // No session was created
    assert!(h.supervisor.sessions().is_empty());
}

#[tokio::test]
async fn capacity_cap_enforced_and_reclaimed() {
    let h = harness_with_cap(2);
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);

    let a = h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "one")).await.unwrap();
    let _b = h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "two")).await.unwrap();
    wait_for_status(&h.supervisor, &a.id, SessionStatus::Running).await;

    let err = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "three"))
        .await
        .unwrap_err();
    assert!(matches!(err, SpawnError::CapacityReached { running: 2, cap: 2 }));

    // Cancelling one reclaims the slot immediately
    assert!(h.supervisor.cancel(&a.id));
    h.adapter.script_simple_completion("ok");
    let c = h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "four")).await.unwrap();
    wait_for_status(&h.supervisor, &c.id, SessionStatus::Idle).await;
}

#[tokio::test]
async fn cancel_is_idempotent_and_blocks_chunks() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("first", 1)),
        FakeStep::Sleep(Duration::from_secs(60)),
        FakeStep::Chunk(OutputChunk::text("never", 2)),
    ]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Running).await;

    assert!(h.supervisor.cancel(&session.id));
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Cancelled).await;

    // Second cancel on a terminal session is a no-op returning false
    assert!(!h.supervisor.cancel(&session.id));

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert!(recovered.completed_at_ms.is_some());
    assert!(!recovered.output.iter().any(|c| c.content == "never"));
    assert_eq!(h.supervisor.live_count(), 0);
}

#[tokio::test]
async fn cancelled_sessions_are_never_resumable() {
    let h = harness();
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);
    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Running).await;
    h.supervisor.cancel(&session.id);
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Cancelled).await;

    let err = h.supervisor.send_message(&session.id, "more").await.unwrap_err();
    assert!(matches!(err, ControlError::IllegalState(_)));
}

#[tokio::test]
async fn send_message_validation_order() {
    let h = harness();

    // 1. session exists
    let missing = SessionId::new("000000000000");
    assert!(matches!(
        h.supervisor.send_message(&missing, "hi").await,
        Err(ControlError::NotFound(_))
    ));

    // 2. not currently running
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);
    let running =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &running.id, SessionStatus::Running).await;
    assert!(matches!(
        h.supervisor.send_message(&running.id, "hi").await,
        Err(ControlError::IllegalState(_))
    ));
    h.supervisor.cancel(&running.id);

    // 5. trimmed message must be non-empty
    h.adapter.script_simple_completion("ok");
    let idle = h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &idle.id, SessionStatus::Idle).await;
    assert!(matches!(
        h.supervisor.send_message(&idle.id, "   ").await,
        Err(ControlError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn resume_preserves_conversation_and_settles_history() {
    let h = harness();
    h.adapter.script_simple_completion("wrote function foo");

    let session = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "write function foo"))
        .await
        .unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    h.adapter.script_simple_completion("added tests");
    h.supervisor.send_message(&session.id, "add tests").await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    // The adapter saw both prompts in order
    assert_eq!(h.adapter.prompts.lock().as_slice(), &["write function foo", "add tests"]);
    // And its conversation still holds the prior assistant turn
    let messages = h.adapter.messages().unwrap();
    assert!(messages.iter().any(|m| m.content == "wrote function foo"));

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.resume_attempts, 1);
    assert_eq!(recovered.resume_history.len(), 1);
    assert!(recovered.resume_history[0].success);
    assert!(recovered.last_resumed_at_ms.is_some());
    // The follow-up also landed as a user_message chunk
    assert!(recovered
        .output
        .iter()
        .any(|c| c.kind == az_core::ChunkKind::UserMessage && c.content == "add tests"));
}

#[tokio::test]
async fn failed_resume_settles_history_with_error() {
    let h = harness();
    h.adapter.script_simple_completion("first");
    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    h.adapter.script_turn(vec![FakeStep::Error("quota exhausted".into())]);
    h.supervisor.send_message(&session.id, "again").await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Failed).await;

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.resume_attempts, 1);
    assert!(!recovered.resume_history[0].success);
    assert_eq!(recovered.resume_history[0].error.as_deref(), Some("quota exhausted"));
}

#[tokio::test]
async fn approval_round_trip() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::WaitApproval,
        FakeStep::Sleep(Duration::from_secs(2)),
        FakeStep::Chunk(OutputChunk::text("approved work", 1)),
        FakeStep::Complete(TokenUsage::default()),
    ]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::WaitingApproval).await;

    h.supervisor.approve(&session.id, true).await.unwrap();
    assert_eq!(h.adapter.approvals(), vec![true]);
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;
}

#[tokio::test]
async fn approval_straight_after_a_tool_call_is_reachable() {
    // A tool_use chunk flips the session to `working`; a backend that
    // prompts for approval right after (codex emits approval records
    // directly behind command/file items) must still land in
    // `waiting_approval`, not wedge in `working`
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(
            OutputChunk::new(az_core::ChunkKind::ToolUse, "{}", 1).with_meta("tool", "exec_command"),
        ),
        FakeStep::WaitApproval,
        FakeStep::Sleep(Duration::from_secs(2)),
        FakeStep::Chunk(OutputChunk::text("ran it", 2)),
        FakeStep::Complete(TokenUsage::default()),
    ]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::WaitingApproval).await;

    h.supervisor.approve(&session.id, true).await.unwrap();
    assert_eq!(h.adapter.approvals(), vec![true]);
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;
}

#[tokio::test]
async fn approve_outside_waiting_approval_is_illegal() {
    let h = harness();
    h.adapter.script_simple_completion("ok");
    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    let err = h.supervisor.approve(&session.id, true).await.unwrap_err();
    assert!(matches!(err, ControlError::IllegalState(_)));
}

#[tokio::test]
async fn waiting_input_message_feeds_live_turn() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::WaitInput,
        FakeStep::Sleep(Duration::from_secs(2)),
        FakeStep::Complete(TokenUsage::default()),
    ]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::WaitingInput).await;

    h.supervisor.send_message(&session.id, "here is the answer").await.unwrap();
    // Input answers return the session to running without a new turn
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Running).await;
    let messages = h.adapter.messages().unwrap();
    assert!(messages.iter().any(|m| m.content == "here is the answer"));
}

#[tokio::test]
async fn subscriber_sees_lifecycle_in_order() {
    let h = harness();
    let mut subscriber = h.supervisor.subscribe();
    h.adapter.script_simple_completion("hi");

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    let mut statuses = Vec::new();
    let mut chunks = Vec::new();
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_millis(200), subscriber.recv()).await
    {
        match notification {
            Notification::Status { status, .. } => statuses.push(status),
            Notification::Chunk { chunk, .. } => chunks.push(chunk.content),
            Notification::Error { .. } => {}
        }
        if statuses.last() == Some(&SessionStatus::Idle) {
            break;
        }
    }
    assert_eq!(
        statuses,
        vec![SessionStatus::Pending, SessionStatus::Running, SessionStatus::Idle]
    );
    assert_eq!(chunks, vec!["hi".to_string()]);
}

#[tokio::test]
async fn delete_cancels_and_removes_from_snapshot() {
    let h = harness();
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);
    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Running).await;

    assert!(h.supervisor.delete(&session.id).await);
    assert!(h.supervisor.get_session(&session.id).is_none());
    assert!(!h.supervisor.delete(&session.id).await);

    // Stream records remain for audit
    let entries = h.supervisor.registry_entries_after(0).unwrap();
    assert!(!entries.is_empty());
}

#[tokio::test]
async fn duplicate_session_id_rejected() {
    let h = harness();
    h.adapter.script_simple_completion("ok");
    let request = SpawnRequest::new(AgentKind::SdkChat, "go")
        .session_id(SessionId::new("abc123abc123"));
    h.supervisor.spawn(request.clone()).await.unwrap();

    let err = h.supervisor.spawn(request).await.unwrap_err();
    assert!(matches!(err, SpawnError::DuplicateId(_)));
}

#[tokio::test]
async fn backend_session_id_recorded_and_required_for_cli_resume() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::SessionId("native-9".into()),
        FakeStep::Complete(TokenUsage::default()),
    ]);
    let session = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::CliClaude, "go"))
        .await
        .unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    assert_eq!(
        h.supervisor.get_session(&session.id).unwrap().backend_session_id.as_deref(),
        Some("native-9")
    );

    // A CLI session without a backend id cannot resume
    h.adapter.script_turn(vec![FakeStep::Complete(TokenUsage::default())]);
    let bare = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::CliCodex, "go"))
        .await
        .unwrap();
    wait_for_status(&h.supervisor, &bare.id, SessionStatus::Idle).await;
    let err = h.supervisor.send_message(&bare.id, "more").await.unwrap_err();
    assert!(matches!(err, ControlError::IllegalState(_)));
}
