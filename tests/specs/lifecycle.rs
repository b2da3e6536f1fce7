//! Scenarios 1–3: spawn+complete, cancel-while-running, resume.

use crate::helpers::{harness, wait_for_status};
use az_adapters::{AgentAdapter, FakeStep};
use az_core::{
    AgentKind, OutputChunk, RegistryEvent, SessionEvent, SessionStatus, SpawnRequest, TokenUsage,
};
use az_storage::{paths, SessionLog};
use std::time::Duration;

#[tokio::test]
async fn scenario_1_basic_spawn_and_complete() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("hello", 1)),
        FakeStep::Complete(TokenUsage { input: 10, output: 2 }),
    ]);

    let session = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::CliClaude, "print hello"))
        .await
        .unwrap();
    assert_eq!(session.status, SessionStatus::Pending);

    // No task path: the natural stopping point is idle
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Idle).await;

    // Registry stream: created, then running, then idle
    let registry = h.supervisor.registry_entries_after(0).unwrap();
    let kinds: Vec<String> = registry
        .iter()
        .map(|r| match &r.event {
            RegistryEvent::Created { .. } => "created".to_string(),
            RegistryEvent::Updated { patch, .. } => patch
                .status
                .map(|s| format!("status:{s}"))
                .unwrap_or_else(|| "updated".to_string()),
            RegistryEvent::Completed { .. } => "completed".to_string(),
            RegistryEvent::Failed { .. } => "failed".to_string(),
            RegistryEvent::Cancelled { .. } => "cancelled".to_string(),
            RegistryEvent::Custom => "custom".to_string(),
        })
        .collect();
    assert_eq!(kinds[0], "created");
    assert!(kinds.contains(&"status:running".to_string()));
    assert!(kinds.contains(&"status:idle".to_string()));

    // Session stream: at least one text output record
    let log = SessionLog::open(paths::session_log_path(h.dir.path(), &session.id)).unwrap();
    let records = log.entries_after(0).unwrap();
    assert!(records.iter().any(|r| matches!(
        &r.event,
        SessionEvent::Output { chunk } if chunk.kind == az_core::ChunkKind::Text
    )));
    // Offsets strictly increase
    let offsets: Vec<u64> = records.iter().map(|r| r.offset).collect();
    assert!(offsets.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn scenario_2_cancel_while_running() {
    let h = harness();
    // Backend that never produces output
    h.adapter.script_turn(vec![FakeStep::HangUntilCancelled]);

    let session =
        h.supervisor.spawn(SpawnRequest::new(AgentKind::SdkChat, "go")).await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Running).await;

    assert!(h.supervisor.cancel(&session.id));
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Cancelled).await;
    // Give the unwinding adapter a moment to try publishing late output
    tokio::time::sleep(Duration::from_millis(50)).await;

    let log = SessionLog::open(paths::session_log_path(h.dir.path(), &session.id)).unwrap();
    let records = log.entries_after(0).unwrap();
    let cancelled_at = records
        .iter()
        .position(|r| {
            matches!(
                r.event,
                SessionEvent::StatusChange { status: SessionStatus::Cancelled }
            )
        })
        .unwrap();
    assert!(
        !records[cancelled_at..].iter().any(|r| matches!(r.event, SessionEvent::Output { .. })),
        "no chunks after the cancellation status change"
    );

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert!(recovered.completed_at_ms.is_some());
}

#[tokio::test]
async fn scenario_3_resume_a_completed_sdk_session() {
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("fn foo() {}", 1)),
        FakeStep::Complete(TokenUsage::default()),
    ]);

    // Task-bound so completion lands on `completed` rather than `idle`
    let session = h
        .supervisor
        .spawn(
            SpawnRequest::new(AgentKind::SdkChat, "write function foo")
                .task_path("/tmp/task.md"),
        )
        .await
        .unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Completed).await;

    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("added tests", 2)),
        FakeStep::Complete(TokenUsage::default()),
    ]);
    h.supervisor.send_message(&session.id, "add tests").await.unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Completed).await;

    // The second turn's input contains the prior assistant message
    let messages = h.adapter.messages().unwrap();
    let foo_at = messages.iter().position(|m| m.content == "fn foo() {}").unwrap();
    let tests_at = messages.iter().position(|m| m.content == "add tests").unwrap();
    assert!(foo_at < tests_at);

    let recovered = h.supervisor.get_session(&session.id).unwrap();
    assert_eq!(recovered.resume_attempts, 1);
    assert_eq!(recovered.resume_history.len(), 1);
    assert!(recovered.resume_history[0].success);
}
