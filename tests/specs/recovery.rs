//! Scenario 5: crash recovery, plus the stream→recover→stream law.

use crate::helpers::{harness, wait_for_status};
use az_adapters::FakeStep;
use az_core::{
    AgentKind, OutputChunk, RegistryEvent, Session, SessionEvent, SessionId, SessionPatch,
    SessionStatus, SpawnRequest, TokenUsage,
};
use az_engine::DAEMON_DIED;
use az_storage::{paths, RegistryLog, SessionLog};
use tempfile::TempDir;

/// Write the streams a crashed process would have left behind.
fn seed_crashed_session(root: &std::path::Path, id: &SessionId, chunks: usize) {
    let mut registry = RegistryLog::open(paths::registry_log_path(root)).unwrap();
    let session = Session::builder().id(id.clone()).agent_kind(AgentKind::CliClaude).build();
    registry
        .append(&RegistryEvent::Created { session }, "2026-01-01T00:00:00.000Z")
        .unwrap();
    registry
        .append(
            &RegistryEvent::Updated {
                id: id.clone(),
                patch: SessionPatch::status(SessionStatus::Running),
            },
            "2026-01-01T00:00:01.000Z",
        )
        .unwrap();

    let mut log = SessionLog::open(paths::session_log_path(root, id)).unwrap();
    // A PID far above any live process, so the probe fails
    log.append(
        &SessionEvent::DaemonStarted { pid: 4_000_000, nonce: "gone".into() },
        "2026-01-01T00:00:01.000Z",
    )
    .unwrap();
    log.append(
        &SessionEvent::StatusChange { status: SessionStatus::Running },
        "2026-01-01T00:00:01.000Z",
    )
    .unwrap();
    for i in 0..chunks {
        log.append(
            &SessionEvent::Output { chunk: OutputChunk::text(format!("chunk-{i}"), i as u64) },
            "2026-01-01T00:00:02.000Z",
        )
        .unwrap();
    }
}

#[tokio::test]
async fn scenario_5_crash_recovery() {
    let dir = TempDir::new().unwrap();
    let id = SessionId::new("abc123abc123");
    seed_crashed_session(dir.path(), &id, 5);

    // A fresh supervisor over the same root
    use az_adapters::{AgentAdapter, FakeAdapter};
    use az_core::FakeClock;
    use az_engine::{AdapterFactory, NoopHooks, Supervisor, SupervisorConfig};
    use std::sync::Arc;

    let adapter = Arc::new(FakeAdapter::new());
    let factory: AdapterFactory = {
        let adapter = Arc::clone(&adapter);
        Arc::new(move |_s: &Session| Ok(Arc::clone(&adapter) as Arc<dyn AgentAdapter>))
    };
    let supervisor = Supervisor::start_with(
        SupervisorConfig::new(dir.path()).worktree_isolation(false),
        FakeClock::new(),
        Arc::new(NoopHooks),
        factory,
    )
    .unwrap();

    let recovered = supervisor.get_session(&id).unwrap();
    assert_eq!(recovered.status, SessionStatus::Failed);
    assert_eq!(recovered.error.as_deref(), Some(DAEMON_DIED));
    assert_eq!(recovered.output.len(), 5);
    assert_eq!(recovered.output[0].content, "chunk-0");
    assert_eq!(recovered.output[4].content, "chunk-4");
    assert_eq!(supervisor.live_count(), 0);
}

#[tokio::test]
async fn stream_recover_stream_reproduces_the_session_map() {
    // Write a full lifecycle with a live supervisor, then rebuild twice
    // from the same streams and compare
    let h = harness();
    h.adapter.script_turn(vec![
        FakeStep::Chunk(OutputChunk::text("out", 1)),
        FakeStep::Complete(TokenUsage { input: 5, output: 5 }),
    ]);
    let session = h
        .supervisor
        .spawn(SpawnRequest::new(AgentKind::SdkChat, "go").task_path("/tmp/t.md"))
        .await
        .unwrap();
    wait_for_status(&h.supervisor, &session.id, SessionStatus::Completed).await;
    h.supervisor.shutdown().await;

    let rebuild = |root: &std::path::Path| {
        let registry = RegistryLog::open(paths::registry_log_path(root)).unwrap();
        let mut index = az_storage::SessionIndex::new();
        for record in registry.entries_after(0).unwrap() {
            index.apply_registry(&record.event, 1);
        }
        let log = SessionLog::open(paths::session_log_path(root, &session.id)).unwrap();
        for record in log.entries_after(0).unwrap() {
            index.apply_session(&session.id, record.offset, &record.event, 1);
        }
        index
    };

    let first = rebuild(h.dir.path());
    let second = rebuild(h.dir.path());

    let a = first.get(&session.id).unwrap();
    let b = second.get(&session.id).unwrap();
    assert_eq!(a.status, SessionStatus::Completed);
    assert_eq!(a.status, b.status);
    assert_eq!(a.output, b.output);
    assert_eq!(a.metadata, b.metadata);
    assert_eq!(a.tokens, b.tokens);
    assert_eq!(a.messages, b.messages);
}

#[tokio::test]
async fn snapshot_corruption_rebuilds_from_streams() {
    let dir = TempDir::new().unwrap();
    let id = SessionId::new("abc123abc123");
    seed_crashed_session(dir.path(), &id, 2);
    // A snapshot that no longer parses
    std::fs::create_dir_all(paths::dot_dir(dir.path())).unwrap();
    std::fs::write(paths::snapshot_path(dir.path()), b"{broken").unwrap();

    use az_adapters::{AgentAdapter, FakeAdapter};
    use az_core::FakeClock;
    use az_engine::{AdapterFactory, NoopHooks, Supervisor, SupervisorConfig};
    use std::sync::Arc;

    let adapter = Arc::new(FakeAdapter::new());
    let factory: AdapterFactory = {
        let adapter = Arc::clone(&adapter);
        Arc::new(move |_s: &Session| Ok(Arc::clone(&adapter) as Arc<dyn AgentAdapter>))
    };
    let supervisor = Supervisor::start_with(
        SupervisorConfig::new(dir.path()).worktree_isolation(false),
        FakeClock::new(),
        Arc::new(NoopHooks),
        factory,
    )
    .unwrap();

    // The corrupt snapshot was set aside and state rebuilt by replay
    let recovered = supervisor.get_session(&id).unwrap();
    assert_eq!(recovered.output.len(), 2);
    let quarantined = std::fs::read_dir(paths::dot_dir(dir.path()))
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
    assert!(quarantined);
}
