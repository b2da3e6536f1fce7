//! Per-session run task: drives one adapter turn, folds its events into
//! the state machine and the streams.
//!
//! The task owns the session's transitions for the duration of a turn.
//! Panics are contained by the task boundary and surface as `failed`;
//! cancellation is observed through the session's token (the supervisor
//! publishes the `cancelled` records itself, the task only unwinds).

use crate::supervisor::Shared;
use az_adapters::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use az_core::{
    Clock, MetadataAnalyzer, RegistryEvent, Session, SessionEvent, SessionId, SessionPatch,
    SessionStatus,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Publish a live metadata patch every this many chunks.
const METADATA_EVERY_CHUNKS: u32 = 16;

/// Spawn the driver task for one turn.
pub(crate) fn spawn_drive<C: Clock>(
    shared: Arc<Shared<C>>,
    session: Session,
    adapter: Arc<dyn AgentAdapter>,
    cancel: CancellationToken,
    turn: TurnRequest,
    is_resume: bool,
) {
    tokio::spawn(async move {
        let id = session.id.clone();
        // Contain panics from the drive future via a nested task boundary
        let outcome = tokio::spawn(drive(
            Arc::clone(&shared),
            session,
            adapter,
            cancel.clone(),
            turn,
            is_resume,
        ))
        .await;
        if let Err(join_error) = outcome {
            tracing::error!(session_id = %id, error = %join_error, "session task panicked");
            if !cancel.is_cancelled() {
                fail(&shared, &id, format!("internal error: {join_error}"), is_resume);
            }
            shared.turn_ended(&id);
        }
    });
}

async fn drive<C: Clock>(
    shared: Arc<Shared<C>>,
    session: Session,
    adapter: Arc<dyn AgentAdapter>,
    cancel: CancellationToken,
    turn: TurnRequest,
    is_resume: bool,
) {
    let shared = &shared;
    let session = &session;
    let id = session.id.clone();

    // Announce ownership for the restart liveness probe
    let _ = shared.bus.publish_session(
        &id,
        &SessionEvent::DaemonStarted { pid: std::process::id(), nonce: shared.nonce.clone() },
    );

    publish_status(shared, &id, SessionStatus::Running);

    let mut analyzer = MetadataAnalyzer::resume(session.metadata.clone());
    let (tx, mut rx) = mpsc::channel::<AdapterEvent>(256);
    let adapter_task = {
        let adapter = Arc::clone(&adapter);
        let cancel = cancel.child_token();
        let turn = turn.clone();
        tokio::spawn(async move { adapter.run(turn, tx, cancel).await })
    };

    let mut saw_complete = false;
    let mut final_tokens = az_core::TokenUsage::default();
    let mut saw_error: Option<String> = None;
    let mut last_backend_id: Option<String> = None;
    let mut chunks_since_metadata: u32 = 0;

    while let Some(event) = rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        match event {
            AdapterEvent::Output(chunk) => {
                analyzer.observe(&chunk);
                // Tool activity shows as `working`; text flips back
                match chunk.kind {
                    az_core::ChunkKind::ToolUse => {
                        publish_status(shared, &id, SessionStatus::Working);
                    }
                    az_core::ChunkKind::Text | az_core::ChunkKind::Thinking => {
                        let current = current_status(shared, &id);
                        if current == Some(SessionStatus::Working)
                            || current == Some(SessionStatus::WaitingApproval)
                            || current == Some(SessionStatus::WaitingInput)
                        {
                            publish_status(shared, &id, SessionStatus::Running);
                        }
                    }
                    _ => {}
                }
                let _ = shared.bus.publish_session(&id, &SessionEvent::Output { chunk });

                chunks_since_metadata += 1;
                if chunks_since_metadata >= METADATA_EVERY_CHUNKS {
                    chunks_since_metadata = 0;
                    let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
                        id: id.clone(),
                        patch: SessionPatch {
                            metadata: Some(analyzer.snapshot()),
                            ..SessionPatch::default()
                        },
                    });
                }
            }
            AdapterEvent::SessionId(backend_id) => {
                if last_backend_id.as_deref() != Some(backend_id.as_str()) {
                    last_backend_id = Some(backend_id.clone());
                    let _ = shared
                        .bus
                        .publish_session(&id, &SessionEvent::CliSessionId { id: backend_id });
                }
            }
            AdapterEvent::WaitingApproval => {
                // `working` has no edge to the waiting states; a backend
                // that prompts straight after a tool call passes back
                // through running first
                if current_status(shared, &id) == Some(SessionStatus::Working) {
                    publish_status(shared, &id, SessionStatus::Running);
                }
                let _ = shared.bus.publish_session(&id, &SessionEvent::ApprovalRequest {});
                publish_status(shared, &id, SessionStatus::WaitingApproval);
            }
            AdapterEvent::WaitingInput => {
                if current_status(shared, &id) == Some(SessionStatus::Working) {
                    publish_status(shared, &id, SessionStatus::Running);
                }
                let _ = shared.bus.publish_session(&id, &SessionEvent::InputRequest {});
                publish_status(shared, &id, SessionStatus::WaitingInput);
            }
            AdapterEvent::Complete { tokens } => {
                analyzer.set_actual_tokens(tokens);
                final_tokens = tokens;
                saw_complete = true;
            }
            AdapterEvent::Error(message) => {
                saw_error = Some(message);
            }
        }
    }

    let run_result = adapter_task.await;

    if cancel.is_cancelled() {
        // The cancel path already published the terminal records
        shared.turn_ended(&id);
        return;
    }

    // Persist the adapter's conversation for re-hydration after restart
    if let Some(messages) = adapter.messages() {
        if !messages.is_empty() {
            let _ = shared.bus.publish_session(
                &id,
                &SessionEvent::AgentState {
                    backend: session.agent_kind.to_string(),
                    messages,
                },
            );
        }
    }

    match run_result {
        Ok(Ok(())) => {
            if let Some(error) = saw_error {
                fail(shared, &id, error, is_resume);
            } else if saw_complete {
                succeed(shared, session, &analyzer, final_tokens, is_resume);
            } else {
                fail(
                    shared,
                    &id,
                    "backend ended without reporting completion".to_string(),
                    is_resume,
                );
            }
        }
        Ok(Err(AdapterError::Aborted)) => {
            // Abort without our cancel token: treat as failure unless the
            // supervisor cancelled concurrently (handled above)
            fail(shared, &id, "backend aborted".to_string(), is_resume);
        }
        Ok(Err(e)) => {
            fail(shared, &id, e.to_string(), is_resume);
        }
        Err(join_error) => {
            tracing::error!(session_id = %id, error = %join_error, "adapter task panicked");
            fail(shared, &id, format!("internal error: {join_error}"), is_resume);
        }
    }
    shared.turn_ended(&id);
}

/// Final transition of a successful turn: `completed` for task-bound
/// sessions, `idle` for bare chats.
fn succeed<C: Clock>(
    shared: &Arc<Shared<C>>,
    session: &Session,
    analyzer: &MetadataAnalyzer,
    tokens: az_core::TokenUsage,
    is_resume: bool,
) {
    let id = &session.id;
    let metadata = analyzer.snapshot();

    // A turn that completes while nominally waiting passes back through
    // running, which is the only exit those states have besides failure
    if matches!(
        current_status(shared, id),
        Some(SessionStatus::WaitingApproval) | Some(SessionStatus::WaitingInput)
    ) {
        publish_status(shared, id, SessionStatus::Running);
    }

    let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
        id: id.clone(),
        patch: SessionPatch { tokens: Some(tokens), ..SessionPatch::default() },
    });

    if session.task_path.is_some() {
        if !publish_status(shared, id, SessionStatus::Completed) {
            return;
        }
        let _ = shared.bus.publish_registry(&RegistryEvent::Completed {
            id: id.clone(),
            metadata,
        });
        if session.is_task_review() {
            shared.hooks.post_process_task_review(id);
        }
    } else {
        if !publish_status(shared, id, SessionStatus::Idle) {
            return;
        }
        let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
            id: id.clone(),
            patch: SessionPatch { metadata: Some(metadata), ..SessionPatch::default() },
        });
    }

    if is_resume {
        settle_resume(shared, id, true, None);
    }
}

fn fail<C: Clock>(shared: &Arc<Shared<C>>, id: &SessionId, error: String, is_resume: bool) {
    // A session that reached a terminal status concurrently (cancel,
    // delete) keeps it
    let (already_terminal, metadata) = {
        let index = shared.bus.index.lock();
        match index.get(id) {
            Some(session) => (session.status.is_terminal(), session.metadata.clone()),
            None => (true, Default::default()),
        }
    };
    if already_terminal {
        tracing::debug!(session_id = %id, error = %error, "dropping failure for terminal session");
        return;
    }

    tracing::warn!(session_id = %id, error = %error, "session failed");
    shared.log_activity(id, format!("failed: {error}"));
    let _ = shared
        .bus
        .publish_session(id, &SessionEvent::StatusChange { status: SessionStatus::Failed });
    let _ = shared.bus.publish_registry(&RegistryEvent::Failed {
        id: id.clone(),
        error: error.clone(),
        metadata,
    });
    if is_resume {
        settle_resume(shared, id, false, Some(error));
    }
}

/// Settle the newest resume-history entry, republished as a patch.
pub(crate) fn settle_resume<C: Clock>(
    shared: &Arc<Shared<C>>,
    id: &SessionId,
    success: bool,
    error: Option<String>,
) {
    let history = {
        let index = shared.bus.index.lock();
        let Some(session) = index.get(id) else { return };
        let mut history = session.resume_history.clone();
        let Some(last) = history.last_mut() else { return };
        last.success = success;
        last.error = error;
        history
    };
    let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
        id: id.clone(),
        patch: SessionPatch { resume_history: Some(history), ..SessionPatch::default() },
    });
}

fn current_status<C: Clock>(shared: &Arc<Shared<C>>, id: &SessionId) -> Option<SessionStatus> {
    shared.bus.index.lock().get(id).map(|s| s.status)
}

/// Validated transition published to both streams. Returns whether the
/// edge was taken.
fn publish_status<C: Clock>(shared: &Arc<Shared<C>>, id: &SessionId, to: SessionStatus) -> bool {
    let Some(current) = current_status(shared, id) else {
        return false;
    };
    if current == to {
        return true;
    }
    if !current.can_transition_to(to) {
        tracing::warn!(session_id = %id, from = %current, to = %to, "refusing invalid status transition");
        return false;
    }
    shared.log_activity(id, format!("status {current} -> {to}"));
    let _ = shared.bus.publish_session(id, &SessionEvent::StatusChange { status: to });
    let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
        id: id.clone(),
        patch: SessionPatch::status(to),
    });
    true
}
