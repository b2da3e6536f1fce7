//! The supervisor: global session registry, concurrency cap, and control
//! routing.

use crate::bus::{EventBus, Subscriber};
use crate::config::SupervisorConfig;
use crate::hooks::{NoopHooks, TaskHooks};
use crate::run;
use crate::worktree::WorktreeManager;
use az_adapters::{
    AdapterError, AgentAdapter, ChatAdapter, CliAdapter, CliProduct, McpAdapter,
    MultimodalAdapter, TurnRequest,
};
use az_core::{
    AgentKind, ChunkKind, Clock, ControlError, OutputChunk, RegistryEvent, ResumeRecord, Session,
    SessionEvent, SessionId, SessionPatch, SessionStatus, SpawnError, SpawnRequest, SystemClock,
};
use az_storage::{load_snapshot, paths, SessionIndex, SessionStore, StreamError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds the adapter for a session at spawn/resume time.
pub type AdapterFactory =
    Arc<dyn Fn(&Session) -> Result<Arc<dyn AgentAdapter>, AdapterError> + Send + Sync>;

pub(crate) struct SessionHandle {
    pub(crate) adapter: Arc<dyn AgentAdapter>,
    pub(crate) cancel: CancellationToken,
}

/// State shared between the supervisor surface and the per-session run
/// tasks.
pub(crate) struct Shared<C: Clock> {
    pub(crate) config: SupervisorConfig,
    pub(crate) clock: C,
    pub(crate) bus: Arc<EventBus<C>>,
    pub(crate) worktrees: Arc<WorktreeManager>,
    pub(crate) hooks: Arc<dyn TaskHooks>,
    /// Adapter instances for sessions this process has touched. Retained
    /// across turns so SDK adapters keep their conversation state.
    pub(crate) handles: Mutex<HashMap<String, SessionHandle>>,
    /// Sessions with a turn in flight right now; this is the set the
    /// concurrency cap counts.
    pub(crate) active_turns: Mutex<HashSet<String>>,
    /// This process's liveness nonce (see the daemon probe).
    pub(crate) nonce: String,
    /// Side-channel human-readable activity log.
    pub(crate) activity: tokio::sync::mpsc::Sender<crate::logger::ActivityMessage>,
}

impl<C: Clock> Shared<C> {
    pub(crate) fn turn_started(&self, id: &SessionId) {
        self.active_turns.lock().insert(id.to_string());
    }

    pub(crate) fn turn_ended(&self, id: &SessionId) {
        self.active_turns.lock().remove(id.as_str());
    }

    pub(crate) fn log_activity(&self, id: &SessionId, line: impl Into<String>) {
        let _ = self.activity.try_send((id.clone(), line.into()));
    }
}

/// The session lifecycle supervisor.
///
/// Cloneable facade; all state lives in the shared inner.
pub struct Supervisor<C: Clock = SystemClock> {
    shared: Arc<Shared<C>>,
    factory: AdapterFactory,
}

impl<C: Clock> Clone for Supervisor<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), factory: Arc::clone(&self.factory) }
    }
}

impl Supervisor<SystemClock> {
    /// Start a supervisor with the production adapters.
    pub fn start(config: SupervisorConfig) -> Result<Self, SpawnError> {
        Self::start_with(config, SystemClock, Arc::new(NoopHooks), default_factory())
    }
}

impl<C: Clock> Supervisor<C> {
    /// Start with injected clock, hooks, and adapter factory.
    ///
    /// Runs recovery: snapshot fast path, stream replay, daemon liveness
    /// probe, orphan worktree sweep. Must be called within a tokio
    /// runtime; the snapshot writer and the sweep run as background tasks.
    pub fn start_with(
        config: SupervisorConfig,
        clock: C,
        hooks: Arc<dyn TaskHooks>,
        factory: AdapterFactory,
    ) -> Result<Self, SpawnError> {
        let persist = |e: StreamError| SpawnError::Persistence(e.to_string());

        // (1) snapshot fast path
        let snapshot = load_snapshot(&paths::snapshot_path(&config.root), clock.epoch_ms())
            .map_err(|e| SpawnError::Persistence(e.to_string()))?;
        let index = Arc::new(Mutex::new(SessionIndex::from_sessions(
            snapshot.map(|s| s.sessions).unwrap_or_default(),
        )));

        let store = SessionStore::spawn(paths::snapshot_path(&config.root), Arc::clone(&index));
        let bus = Arc::new(
            EventBus::open(
                config.root.clone(),
                clock.clone(),
                config.buffer_size,
                Arc::clone(&index),
                store,
            )
            .map_err(persist)?,
        );

        // Announce this process for the liveness probe
        let nonce = nanoid::nanoid!(16);
        let daemons = paths::daemons_dir(&config.root);
        std::fs::create_dir_all(&daemons).map_err(|e| SpawnError::Persistence(e.to_string()))?;
        std::fs::write(paths::nonce_path(&config.root, std::process::id()), &nonce)
            .map_err(|e| SpawnError::Persistence(e.to_string()))?;

        // (2)–(4) replay and resolve dead daemons
        let failed = crate::recovery::reconcile(&bus, &config.root);
        if !failed.is_empty() {
            tracing::info!(count = failed.len(), "failed sessions with dead daemons on startup");
        }

        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(256);
        crate::logger::SessionLogger::spawn_writer(paths::logs_dir(&config.root), activity_rx);

        let shared = Arc::new(Shared {
            config,
            clock,
            bus,
            worktrees: Arc::new(WorktreeManager::new()),
            hooks,
            handles: Mutex::new(HashMap::new()),
            active_turns: Mutex::new(HashSet::new()),
            nonce,
            activity: activity_tx,
        });

        // (5) orphan worktree sweep, per repo the index knows about
        let supervisor = Self { shared, factory };
        supervisor.sweep_orphan_worktrees();
        Ok(supervisor)
    }

    fn sweep_orphan_worktrees(&self) {
        let shared = Arc::clone(&self.shared);
        let mut roots: HashSet<std::path::PathBuf> = HashSet::new();
        roots.insert(shared.config.root.clone());
        let known: HashSet<String> = {
            let index = shared.bus.index.lock();
            index
                .sessions()
                .filter_map(|s| {
                    roots.insert(s.working_dir.clone());
                    s.worktree_path
                        .as_ref()
                        .and_then(|p| p.file_name())
                        .and_then(|n| n.to_str())
                        .map(str::to_string)
                })
                .collect()
        };
        tokio::spawn(async move {
            for root in roots {
                let removed = shared.worktrees.sweep_orphans(&root, &known).await;
                if removed > 0 {
                    tracing::info!(repo = %root.display(), removed, "cleaned orphan worktrees");
                }
            }
        });
    }

    /// Create a fresh session. Returns immediately with status `pending`;
    /// the run proceeds asynchronously.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Session, SpawnError> {
        request.validate().map_err(SpawnError::InvalidArgument)?;

        let shared = &self.shared;
        let id = match &request.session_id {
            Some(id) => {
                if shared.bus.index.lock().get(id).is_some() {
                    return Err(SpawnError::DuplicateId(id.clone()));
                }
                id.clone()
            }
            None => SessionId::generate(),
        };

        // Check the cap and reserve the slot atomically
        {
            let mut turns = shared.active_turns.lock();
            let running = turns.len();
            let cap = shared.config.max_concurrent;
            if running >= cap {
                return Err(SpawnError::CapacityReached { running, cap });
            }
            turns.insert(id.to_string());
        }

        let working_dir =
            request.working_dir.clone().unwrap_or_else(|| shared.config.root.clone());
        let mut session =
            Session::from_request(&request, id.clone(), working_dir.clone(), shared.clock.epoch_ms());

        // Worktree isolation is best-effort: a plain directory or a git
        // failure degrades to the base working dir
        if shared.config.worktree_isolation {
            let created = match &session.task_path {
                Some(task_path) => {
                    shared.worktrees.create_for_task(&working_dir, task_path, &id).await
                }
                None => shared.worktrees.create_for_session(&working_dir, &id).await,
            };
            match created {
                Ok(handle) => {
                    session.worktree_path = Some(handle.path);
                    session.branch = Some(handle.branch);
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "worktree creation failed; running in base directory");
                }
            }
        }

        if let Err(e) =
            shared.bus.publish_registry(&RegistryEvent::Created { session: session.clone() })
        {
            shared.turn_ended(&id);
            return Err(SpawnError::Persistence(e.to_string()));
        }

        let adapter = match (self.factory)(&session) {
            Ok(adapter) => adapter,
            Err(e) => {
                // Backend launch failure fails the session, not the call
                let error = e.to_string();
                let _ = shared.bus.publish_session(
                    &id,
                    &SessionEvent::StatusChange { status: SessionStatus::Failed },
                );
                let _ = shared.bus.publish_registry(&RegistryEvent::Failed {
                    id: id.clone(),
                    error: error.clone(),
                    metadata: session.metadata.clone(),
                });
                shared.turn_ended(&id);
                session.status = SessionStatus::Failed;
                session.error = Some(error);
                return Ok(session);
            }
        };
        if !request.images.is_empty() {
            adapter.set_attachments(request.images.clone());
        }

        let cancel = CancellationToken::new();
        shared.handles.lock().insert(
            id.to_string(),
            SessionHandle { adapter: Arc::clone(&adapter), cancel: cancel.clone() },
        );

        let turn = TurnRequest::new(&session.prompt, session.effective_dir().clone())
            .model(&session.model)
            .images(request.images.clone());
        run::spawn_drive(Arc::clone(shared), session.clone(), adapter, cancel, turn, false);

        Ok(session)
    }

    /// Append a follow-up turn to an existing session.
    pub async fn send_message(
        &self,
        id: &SessionId,
        message: &str,
    ) -> Result<(), ControlError> {
        let shared = &self.shared;

        // Validations, in order: exists, not running, capacity, resumable,
        // non-empty
        let session = shared
            .bus
            .index
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.clone()))?;

        if matches!(
            session.status,
            SessionStatus::Pending
                | SessionStatus::Running
                | SessionStatus::Working
                | SessionStatus::WaitingApproval
        ) {
            return Err(ControlError::IllegalState(format!(
                "session is {} and cannot take a message",
                session.status
            )));
        }

        // waiting_input answers feed the live turn rather than a new run
        let answers_input = session.status == SessionStatus::WaitingInput;

        // Check the cap and reserve the slot atomically; later validation
        // failures release it
        if !answers_input {
            let mut turns = shared.active_turns.lock();
            let running = turns.len();
            let cap = shared.config.max_concurrent;
            if running >= cap {
                return Err(ControlError::CapacityReached { running, cap });
            }
            turns.insert(id.to_string());
        }
        let release = || {
            if !answers_input {
                shared.turn_ended(id);
            }
        };

        if session.status == SessionStatus::Cancelled {
            release();
            return Err(ControlError::IllegalState(
                "cancelled sessions are not resumable".to_string(),
            ));
        }
        if session.agent_kind.resume_needs_backend_id() && session.backend_session_id.is_none() {
            release();
            return Err(ControlError::IllegalState(
                "backend session id is not yet known; cannot resume".to_string(),
            ));
        }

        let trimmed = message.trim();
        if trimmed.is_empty() {
            release();
            return Err(ControlError::InvalidArgument("message must be non-empty".to_string()));
        }

        let now = shared.clock.epoch_ms();

        // Resume bookkeeping, published as a patch so it replays
        let mut history = session.resume_history.clone();
        history.push(ResumeRecord {
            at_ms: now,
            message: trimmed.to_string(),
            success: false,
            error: None,
        });
        let attempts = session.resume_attempts + 1;
        if let Err(e) = shared.bus.publish_registry(&RegistryEvent::Updated {
            id: id.clone(),
            patch: SessionPatch {
                resume_attempts: Some(attempts),
                resume_history: Some(history),
                last_resumed_at_ms: Some(now),
                ..SessionPatch::default()
            },
        }) {
            release();
            return Err(ControlError::Persistence(e.to_string()));
        }

        if let Err(e) = shared.bus.publish_session(
            id,
            &SessionEvent::Output { chunk: OutputChunk::new(ChunkKind::UserMessage, trimmed, now) },
        ) {
            release();
            return Err(ControlError::Persistence(e.to_string()));
        }

        if answers_input {
            // Deliver to the live adapter and return to running
            let adapter = shared
                .handles
                .lock()
                .get(id.as_str())
                .map(|h| Arc::clone(&h.adapter))
                .ok_or_else(|| {
                    ControlError::IllegalState("no live backend to receive input".to_string())
                })?;
            adapter
                .send_input(trimmed)
                .await
                .map_err(|e| ControlError::IllegalState(e.to_string()))?;
            let _ = shared.bus.publish_session(
                id,
                &SessionEvent::StatusChange { status: SessionStatus::Running },
            );
            let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
                id: id.clone(),
                patch: SessionPatch::status(SessionStatus::Running),
            });
            self.settle_resume(id, true, None);
            return Ok(());
        }

        // Fresh turn: reuse the retained adapter or rebuild and restore
        let adapter = {
            let handles = shared.handles.lock();
            handles.get(id.as_str()).map(|h| Arc::clone(&h.adapter))
        };
        let adapter = match adapter {
            Some(adapter) => adapter,
            None => match (self.factory)(&session) {
                Ok(adapter) => {
                    if !session.messages.is_empty() {
                        adapter.restore(session.messages.clone());
                    }
                    adapter
                }
                Err(e) => {
                    release();
                    return Err(ControlError::IllegalState(e.to_string()));
                }
            },
        };

        let cancel = CancellationToken::new();
        shared.handles.lock().insert(
            id.to_string(),
            SessionHandle { adapter: Arc::clone(&adapter), cancel: cancel.clone() },
        );

        let turn = TurnRequest::new(trimmed, session.effective_dir().clone())
            .model(&session.model)
            .resume(true);
        let turn = match &session.backend_session_id {
            Some(backend_id) => turn.backend_session_id(backend_id.clone()),
            None => turn,
        };
        run::spawn_drive(Arc::clone(shared), session, adapter, cancel, turn, true);
        Ok(())
    }

    /// Forward a yes/no approval to a session in `waiting_approval`.
    pub async fn approve(&self, id: &SessionId, approved: bool) -> Result<(), ControlError> {
        let shared = &self.shared;
        let session = shared
            .bus
            .index
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(id.clone()))?;

        if session.status != SessionStatus::WaitingApproval {
            return Err(ControlError::IllegalState(format!(
                "session is {}, not waiting_approval",
                session.status
            )));
        }
        let adapter = shared
            .handles
            .lock()
            .get(id.as_str())
            .map(|h| Arc::clone(&h.adapter))
            .ok_or_else(|| {
                ControlError::IllegalState("no live backend for this session".to_string())
            })?;
        if !adapter.supports_approval() {
            return Err(ControlError::IllegalState(
                "backend does not support approvals".to_string(),
            ));
        }
        adapter.approve(approved).await.map_err(|e| ControlError::IllegalState(e.to_string()))?;

        let _ = shared
            .bus
            .publish_session(id, &SessionEvent::StatusChange { status: SessionStatus::Running });
        let _ = shared.bus.publish_registry(&RegistryEvent::Updated {
            id: id.clone(),
            patch: SessionPatch::status(SessionStatus::Running),
        });
        Ok(())
    }

    /// Cancel a session. Idempotent: returns `false` when the session is
    /// unknown or already terminal.
    pub fn cancel(&self, id: &SessionId) -> bool {
        let shared = &self.shared;
        let Some(session) = shared.bus.index.lock().get(id).cloned() else {
            return false;
        };
        if session.status.is_terminal() {
            return false;
        }

        if let Some(handle) = shared.handles.lock().get(id.as_str()) {
            handle.cancel.cancel();
        }
        shared.log_activity(id, format!("status {} -> cancelled", session.status));

        // Terminal record first on the session stream (closing it to late
        // chunks), then the registry
        let _ = shared
            .bus
            .publish_session(id, &SessionEvent::StatusChange { status: SessionStatus::Cancelled });
        let _ = shared.bus.publish_registry(&RegistryEvent::Cancelled { id: id.clone() });

        shared.turn_ended(id);
        shared.handles.lock().remove(id.as_str());
        true
    }

    /// Cancel if running, remove the worktree (best-effort), and drop the
    /// session from the snapshot. Stream records remain for audit.
    pub async fn delete(&self, id: &SessionId) -> bool {
        let shared = &self.shared;
        let Some(session) = shared.bus.index.lock().get(id).cloned() else {
            return false;
        };
        if session.status.is_active() {
            self.cancel(id);
        }
        if let Some(worktree_path) = &session.worktree_path {
            shared
                .worktrees
                .remove(&session.working_dir, worktree_path, session.branch.as_deref())
                .await;
        }
        shared.bus.remove_session(id);
        shared.handles.lock().remove(id.as_str());
        true
    }

    /// Fan-out of all live events.
    pub fn subscribe(&self) -> Subscriber {
        self.shared.bus.subscribe()
    }

    /// Historical registry records for subscriber catch-up.
    pub fn registry_entries_after(
        &self,
        offset: u64,
    ) -> Result<Vec<az_storage::StreamRecord<RegistryEvent>>, ControlError> {
        self.shared
            .bus
            .registry_entries_after(offset)
            .map_err(|e| ControlError::Persistence(e.to_string()))
    }

    /// Historical per-session records for subscriber catch-up.
    pub fn session_entries_after(
        &self,
        id: &SessionId,
        offset: u64,
    ) -> Result<Vec<az_storage::StreamRecord<SessionEvent>>, ControlError> {
        self.shared
            .bus
            .session_entries_after(id, offset)
            .map_err(|e| ControlError::Persistence(e.to_string()))
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.shared.bus.index.lock().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.shared.bus.index.lock().sessions().cloned().collect()
    }

    /// Live adapter turns right now (the number the cap is enforced on).
    pub fn live_count(&self) -> usize {
        self.shared.active_turns.lock().len()
    }

    /// Graceful shutdown: cancel live turns, wait bounded time for them
    /// to settle, flush the snapshot.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        {
            let handles = shared.handles.lock();
            for handle in handles.values() {
                handle.cancel.cancel();
            }
        }
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !shared.active_turns.lock().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        shared.bus.flush_store().await;
        let _ = std::fs::remove_file(paths::nonce_path(&shared.config.root, std::process::id()));
    }

    pub(crate) fn settle_resume(&self, id: &SessionId, success: bool, error: Option<String>) {
        run::settle_resume(&self.shared, id, success, error);
    }
}

/// Adapter construction for the production agent kinds.
pub fn default_factory() -> AdapterFactory {
    Arc::new(|session: &Session| {
        let adapter: Arc<dyn AgentAdapter> = match session.agent_kind {
            AgentKind::CliClaude => Arc::new(CliAdapter::new(CliProduct::Claude)?),
            AgentKind::CliCodex => Arc::new(CliAdapter::new(CliProduct::Codex)?),
            AgentKind::CliOpencode => Arc::new(CliAdapter::new(CliProduct::Opencode)?),
            AgentKind::SdkChat => Arc::new(ChatAdapter::new()),
            AgentKind::SdkMultimodal => Arc::new(MultimodalAdapter::new()),
            AgentKind::SdkMcp => Arc::new(McpAdapter::new()),
        };
        Ok(adapter)
    })
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
