//! Materialized session index, rebuilt from stream replay.
//!
//! Events are facts about what happened; the index derives state from them.
//! All handlers are idempotent: applying the same record twice must produce
//! the same state as applying it once. Registry events use assignment (not
//! mutation) and guarded inserts; per-session records are deduplicated by
//! offset, which also makes subscriber re-reads safe.

use az_core::{RegistryEvent, Session, SessionEvent, SessionId, SessionStatus};
use std::collections::HashMap;

/// Last daemon announcement seen on a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonMark {
    pub pid: u32,
    pub nonce: String,
}

/// Sessions materialized from registry + per-session replay.
#[derive(Debug, Default, Clone)]
pub struct SessionIndex {
    sessions: HashMap<String, Session>,
    /// session id → highest applied per-session offset
    applied: HashMap<String, u64>,
    /// session id → last `daemon_started` mark
    daemons: HashMap<String, DaemonMark>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the index from a snapshot (fast path before replay).
    pub fn from_sessions(sessions: Vec<Session>) -> Self {
        let mut index = Self::new();
        for session in sessions {
            index.sessions.insert(session.id.to_string(), session);
        }
        index
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id.as_str())
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id.as_str())
    }

    /// Get a session by id or unique prefix (like git commit hashes).
    pub fn get_by_prefix(&self, prefix: &str) -> Option<&Session> {
        if let Some(session) = self.sessions.get(prefix) {
            return Some(session);
        }
        let mut matches = self.sessions.values().filter(|s| s.id.as_str().starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(session), None) => Some(session),
            _ => None,
        }
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.to_string(), session);
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.applied.remove(id.as_str());
        self.daemons.remove(id.as_str());
        self.sessions.remove(id.as_str())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions whose persisted status is non-terminal.
    pub fn active_sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| !s.is_terminal())
    }

    pub fn daemon_mark(&self, id: &SessionId) -> Option<&DaemonMark> {
        self.daemons.get(id.as_str())
    }

    /// Apply one registry event. `at_ms` stamps terminal transitions.
    pub fn apply_registry(&mut self, event: &RegistryEvent, at_ms: u64) {
        match event {
            RegistryEvent::Created { session } => {
                // Guarded insert: replays must not clobber later state
                if !self.sessions.contains_key(session.id.as_str()) {
                    self.sessions.insert(session.id.to_string(), session.clone());
                }
            }
            RegistryEvent::Updated { id, patch } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    if let Some(status) = patch.status {
                        set_status(session, status, at_ms);
                    }
                    if let Some(error) = &patch.error {
                        session.error = Some(error.clone());
                    }
                    if let Some(metadata) = &patch.metadata {
                        session.metadata = metadata.clone();
                    }
                    if let Some(worktree_path) = &patch.worktree_path {
                        session.worktree_path = Some(worktree_path.clone());
                    }
                    if let Some(branch) = &patch.branch {
                        session.branch = Some(branch.clone());
                    }
                    if let Some(tokens) = patch.tokens {
                        session.tokens = tokens;
                    }
                    if let Some(resume_attempts) = patch.resume_attempts {
                        session.resume_attempts = resume_attempts;
                    }
                    if let Some(resume_history) = &patch.resume_history {
                        session.resume_history = resume_history.clone();
                    }
                    if let Some(last_resumed_at_ms) = patch.last_resumed_at_ms {
                        session.last_resumed_at_ms = Some(last_resumed_at_ms);
                    }
                }
            }
            RegistryEvent::Completed { id, metadata } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.metadata = metadata.clone();
                    set_status(session, SessionStatus::Completed, at_ms);
                }
            }
            RegistryEvent::Failed { id, error, metadata } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.error = Some(error.clone());
                    session.metadata = metadata.clone();
                    set_status(session, SessionStatus::Failed, at_ms);
                }
            }
            RegistryEvent::Cancelled { id } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    set_status(session, SessionStatus::Cancelled, at_ms);
                }
            }
            RegistryEvent::Custom => {}
        }
    }

    /// Apply one per-session stream record.
    ///
    /// Records at or below the highest applied offset for the session are
    /// skipped, which makes at-least-once delivery safe.
    pub fn apply_session(&mut self, id: &SessionId, offset: u64, event: &SessionEvent, at_ms: u64) {
        let last = self.applied.get(id.as_str()).copied().unwrap_or(0);
        if offset <= last {
            return;
        }
        self.applied.insert(id.to_string(), offset);

        match event {
            SessionEvent::DaemonStarted { pid, nonce } => {
                self.daemons
                    .insert(id.to_string(), DaemonMark { pid: *pid, nonce: nonce.clone() });
            }
            SessionEvent::StatusChange { status } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    set_status(session, *status, at_ms);
                }
            }
            SessionEvent::Output { chunk } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.output.push(chunk.clone());
                }
            }
            SessionEvent::CliSessionId { id: backend_id } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.backend_session_id = Some(backend_id.clone());
                }
            }
            SessionEvent::AgentState { messages, .. } => {
                if let Some(session) = self.sessions.get_mut(id.as_str()) {
                    session.messages = messages.clone();
                }
            }
            SessionEvent::ApprovalRequest {}
            | SessionEvent::InputRequest {}
            | SessionEvent::Custom => {}
        }
    }
}

/// Replay is fact application, not validation: the writer validated edges
/// before publishing, so the index assigns directly and only maintains the
/// `completed_at` invariant.
fn set_status(session: &mut Session, status: SessionStatus, at_ms: u64) {
    session.status = status;
    if status.is_terminal() {
        if session.completed_at_ms.is_none() {
            session.completed_at_ms = Some(at_ms);
        }
    } else {
        session.completed_at_ms = None;
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
