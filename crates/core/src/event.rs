//! Event types for the two append-only streams.
//!
//! The *registry* stream records session lifecycle transitions; each live
//! session additionally has a per-session stream of chunks and sub-state
//! events. Both serialize as `{"kind": "...", ...payload}` records and are
//! the source of truth on restart. Unknown kinds deserialize to `Custom`.

use crate::chunk::OutputChunk;
use crate::id::SessionId;
use crate::message::ConversationMessage;
use crate::metadata::SessionMetadata;
use crate::session::{ResumeRecord, Session, SessionStatus};
use serde::{Deserialize, Serialize};

/// Partial update carried by `RegistryEvent::Updated`.
///
/// Exactly the changed fields are set; appliers must treat re-application
/// as idempotent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Full replacement of the resume bookkeeping (replacement keeps
    /// re-application idempotent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<crate::session::TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_history: Option<Vec<ResumeRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resumed_at_ms: Option<u64>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }
}

/// One record of the global registry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryEvent {
    Created {
        session: Session,
    },
    Updated {
        id: SessionId,
        #[serde(flatten)]
        patch: SessionPatch,
    },
    Completed {
        id: SessionId,
        metadata: SessionMetadata,
    },
    Failed {
        id: SessionId,
        error: String,
        metadata: SessionMetadata,
    },
    Cancelled {
        id: SessionId,
    },

    /// Catch-all for unknown record kinds (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

impl RegistryEvent {
    /// The session this event concerns.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Created { session } => Some(&session.id),
            Self::Updated { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id } => Some(id),
            Self::Custom => None,
        }
    }
}

/// One record of a per-session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The owning process announced itself; `nonce` defeats PID reuse on
    /// the restart liveness probe.
    DaemonStarted {
        pid: u32,
        nonce: String,
    },
    StatusChange {
        status: SessionStatus,
    },
    Output {
        chunk: OutputChunk,
    },
    ApprovalRequest {},
    InputRequest {},
    CliSessionId {
        id: String,
    },
    AgentState {
        backend: String,
        messages: Vec<ConversationMessage>,
    },

    /// Catch-all for unknown record kinds (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
