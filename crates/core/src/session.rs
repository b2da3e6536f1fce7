//! Session entity and lifecycle state machine.
//!
//! A `Session` is the top-level orchestrated entity: one conversation with
//! one backend agent, isolated in one worktree. The status graph is strict —
//! the engine refuses edges that `SessionStatus::can_transition_to` rejects,
//! and `completed_at_ms` is set exactly when a terminal status is entered.

use crate::chunk::{ImageAttachment, OutputChunk};
use crate::id::SessionId;
use crate::message::ConversationMessage;
use crate::metadata::SessionMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which backend program drives a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    CliClaude,
    CliCodex,
    CliOpencode,
    SdkChat,
    SdkMultimodal,
    SdkMcp,
}

crate::simple_display! {
    AgentKind {
        CliClaude => "cli-claude",
        CliCodex => "cli-codex",
        CliOpencode => "cli-opencode",
        SdkChat => "sdk-chat",
        SdkMultimodal => "sdk-multimodal",
        SdkMcp => "sdk-mcp",
    }
}

impl AgentKind {
    /// CLI-subprocess backends (as opposed to in-process SDK loops).
    pub fn is_cli(&self) -> bool {
        matches!(self, Self::CliClaude | Self::CliCodex | Self::CliOpencode)
    }

    /// Whether resuming requires the backend's native session id.
    pub fn resume_needs_backend_id(&self) -> bool {
        self.is_cli()
    }

    /// Model used when the spawn request does not name one.
    pub fn default_model(&self) -> &'static str {
        match self {
            Self::CliClaude => "claude-sonnet-4-5",
            Self::CliCodex => "gpt-5-codex",
            Self::CliOpencode => "claude-sonnet-4-5",
            Self::SdkChat | Self::SdkMultimodal | Self::SdkMcp => "gpt-4o",
        }
    }
}

/// Session lifecycle status.
///
/// Active: pending, running, working, waiting_approval, waiting_input, idle.
/// Terminal: completed, failed, cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Working,
    WaitingApproval,
    WaitingInput,
    Idle,
    Completed,
    Failed,
    Cancelled,
}

crate::simple_display! {
    SessionStatus {
        Pending => "pending",
        Running => "running",
        Working => "working",
        WaitingApproval => "waiting_approval",
        WaitingInput => "waiting_input",
        Idle => "idle",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the adapter is live right now (spawn in flight or mid-turn).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Working | Self::WaitingApproval)
    }

    /// Statuses from which `send_message` may start a new turn.
    ///
    /// Messages queued while a turn is in flight are rejected, not buffered.
    pub fn accepts_message(&self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::WaitingInput | Self::Failed)
    }

    /// The lifecycle graph. No back-transitions to `pending`; terminal
    /// statuses admit no edges except `completed → running` (SDK resume).
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (_, Pending) => false,
            (Pending, Running | Failed | Cancelled) => true,
            (Pending, _) => false,
            (Running, Working | WaitingApproval | WaitingInput | Idle | Completed | Failed
                | Cancelled) => true,
            (Running, _) => false,
            (Working, Running | Idle | Completed | Failed | Cancelled) => true,
            (Working, _) => false,
            (WaitingApproval, Running | Failed | Cancelled) => true,
            (WaitingApproval, _) => false,
            (WaitingInput, Running | Failed | Cancelled) => true,
            (WaitingInput, _) => false,
            (Idle, Running | Failed | Cancelled) => true,
            (Idle, _) => false,
            (Completed, Running) => true,
            (Completed, _) => false,
            (Failed, Running) => true,
            (Failed, _) => false,
            (Cancelled, _) => false,
        }
    }
}

/// Input/output token counters, actual when reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// One entry of the per-attempt resume history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub at_ms: u64,
    pub message: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A request to spawn a fresh session.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub prompt: String,
    pub agent_kind: Option<AgentKind>,
    pub session_id: Option<SessionId>,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub task_path: Option<PathBuf>,
    pub title: Option<String>,
    pub images: Vec<ImageAttachment>,
    /// Source-file/line annotations forwarded verbatim to the prompt context.
    pub annotations: Vec<String>,
}

impl SpawnRequest {
    pub fn new(agent_kind: AgentKind, prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), agent_kind: Some(agent_kind), ..Self::default() }
    }

    crate::setters! {
        set {
            images: Vec<ImageAttachment>,
            annotations: Vec<String>,
        }
        option {
            session_id: SessionId,
            working_dir: PathBuf,
            model: String,
            task_path: PathBuf,
            title: String,
        }
    }

    /// Validate the request fields, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.prompt.trim().is_empty() {
            return Err("prompt must be non-empty".to_string());
        }
        if self.agent_kind.is_none() {
            return Err("agent kind is required".to_string());
        }
        if let Some(id) = &self.session_id {
            if id.is_empty() {
                return Err("session id must be non-empty when given".to_string());
            }
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err("model must be non-empty when given".to_string());
            }
        }
        Ok(())
    }
}

/// The top-level orchestrated entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub agent_kind: AgentKind,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_path: Option<PathBuf>,
    /// The user's repo root.
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    /// `agentz/session-<id>` when worktree isolation is in effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub model: String,
    pub status: SessionStatus,
    pub started_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resumed_at_ms: Option<u64>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// The backend program's own conversation id, for CLI resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    /// Conversation export, for SDK adapters that re-hydrate state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ConversationMessage>,
    /// Append-only observed output, ordered by stream offset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<OutputChunk>,
    #[serde(default)]
    pub resume_attempts: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume_history: Vec<ResumeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    /// Materialize a session from a validated spawn request.
    pub fn from_request(request: &SpawnRequest, id: SessionId, working_dir: PathBuf, at_ms: u64) -> Self {
        let agent_kind = request.agent_kind.unwrap_or(AgentKind::SdkChat);
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| agent_kind.default_model().to_string());
        Self {
            id,
            agent_kind,
            prompt: request.prompt.clone(),
            title: request.title.clone(),
            task_path: request.task_path.clone(),
            working_dir,
            worktree_path: None,
            branch: None,
            model,
            status: SessionStatus::Pending,
            started_at_ms: at_ms,
            completed_at_ms: None,
            last_resumed_at_ms: None,
            metadata: SessionMetadata::default(),
            tokens: TokenUsage::default(),
            backend_session_id: None,
            messages: Vec::new(),
            output: Vec::new(),
            resume_attempts: 0,
            resume_history: Vec::new(),
            error: None,
        }
    }

    /// The directory tools operate in: the worktree when present, the base
    /// working dir otherwise.
    pub fn effective_dir(&self) -> &PathBuf {
        self.worktree_path.as_ref().unwrap_or(&self.working_dir)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition, enforcing the lifecycle graph and the
    /// `completed_at` invariant.
    pub fn apply_status(&mut self, to: SessionStatus, at_ms: u64) -> Result<(), InvalidTransition> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition { id: self.id.clone(), from: self.status, to });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at_ms = Some(at_ms);
        } else {
            // A completed SDK session resuming sheds its terminal timestamp.
            self.completed_at_ms = None;
        }
        Ok(())
    }

    /// Record the start of a resume attempt. The entry starts unsuccessful
    /// and is settled by [`Session::settle_resume`].
    pub fn record_resume(&mut self, message: impl Into<String>, at_ms: u64) {
        self.resume_attempts += 1;
        self.last_resumed_at_ms = Some(at_ms);
        self.resume_history.push(ResumeRecord {
            at_ms,
            message: message.into(),
            success: false,
            error: None,
        });
    }

    /// Settle the most recent resume attempt.
    pub fn settle_resume(&mut self, success: bool, error: Option<String>) {
        if let Some(last) = self.resume_history.last_mut() {
            last.success = success;
            last.error = error;
        }
    }

    /// Whether the session title marks it as a task review/verify pass.
    pub fn is_task_review(&self) -> bool {
        self.title
            .as_deref()
            .map(|t| t.starts_with("Review:") || t.starts_with("Verify:"))
            .unwrap_or(false)
    }
}

/// A rejected edge in the lifecycle graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition for session {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: SessionId,
    pub from: SessionStatus,
    pub to: SessionStatus,
}

/// Test builder with usable defaults.
#[cfg(any(test, feature = "test-support"))]
pub struct SessionBuilder {
    id: Option<SessionId>,
    agent_kind: AgentKind,
    prompt: String,
    title: Option<String>,
    task_path: Option<PathBuf>,
    working_dir: PathBuf,
    status: SessionStatus,
}

#[cfg(any(test, feature = "test-support"))]
impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            id: None,
            agent_kind: AgentKind::SdkChat,
            prompt: "test prompt".to_string(),
            title: None,
            task_path: None,
            working_dir: PathBuf::from("/tmp"),
            status: SessionStatus::Pending,
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl SessionBuilder {
    crate::setters! {
        into { prompt: String }
        set {
            agent_kind: AgentKind,
            status: SessionStatus,
            working_dir: PathBuf,
        }
        option {
            id: SessionId,
            title: String,
            task_path: PathBuf,
        }
    }

    pub fn build(self) -> Session {
        let request = SpawnRequest {
            prompt: self.prompt,
            agent_kind: Some(self.agent_kind),
            title: self.title,
            task_path: self.task_path,
            ..SpawnRequest::default()
        };
        let id = self.id.unwrap_or_else(SessionId::generate);
        let mut session = Session::from_request(&request, id, self.working_dir, 1_000);
        session.status = self.status;
        session
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Session {
    /// Create a builder with test defaults.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
