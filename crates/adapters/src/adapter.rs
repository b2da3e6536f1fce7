//! The uniform adapter contract.

use async_trait::async_trait;
use az_core::{ConversationMessage, ImageAttachment, OutputChunk, TokenUsage};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors from adapter operations.
///
/// Tool-level failures (path traversal, oversized files, denied commands)
/// are NOT adapter errors — they surface as `tool_result` chunks with
/// `success=false` and the turn continues.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("launch failed: {0}")]
    LaunchFailed(String),
    #[error("backend failed: {0}")]
    RuntimeFailed(String),
    #[error("operation not supported: {0}")]
    Unsupported(String),
    #[error("aborted")]
    Aborted,
}

/// The six uniform events every adapter emits.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    Output(OutputChunk),
    /// The backend's native conversation id (CLI resume handle).
    SessionId(String),
    WaitingApproval,
    WaitingInput,
    Complete { tokens: TokenUsage },
    Error(String),
}

/// One turn of work handed to an adapter.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    pub model: String,
    /// Backend-native id to resume from (CLI adapters).
    pub backend_session_id: Option<String>,
    /// Whether this turn continues a prior conversation.
    pub resume: bool,
    pub images: Vec<ImageAttachment>,
}

impl TurnRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: working_dir.into(),
            model: String::new(),
            backend_session_id: None,
            resume: false,
            images: Vec::new(),
        }
    }

    az_core::setters! {
        into { model: String }
        set {
            resume: bool,
            images: Vec<ImageAttachment>,
        }
        option { backend_session_id: String }
    }
}

/// Adapter over one backend agent program.
///
/// One instance serves one session for the session's whole lifetime; `run`
/// is called once per turn and must not be re-entered while a turn is in
/// flight (the engine guarantees this).
#[async_trait]
pub trait AgentAdapter: Send + Sync + 'static {
    /// Run one turn, streaming events through `events`.
    ///
    /// Returning `Ok` without having sent `Complete` or `Error` is treated
    /// by the engine as a backend failure. Cancellation is cooperative:
    /// implementations must observe `cancel` at every suspension point.
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError>;

    /// Answer a pending approval request. Only meaningful while the
    /// session is in `waiting_approval`.
    async fn approve(&self, _approved: bool) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("approvals not supported by this backend".to_string()))
    }

    /// Feed free text to a backend that paused in `waiting_input`.
    async fn send_input(&self, _text: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Unsupported("input injection not supported by this backend".to_string()))
    }

    fn supports_approval(&self) -> bool {
        false
    }

    /// Export the conversation for persistence, if this backend keeps one.
    fn messages(&self) -> Option<Vec<ConversationMessage>> {
        None
    }

    /// Re-hydrate conversation state recovered from persistence.
    fn restore(&self, _messages: Vec<ConversationMessage>) {}

    /// Stage image attachments for the next turn.
    fn set_attachments(&self, _images: Vec<ImageAttachment>) {}
}
