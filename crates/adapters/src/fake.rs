//! Scripted adapter for deterministic lifecycle tests.

use crate::adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use async_trait::async_trait;
use az_core::{ConversationMessage, OutputChunk, TokenUsage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted step of a fake turn.
#[derive(Debug, Clone)]
pub enum FakeStep {
    Chunk(OutputChunk),
    SessionId(String),
    WaitApproval,
    WaitInput,
    Sleep(Duration),
    Complete(TokenUsage),
    Error(String),
    /// Park until cancelled; the run then returns `Aborted`.
    HangUntilCancelled,
}

/// A scripted adapter: each `run` pops one turn's steps and plays them.
///
/// Records received prompts (and restored conversations) so tests can
/// assert what the engine fed the backend.
#[derive(Default)]
pub struct FakeAdapter {
    turns: Mutex<VecDeque<Vec<FakeStep>>>,
    /// Prompts received by `run`, in order.
    pub prompts: Mutex<Vec<String>>,
    /// Conversation state, as an SDK adapter would keep it.
    messages: Mutex<Vec<ConversationMessage>>,
    approvals: Mutex<Vec<bool>>,
    supports_approval: bool,
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_approval_support() -> Self {
        Self { supports_approval: true, ..Self::default() }
    }

    /// Queue the steps for the next `run` call.
    pub fn script_turn(&self, steps: Vec<FakeStep>) {
        self.turns.lock().push_back(steps);
    }

    /// A turn that emits one text chunk then completes.
    pub fn script_simple_completion(&self, text: &str) {
        self.script_turn(vec![
            FakeStep::Chunk(OutputChunk::text(text, 1)),
            FakeStep::Complete(TokenUsage { input: 100, output: 20 }),
        ]);
    }

    pub fn approvals(&self) -> Vec<bool> {
        self.approvals.lock().clone()
    }
}

#[async_trait]
impl AgentAdapter for FakeAdapter {
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        self.prompts.lock().push(turn.prompt.clone());
        self.messages.lock().push(ConversationMessage::user(&turn.prompt));

        let steps = self.turns.lock().pop_front().unwrap_or_else(|| {
            vec![FakeStep::Complete(TokenUsage::default())]
        });

        for step in steps {
            if cancel.is_cancelled() {
                return Err(AdapterError::Aborted);
            }
            match step {
                FakeStep::Chunk(chunk) => {
                    if chunk.kind == az_core::ChunkKind::Text {
                        self.messages.lock().push(ConversationMessage::assistant(&chunk.content));
                    }
                    let _ = events.send(AdapterEvent::Output(chunk)).await;
                }
                FakeStep::SessionId(id) => {
                    let _ = events.send(AdapterEvent::SessionId(id)).await;
                }
                FakeStep::WaitApproval => {
                    let _ = events.send(AdapterEvent::WaitingApproval).await;
                }
                FakeStep::WaitInput => {
                    let _ = events.send(AdapterEvent::WaitingInput).await;
                }
                FakeStep::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = cancel.cancelled() => return Err(AdapterError::Aborted),
                    }
                }
                FakeStep::Complete(tokens) => {
                    let _ = events.send(AdapterEvent::Complete { tokens }).await;
                    return Ok(());
                }
                FakeStep::Error(message) => {
                    let _ = events.send(AdapterEvent::Error(message)).await;
                    return Ok(());
                }
                FakeStep::HangUntilCancelled => {
                    cancel.cancelled().await;
                    return Err(AdapterError::Aborted);
                }
            }
        }
        Ok(())
    }

    async fn approve(&self, approved: bool) -> Result<(), AdapterError> {
        if !self.supports_approval {
            return Err(AdapterError::Unsupported("fake adapter without approvals".to_string()));
        }
        self.approvals.lock().push(approved);
        Ok(())
    }

    async fn send_input(&self, text: &str) -> Result<(), AdapterError> {
        self.messages.lock().push(ConversationMessage::user(text));
        Ok(())
    }

    fn supports_approval(&self) -> bool {
        self.supports_approval
    }

    fn messages(&self) -> Option<Vec<ConversationMessage>> {
        Some(self.messages.lock().clone())
    }

    fn restore(&self, messages: Vec<ConversationMessage>) {
        *self.messages.lock() = messages;
    }
}
