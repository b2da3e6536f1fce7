//! SDK multimodal adapter: the chat tool-calling loop, accepting image
//! attachments on the initial prompt and on follow-ups.

use crate::adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use crate::sdk::chat::ChatCore;
use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use az_core::{ConversationMessage, ImageAttachment};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MultimodalAdapter {
    core: ChatCore,
}

impl MultimodalAdapter {
    pub fn new() -> Self {
        Self { core: ChatCore::new() }
    }

    pub fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self { core: ChatCore::with_client(client) }
    }
}

impl Default for MultimodalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for MultimodalAdapter {
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        self.core.run_loop(turn, events, cancel, true).await
    }

    fn messages(&self) -> Option<Vec<ConversationMessage>> {
        Some(self.core.messages())
    }

    fn restore(&self, messages: Vec<ConversationMessage>) {
        self.core.restore(messages);
    }

    fn set_attachments(&self, images: Vec<ImageAttachment>) {
        self.core.stage_images(images);
    }
}
