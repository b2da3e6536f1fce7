//! SDK chat adapter: an in-process tool-calling loop over the chat
//! completions API.
//!
//! Each turn appends the user message, then iterates: call the API with
//! the conversation and the built-in tool schema, stream text chunks,
//! execute tool calls (through the security gates), feed results back, and
//! stop when the model stops calling tools. Rate limits retry with
//! exponential backoff; context pressure warns and prunes per
//! [`super::context`].

use crate::adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use crate::sdk::context::{self, ContextAction, MAX_ITERATIONS};
use crate::tools;
use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessage,
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestToolMessage, ChatCompletionRequestUserMessage, ChatCompletionTool,
    ChatCompletionTools, CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    FinishReason, FunctionObject,
};
use async_openai::Client;
use async_trait::async_trait;
use az_core::{
    ChunkKind, Clock, ConversationMessage, ImageAttachment, OutputChunk, Role, SystemClock,
    TokenUsage, ToolCallRef,
};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Initial backoff after a rate-limit response.
const BACKOFF_INITIAL: Duration = Duration::from_secs(2);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Rate-limited attempts before giving up.
const BACKOFF_ATTEMPTS: u32 = 5;

const SYSTEM_PROMPT: &str = "You are a coding agent operating inside the user's repository. \
Use the provided tools to read, write, and execute; keep changes minimal and verify your work.";

/// Shared state of the chat-style adapters.
pub(crate) struct ChatCore {
    client: Client<OpenAIConfig>,
    messages: Mutex<Vec<ConversationMessage>>,
    staged_images: Mutex<Vec<ImageAttachment>>,
    warned: Mutex<bool>,
}

impl ChatCore {
    pub(crate) fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub(crate) fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self {
            client,
            messages: Mutex::new(Vec::new()),
            staged_images: Mutex::new(Vec::new()),
            warned: Mutex::new(false),
        }
    }

    pub(crate) fn messages(&self) -> Vec<ConversationMessage> {
        self.messages.lock().clone()
    }

    pub(crate) fn restore(&self, messages: Vec<ConversationMessage>) {
        *self.messages.lock() = messages;
    }

    pub(crate) fn stage_images(&self, images: Vec<ImageAttachment>) {
        self.staged_images.lock().extend(images);
    }

    /// The tool-calling loop shared by the chat and multimodal adapters.
    pub(crate) async fn run_loop(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
        accept_images: bool,
    ) -> Result<(), AdapterError> {
        let clock = SystemClock;
        let limit = az_core::metadata::context_limit_for(&turn.model);

        let images = if accept_images {
            let mut staged: Vec<ImageAttachment> = self.staged_images.lock().drain(..).collect();
            staged.extend(turn.images.clone());
            staged
        } else {
            Vec::new()
        };

        {
            let mut messages = self.messages.lock();
            if messages.is_empty() {
                messages.push(ConversationMessage::system(SYSTEM_PROMPT));
            }
            messages.push(ConversationMessage::user(&turn.prompt));
        }

        let mut total = TokenUsage::default();
        let mut first_call = true;

        for _ in 0..MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(AdapterError::Aborted);
            }

            // Context pressure: warn once per crossing, prune at 90%
            let action = {
                let mut messages = self.messages.lock();
                let mut warned = self.warned.lock();
                context::manage(&mut messages, limit, &mut warned)
            };
            match action {
                ContextAction::Warn { estimated, limit } => {
                    let _ = events
                        .send(AdapterEvent::Output(OutputChunk::system(
                            format!(
                                "context window at {}% ({estimated} of {limit} tokens)",
                                estimated * 100 / limit.max(1)
                            ),
                            clock.epoch_ms(),
                        )))
                        .await;
                }
                ContextAction::Pruned { dropped } => {
                    let _ = events
                        .send(AdapterEvent::Output(OutputChunk::system(
                            format!("pruned {dropped} old messages to fit the context window"),
                            clock.epoch_ms(),
                        )))
                        .await;
                }
                ContextAction::None => {}
            }

            let request = {
                let messages = self.messages.lock();
                let images = if first_call { images.as_slice() } else { &[] };
                build_request(&turn.model, &messages, images)?
            };
            first_call = false;

            let response = call_with_retry(&self.client, request, &cancel, &events, &clock).await;
            let response = match response {
                Ok(response) => response,
                Err(AdapterError::RuntimeFailed(message)) => {
                    let _ = events.send(AdapterEvent::Error(message)).await;
                    return Ok(());
                }
                Err(other) => return Err(other),
            };

            if let Some(usage) = &response.usage {
                total.input += usage.prompt_tokens as u64;
                total.output += usage.completion_tokens as u64;
            }

            let Some(choice) = response.choices.into_iter().next() else {
                let _ = events
                    .send(AdapterEvent::Error("model returned no choices".to_string()))
                    .await;
                return Ok(());
            };

            let content = choice.message.content.clone().unwrap_or_default();
            if !content.is_empty() {
                let _ = events
                    .send(AdapterEvent::Output(OutputChunk::text(&content, clock.epoch_ms())))
                    .await;
            }

            let tool_calls: Vec<(String, String, String)> = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .filter_map(|tc| match tc {
                    ChatCompletionMessageToolCalls::Function(f) => {
                        Some((f.id, f.function.name, f.function.arguments))
                    }
                    _ => None,
                })
                .collect();

            {
                let mut messages = self.messages.lock();
                let mut assistant = ConversationMessage::assistant(&content);
                assistant.tool_calls = tool_calls
                    .iter()
                    .map(|(id, name, arguments)| ToolCallRef {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: arguments.clone(),
                    })
                    .collect();
                messages.push(assistant);
            }

            if tool_calls.is_empty() {
                break;
            }
            let finished = choice.finish_reason == Some(FinishReason::Stop);

            for (call_id, name, arguments) in tool_calls {
                if cancel.is_cancelled() {
                    return Err(AdapterError::Aborted);
                }
                let args: serde_json::Value =
                    serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null);

                let mut use_chunk =
                    OutputChunk::new(ChunkKind::ToolUse, arguments.clone(), clock.epoch_ms())
                        .with_meta("tool", name.as_str());
                if let Some(path) = args
                    .get("path")
                    .or_else(|| args.get("file_path"))
                    .and_then(|v| v.as_str())
                {
                    use_chunk = use_chunk.with_meta("path", path);
                }
                let _ = events.send(AdapterEvent::Output(use_chunk)).await;

                let outcome = tools::execute(&name, &args, &turn.working_dir).await;
                let _ = events
                    .send(AdapterEvent::Output(
                        OutputChunk::new(
                            ChunkKind::ToolResult,
                            outcome.content.clone(),
                            clock.epoch_ms(),
                        )
                        .with_meta("tool", name.as_str())
                        .with_meta("success", outcome.success),
                    ))
                    .await;

                self.messages.lock().push(ConversationMessage::tool(call_id, outcome.content));
            }

            if finished {
                break;
            }
        }

        let _ = events.send(AdapterEvent::Complete { tokens: total }).await;
        Ok(())
    }
}

/// SDK chat adapter (text only; images are accepted by the multimodal
/// variant).
pub struct ChatAdapter {
    pub(crate) core: ChatCore,
}

impl ChatAdapter {
    pub fn new() -> Self {
        Self { core: ChatCore::new() }
    }

    pub fn with_client(client: Client<OpenAIConfig>) -> Self {
        Self { core: ChatCore::with_client(client) }
    }
}

impl Default for ChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentAdapter for ChatAdapter {
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        self.core.run_loop(turn, events, cancel, false).await
    }

    fn messages(&self) -> Option<Vec<ConversationMessage>> {
        Some(self.core.messages())
    }

    fn restore(&self, messages: Vec<ConversationMessage>) {
        self.core.restore(messages);
    }
}

/// Call the chat API, retrying rate limits with exponential backoff.
pub(crate) async fn call_with_retry(
    client: &Client<OpenAIConfig>,
    request: CreateChatCompletionRequest,
    cancel: &CancellationToken,
    events: &mpsc::Sender<AdapterEvent>,
    clock: &SystemClock,
) -> Result<async_openai::types::chat::CreateChatCompletionResponse, AdapterError> {
    let mut delay = BACKOFF_INITIAL;
    let mut attempt = 0;
    loop {
        let chat = client.chat();
        let call = chat.create(request.clone());
        let result = tokio::select! {
            result = call => result,
            _ = cancel.cancelled() => return Err(AdapterError::Aborted),
        };
        match result {
            Ok(response) => return Ok(response),
            Err(err) if is_rate_limited(&err) => {
                attempt += 1;
                if attempt >= BACKOFF_ATTEMPTS {
                    return Err(AdapterError::RuntimeFailed(format!(
                        "rate limited after {BACKOFF_ATTEMPTS} attempts: {err}"
                    )));
                }
                let _ = events
                    .send(AdapterEvent::Output(OutputChunk::system(
                        format!("rate limited; retrying in {}s", delay.as_secs()),
                        clock.epoch_ms(),
                    )))
                    .await;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(AdapterError::Aborted),
                }
                delay = (delay * 2).min(BACKOFF_CAP);
            }
            Err(err) => {
                return Err(AdapterError::RuntimeFailed(format!("chat API error: {err}")));
            }
        }
    }
}

/// HTTP 429 in any of its disguises.
fn is_rate_limited(err: &OpenAIError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("429") || text.contains("rate limit") || text.contains("rate_limit")
}

/// Convert the conversation into an API request with the built-in tools.
/// `images` attach to the final user message (the current prompt).
pub(crate) fn build_request(
    model: &str,
    messages: &[ConversationMessage],
    images: &[ImageAttachment],
) -> Result<CreateChatCompletionRequest, AdapterError> {
    let builtins = tools::tool_schemas()
        .into_iter()
        .map(|(name, description, parameters)| {
            (name.to_string(), description.to_string(), parameters)
        })
        .collect::<Vec<_>>();
    build_request_with_tools(model, messages, images, &builtins)
}

/// As [`build_request`], with an explicit tool schema (the MCP adapter
/// discovers its tools at runtime).
pub(crate) fn build_request_with_tools(
    model: &str,
    messages: &[ConversationMessage],
    images: &[ImageAttachment],
    tool_schemas: &[(String, String, serde_json::Value)],
) -> Result<CreateChatCompletionRequest, AdapterError> {
    let last_user = messages.iter().rposition(|m| m.role == Role::User);
    let request_messages: Vec<ChatCompletionRequestMessage> = messages
        .iter()
        .enumerate()
        .map(|(i, message)| {
            let with_images = Some(i) == last_user && !images.is_empty();
            to_request_message(message, if with_images { images } else { &[] })
        })
        .collect();

    let chat_tools: Vec<ChatCompletionTools> = tool_schemas
        .iter()
        .map(|(name, description, parameters)| {
            ChatCompletionTools::Function(ChatCompletionTool {
                function: FunctionObject {
                    name: name.clone(),
                    description: Some(description.clone()),
                    parameters: Some(parameters.clone()),
                    ..Default::default()
                },
            })
        })
        .collect();

    let mut args = CreateChatCompletionRequestArgs::default();
    args.model(model);
    args.messages(request_messages);
    args.tools(chat_tools);
    args.build()
        .map_err(|e| AdapterError::RuntimeFailed(format!("request build failed: {e}")))
}

fn to_request_message(
    message: &ConversationMessage,
    images: &[ImageAttachment],
) -> ChatCompletionRequestMessage {
    match message.role {
        Role::System => ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessage::from(message.content.as_str()),
        ),
        Role::User => {
            if images.is_empty() {
                ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(
                    message.content.as_str(),
                ))
            } else {
                // Multimodal user message: text part plus data-URL images
                let mut parts = vec![serde_json::json!({
                    "type": "text",
                    "text": message.content,
                })];
                for image in images {
                    parts.push(serde_json::json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.mime_type, image.data)
                        }
                    }));
                }
                match serde_json::from_value::<ChatCompletionRequestUserMessage>(
                    serde_json::json!({"content": parts}),
                ) {
                    Ok(user) => ChatCompletionRequestMessage::User(user),
                    Err(_) => ChatCompletionRequestMessage::User(
                        ChatCompletionRequestUserMessage::from(message.content.as_str()),
                    ),
                }
            }
        }
        Role::Assistant => {
            // Built over the wire shape, which is stable across SDK
            // revisions of the request structs
            let mut body = serde_json::Map::new();
            if !message.content.is_empty() {
                body.insert("content".to_string(), message.content.clone().into());
            }
            if !message.tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        serde_json::json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.arguments},
                        })
                    })
                    .collect();
                body.insert("tool_calls".to_string(), calls.into());
            }
            match serde_json::from_value::<ChatCompletionRequestAssistantMessage>(
                serde_json::Value::Object(body),
            ) {
                Ok(assistant) => ChatCompletionRequestMessage::Assistant(assistant),
                Err(_) => {
                    ChatCompletionRequestMessage::Assistant(message.content.as_str().into())
                }
            }
        }
        Role::Tool => {
            let tool_call_id = message.tool_call_id.clone().unwrap_or_default();
            match serde_json::from_value::<ChatCompletionRequestToolMessage>(serde_json::json!({
                "content": message.content,
                "tool_call_id": tool_call_id,
            })) {
                Ok(tool) => ChatCompletionRequestMessage::Tool(tool),
                Err(_) => {
                    // A tool result the SDK cannot represent degrades to a
                    // user message carrying the same content
                    ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage::from(
                        message.content.as_str(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "chat_tests.rs"]
mod tests;
