//! SDK MCP adapter: a QA-oriented tool loop whose tools are discovered at
//! runtime from configured remote MCP servers.
//!
//! On first run it loads `~/.agentz/mcp.json` (path overridable via
//! `AGENTZ_MCP_CONFIG`), validates each server against the hostname
//! blacklist (pre- and post-DNS), skips OAuth servers, and lists tools
//! from the rest. Tools are keyed `server__tool`. Execution proxies
//! JSON-RPC through a capped connection pool (≤3 per server, ≤10 total,
//! idle clients evicted after 5 minutes). A full pool fails the tool, not
//! the session.

use crate::adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use crate::sdk::chat::{build_request_with_tools, call_with_retry};
use crate::sdk::context::{self, ContextAction, MAX_ITERATIONS};
use crate::security;
use crate::tools::ToolOutcome;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::ChatCompletionMessageToolCalls;
use async_openai::Client;
use async_trait::async_trait;
use az_core::{
    ChunkKind, Clock, ConversationMessage, OutputChunk, SystemClock, TokenUsage, ToolCallRef,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// In-flight request cap per server.
const PER_SERVER_CONNECTIONS: usize = 3;
/// In-flight request cap across all servers.
const TOTAL_CONNECTIONS: usize = 10;
/// Idle clients older than this are evicted.
const IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);

const SYSTEM_PROMPT: &str = "You are a QA agent. Use the available remote tools to inspect and \
verify the system under test; report findings precisely.";

/// One configured MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServer {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// The well-known config file shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: Vec<McpServer>,
}

impl McpConfig {
    /// Resolve the config path: env override, then `~/.agentz/mcp.json`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("AGENTZ_MCP_CONFIG") {
            return PathBuf::from(path);
        }
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(".agentz").join("mcp.json")
    }

    pub async fn load(path: &PathBuf) -> Result<Self, AdapterError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            AdapterError::LaunchFailed(format!("cannot read MCP config {}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            AdapterError::LaunchFailed(format!("invalid MCP config {}: {e}", path.display()))
        })
    }
}

/// A discovered remote tool, addressed as `server__tool`.
#[derive(Debug, Clone)]
pub(crate) struct McpTool {
    pub server: String,
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

impl McpTool {
    fn key(&self) -> String {
        format!("{}__{}", self.server, self.name)
    }
}

/// Capped JSON-RPC connection pool.
struct ConnectionPool {
    global: Arc<Semaphore>,
    per_server: Mutex<HashMap<String, Arc<Semaphore>>>,
    clients: Mutex<HashMap<String, (reqwest::Client, Instant)>>,
}

impl ConnectionPool {
    fn new() -> Self {
        Self {
            global: Arc::new(Semaphore::new(TOTAL_CONNECTIONS)),
            per_server: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn server_semaphore(&self, server: &str) -> Arc<Semaphore> {
        self.per_server
            .lock()
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(PER_SERVER_CONNECTIONS)))
            .clone()
    }

    /// Reuse or create the client for a server, evicting idle ones.
    fn client_for(&self, server: &str) -> reqwest::Client {
        let mut clients = self.clients.lock();
        let now = Instant::now();
        clients.retain(|_, (_, last_used)| now.duration_since(*last_used) < IDLE_EVICTION);
        let (client, last_used) =
            clients.entry(server.to_string()).or_insert_with(|| (reqwest::Client::new(), now));
        *last_used = now;
        client.clone()
    }
}

/// SDK MCP adapter.
pub struct McpAdapter {
    client: Client<OpenAIConfig>,
    config_path: PathBuf,
    messages: Mutex<Vec<ConversationMessage>>,
    warned: Mutex<bool>,
    pool: ConnectionPool,
    /// Discovered tools; populated on first run.
    discovered: tokio::sync::Mutex<Option<Arc<DiscoveredTools>>>,
    rpc_counter: std::sync::atomic::AtomicU64,
}

struct DiscoveredTools {
    tools: Vec<McpTool>,
    servers: HashMap<String, McpServer>,
}

impl McpAdapter {
    pub fn new() -> Self {
        Self::with_config_path(McpConfig::default_path())
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self {
            client: Client::new(),
            config_path,
            messages: Mutex::new(Vec::new()),
            warned: Mutex::new(false),
            pool: ConnectionPool::new(),
            discovered: tokio::sync::Mutex::new(None),
            rpc_counter: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Load config, validate servers, and list tools (first run only).
    async fn ensure_discovered(&self) -> Result<Arc<DiscoveredTools>, AdapterError> {
        let mut guard = self.discovered.lock().await;
        if let Some(tools) = guard.as_ref() {
            return Ok(Arc::clone(tools));
        }

        let config = McpConfig::load(&self.config_path).await?;
        let mut tools = Vec::new();
        let mut servers = HashMap::new();

        for server in config.servers {
            if server.auth.as_deref() == Some("oauth") {
                tracing::info!(server = %server.name, "skipping OAuth MCP server");
                continue;
            }
            if let Err(e) = validate_server(&server).await {
                tracing::warn!(server = %server.name, error = %e, "skipping blacklisted MCP server");
                continue;
            }
            match self.list_tools(&server).await {
                Ok(listed) => {
                    tracing::info!(server = %server.name, tools = listed.len(), "MCP server tools listed");
                    tools.extend(listed);
                    servers.insert(server.name.clone(), server);
                }
                Err(e) => {
                    tracing::warn!(server = %server.name, error = %e, "MCP tools/list failed; skipping server");
                }
            }
        }

        let discovered = Arc::new(DiscoveredTools { tools, servers });
        *guard = Some(Arc::clone(&discovered));
        Ok(discovered)
    }

    fn next_rpc_id(&self) -> u64 {
        self.rpc_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn rpc(
        &self,
        server: &McpServer,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let client = self.pool.client_for(&server.name);
        let mut request = client.post(&server.url).json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_rpc_id(),
            "method": method,
            "params": params,
        }));
        for (key, value) in &server.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.map_err(|e| format!("request failed: {e}"))?;
        let body: serde_json::Value =
            response.json().await.map_err(|e| format!("invalid JSON-RPC response: {e}"))?;
        if let Some(error) = body.get("error") {
            return Err(format!("JSON-RPC error: {error}"));
        }
        Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn list_tools(&self, server: &McpServer) -> Result<Vec<McpTool>, String> {
        let result = self.rpc(server, "tools/list", serde_json::json!({})).await?;
        let listed = result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(listed
            .into_iter()
            .filter_map(|tool| {
                let name = tool.get("name")?.as_str()?.to_string();
                Some(McpTool {
                    server: server.name.clone(),
                    name,
                    description: tool
                        .get("description")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                })
            })
            .collect())
    }

    /// Execute one remote tool through the capped pool.
    async fn execute_tool(
        &self,
        discovered: &DiscoveredTools,
        key: &str,
        args: &serde_json::Value,
    ) -> ToolOutcome {
        let Some(tool) = discovered.tools.iter().find(|t| t.key() == key) else {
            return ToolOutcome::err(format!("unknown tool: {key}"));
        };
        let Some(server) = discovered.servers.get(&tool.server) else {
            return ToolOutcome::err(format!("unknown server: {}", tool.server));
        };

        // Pool caps: a saturated pool fails the tool, not the session
        let Ok(_global) = Arc::clone(&self.pool.global).try_acquire_owned() else {
            return ToolOutcome::err("connection pool exhausted (total cap)");
        };
        let Ok(_server_permit) = self.pool.server_semaphore(&tool.server).try_acquire_owned()
        else {
            return ToolOutcome::err(format!("connection pool exhausted for {}", tool.server));
        };

        let result = self
            .rpc(
                server,
                "tools/call",
                serde_json::json!({"name": tool.name, "arguments": args}),
            )
            .await;
        match result {
            Ok(result) => {
                let text = result
                    .get("content")
                    .and_then(|c| c.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| result.to_string());
                let is_error =
                    result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false);
                ToolOutcome { content: text, success: !is_error }
            }
            Err(e) => ToolOutcome::err(e),
        }
    }
}

impl Default for McpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Blacklist gate for one server, pre- and post-DNS.
async fn validate_server(server: &McpServer) -> Result<(), String> {
    let url = reqwest::Url::parse(&server.url).map_err(|e| format!("invalid url: {e}"))?;
    let host = url.host_str().ok_or("url has no host")?.to_string();
    security::check_host(&host).map_err(|e| e.to_string())?;

    // Post-DNS: every resolved address must pass
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|e| format!("DNS resolution failed: {e}"))?;
    for addr in addrs {
        security::check_ip(addr.ip()).map_err(|e| e.to_string())?;
    }
    Ok(())
}

#[async_trait]
impl AgentAdapter for McpAdapter {
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        let clock = SystemClock;
        let limit = az_core::metadata::context_limit_for(&turn.model);
        let discovered = self.ensure_discovered().await?;
        let tool_schemas: Vec<(String, String, serde_json::Value)> = discovered
            .tools
            .iter()
            .map(|t| (t.key(), t.description.clone(), t.schema.clone()))
            .collect();

        {
            let mut messages = self.messages.lock();
            if messages.is_empty() {
                messages.push(ConversationMessage::system(SYSTEM_PROMPT));
            }
            messages.push(ConversationMessage::user(&turn.prompt));
        }

        let mut total = TokenUsage::default();
        for _ in 0..MAX_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(AdapterError::Aborted);
            }

            let action = {
                let mut messages = self.messages.lock();
                let mut warned = self.warned.lock();
                context::manage(&mut messages, limit, &mut warned)
            };
            if let ContextAction::Pruned { dropped } = action {
                let _ = events
                    .send(AdapterEvent::Output(OutputChunk::system(
                        format!("pruned {dropped} old messages to fit the context window"),
                        clock.epoch_ms(),
                    )))
                    .await;
            }

            let request = {
                let messages = self.messages.lock();
                build_request_with_tools(&turn.model, &messages, &[], &tool_schemas)?
            };
            let response = match call_with_retry(&self.client, request, &cancel, &events, &clock)
                .await
            {
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

            for (call_id, key, arguments) in tool_calls {
                if cancel.is_cancelled() {
                    return Err(AdapterError::Aborted);
                }
                let args: serde_json::Value =
                    serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null);

                let _ = events
                    .send(AdapterEvent::Output(
                        OutputChunk::new(ChunkKind::ToolUse, arguments.clone(), clock.epoch_ms())
                            .with_meta("tool", key.as_str()),
                    ))
                    .await;

                let outcome = self.execute_tool(&discovered, &key, &args).await;
                let _ = events
                    .send(AdapterEvent::Output(
                        OutputChunk::new(
                            ChunkKind::ToolResult,
                            outcome.content.clone(),
                            clock.epoch_ms(),
                        )
                        .with_meta("tool", key.as_str())
                        .with_meta("success", outcome.success),
                    ))
                    .await;

                self.messages.lock().push(ConversationMessage::tool(call_id, outcome.content));
            }
        }

        let _ = events.send(AdapterEvent::Complete { tokens: total }).await;
        Ok(())
    }

    fn messages(&self) -> Option<Vec<ConversationMessage>> {
        Some(self.messages.lock().clone())
    }

    fn restore(&self, messages: Vec<ConversationMessage>) {
        *self.messages.lock() = messages;
    }
}

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod tests;
