//! Tool executors for the SDK adapters.
//!
//! Three tools: `read_file`, `write_file`, `exec_command`. Every path goes
//! through the security gate; failures come back as unsuccessful outcomes
//! so the tool-calling loop continues.

use crate::security;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;

/// Maximum bytes `read_file` returns.
pub const MAX_READ_BYTES: u64 = 50 * 1024;
/// Wall-clock bound on `exec_command`.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one tool execution, destined for a `tool_result` chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub content: String,
    pub success: bool,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), success: true }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self { content: content.into(), success: false }
    }
}

/// JSON-schema descriptions of the built-in tools, for the chat API.
pub fn tool_schemas() -> Vec<(&'static str, &'static str, Value)> {
    vec![
        (
            "read_file",
            "Read a file from the working directory. Returns at most 50 KB.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the working directory"}
                },
                "required": ["path"]
            }),
        ),
        (
            "write_file",
            "Write a file inside the working directory, creating parent directories.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the working directory"},
                    "content": {"type": "string", "description": "Full file content to write"}
                },
                "required": ["path", "content"]
            }),
        ),
        (
            "exec_command",
            "Run a shell command in the working directory. 30 second timeout.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Command line to execute"}
                },
                "required": ["command"]
            }),
        ),
    ]
}

/// Execute a built-in tool by name.
pub async fn execute(name: &str, args: &Value, working_dir: &Path) -> ToolOutcome {
    match name {
        "read_file" => read_file(args, working_dir).await,
        "write_file" => write_file(args, working_dir).await,
        "exec_command" => exec_command(args, working_dir).await,
        other => ToolOutcome::err(format!("unknown tool: {other}")),
    }
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolOutcome> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolOutcome::err(format!("missing required parameter '{key}'")))
}

async fn read_file(args: &Value, working_dir: &Path) -> ToolOutcome {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(outcome) => return outcome,
    };
    let resolved = match security::resolve_within(working_dir, path) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::err(e.to_string()),
    };
    match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.len() > MAX_READ_BYTES => {
            return ToolOutcome::err(format!(
                "file too large: {} bytes (limit {MAX_READ_BYTES})",
                meta.len()
            ));
        }
        Ok(_) => {}
        Err(e) => return ToolOutcome::err(format!("stat error: {e}")),
    }
    match tokio::fs::read_to_string(&resolved).await {
        Ok(content) => ToolOutcome::ok(content),
        Err(e) => ToolOutcome::err(format!("read error: {e}")),
    }
}

async fn write_file(args: &Value, working_dir: &Path) -> ToolOutcome {
    let path = match require_str(args, "path") {
        Ok(p) => p,
        Err(outcome) => return outcome,
    };
    let content = match require_str(args, "content") {
        Ok(c) => c,
        Err(outcome) => return outcome,
    };
    let resolved = match security::resolve_within(working_dir, path) {
        Ok(p) => p,
        Err(e) => return ToolOutcome::err(e.to_string()),
    };
    if let Some(parent) = resolved.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return ToolOutcome::err(format!("mkdir error: {e}"));
        }
    }
    match tokio::fs::write(&resolved, content).await {
        Ok(()) => ToolOutcome::ok(format!("wrote {} bytes to {path}", content.len())),
        Err(e) => ToolOutcome::err(format!("write error: {e}")),
    }
}

async fn exec_command(args: &Value, working_dir: &Path) -> ToolOutcome {
    let command = match require_str(args, "command") {
        Ok(c) => c,
        Err(outcome) => return outcome,
    };
    if let Err(e) = security::check_command(command) {
        return ToolOutcome::err(e.to_string());
    }

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(working_dir).kill_on_drop(true);

    let run = async {
        match cmd.output().await {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut content = stdout.into_owned();
                if !stderr.is_empty() {
                    content.push_str("\n[stderr]\n");
                    content.push_str(&stderr);
                }
                if output.status.success() {
                    ToolOutcome::ok(content)
                } else {
                    ToolOutcome {
                        content: format!("exit status {}: {content}", output.status),
                        success: false,
                    }
                }
            }
            Err(e) => ToolOutcome::err(format!("spawn error: {e}")),
        }
    };

    match tokio::time::timeout(EXEC_TIMEOUT, run).await {
        Ok(outcome) => outcome,
        Err(_) => ToolOutcome::err(format!("command timed out after {}s", EXEC_TIMEOUT.as_secs())),
    }
}

#[cfg(test)]
#[path = "tools_tests.rs"]
mod tests;
