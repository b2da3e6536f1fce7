//! Line dispatcher for the codex exec JSON format.

use super::CliEvent;
use az_core::{ChunkKind, OutputChunk, TokenUsage};
use serde_json::Value;

pub(crate) fn parse(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let Some(kind) = json.get("type").and_then(Value::as_str) else {
        return Vec::new();
    };

    // Any record type mentioning approval pauses the turn
    if kind.contains("approval") {
        return vec![CliEvent::WaitingApproval];
    }

    match kind {
        "thread.started" => json
            .get("thread_id")
            .and_then(Value::as_str)
            .map(|id| vec![CliEvent::SessionId(id.to_string())])
            .unwrap_or_default(),
        "item.started" | "item.completed" => parse_item(json, at_ms),
        "turn.completed" => parse_usage(json),
        "error" => {
            let message = json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend reported an error")
                .to_string();
            vec![CliEvent::ReportedError(message)]
        }
        _ => Vec::new(),
    }
}

fn parse_item(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let Some(item) = json.get("item") else {
        return Vec::new();
    };
    let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
    match item.get("type").and_then(Value::as_str) {
        Some("agent_message") if !text.is_empty() => {
            vec![CliEvent::Chunk(OutputChunk::text(text, at_ms))]
        }
        Some("reasoning") if !text.is_empty() => {
            vec![CliEvent::Chunk(OutputChunk::new(ChunkKind::Thinking, text, at_ms))]
        }
        Some("command_execution") => {
            let command = item.get("command").and_then(Value::as_str).unwrap_or_default();
            vec![CliEvent::Chunk(
                OutputChunk::new(ChunkKind::ToolUse, command, at_ms).with_meta("tool", "exec_command"),
            )]
        }
        Some("file_change") => {
            let path = item.get("path").and_then(Value::as_str).unwrap_or_default();
            vec![CliEvent::Chunk(
                OutputChunk::new(ChunkKind::ToolUse, path, at_ms)
                    .with_meta("tool", "apply_patch")
                    .with_meta("path", path),
            )]
        }
        _ => Vec::new(),
    }
}

fn parse_usage(json: &Value) -> Vec<CliEvent> {
    let Some(usage) = json.get("usage") else {
        return Vec::new();
    };
    let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    vec![CliEvent::Tokens(TokenUsage { input, output })]
}

#[cfg(test)]
#[path = "codex_tests.rs"]
mod tests;
