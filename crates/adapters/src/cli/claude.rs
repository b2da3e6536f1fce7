//! Line dispatcher for the claude stream-json format.

use super::CliEvent;
use az_core::{ChunkKind, OutputChunk, TokenUsage};
use serde_json::Value;

pub(crate) fn parse(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    match json.get("type").and_then(Value::as_str) {
        Some("stream_event") => parse_stream_event(json, at_ms),
        Some("assistant") => parse_assistant(json, at_ms),
        Some("user") => parse_user(json, at_ms),
        Some("system") => parse_system(json),
        Some("result") => parse_result(json),
        _ => Vec::new(),
    }
}

/// `{type:"stream_event", event:{type:"content_block_delta", delta:{type:"text_delta", text}}}`
fn parse_stream_event(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let Some(event) = json.get("event") else {
        return Vec::new();
    };
    if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return Vec::new();
    }
    let Some(delta) = event.get("delta") else {
        return Vec::new();
    };
    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => delta
            .get("text")
            .and_then(Value::as_str)
            .map(|text| vec![CliEvent::Chunk(OutputChunk::text(text, at_ms))])
            .unwrap_or_default(),
        Some("thinking_delta") => delta
            .get("thinking")
            .and_then(Value::as_str)
            .map(|text| vec![CliEvent::Chunk(OutputChunk::new(ChunkKind::Thinking, text, at_ms))])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// `{type:"assistant", message:{content:[...]}}` — iterate content blocks.
fn parse_assistant(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let Some(blocks) = json
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    let mut events = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    events.push(CliEvent::Chunk(OutputChunk::text(text, at_ms)));
                }
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    events.push(CliEvent::Chunk(OutputChunk::new(
                        ChunkKind::Thinking,
                        text,
                        at_ms,
                    )));
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("unknown");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let mut chunk = OutputChunk::new(
                    ChunkKind::ToolUse,
                    serde_json::to_string(&input).unwrap_or_default(),
                    at_ms,
                )
                .with_meta("tool", name);
                if let Some(path) = input
                    .get("path")
                    .or_else(|| input.get("file_path"))
                    .and_then(Value::as_str)
                {
                    chunk = chunk.with_meta("path", path);
                }
                events.push(CliEvent::Chunk(chunk));
            }
            _ => {}
        }
    }
    events
}

/// `{type:"user", message:{content:[{type:"tool_result", ...}]}}`
fn parse_user(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let Some(blocks) = json.pointer("/message/content").and_then(Value::as_array) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(|block| {
            let content = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => serde_json::to_string(other).unwrap_or_default(),
                None => String::new(),
            };
            let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            CliEvent::Chunk(
                OutputChunk::new(ChunkKind::ToolResult, content, at_ms)
                    .with_meta("success", !is_error),
            )
        })
        .collect()
}

/// `{type:"system", subtype:"init", session_id}` — record the backend id.
fn parse_system(json: &Value) -> Vec<CliEvent> {
    if json.get("subtype").and_then(Value::as_str) != Some("init") {
        return Vec::new();
    }
    json.get("session_id")
        .and_then(Value::as_str)
        .map(|id| vec![CliEvent::SessionId(id.to_string())])
        .unwrap_or_default()
}

/// `{type:"result", is_error, result, usage}` — final record of a turn.
fn parse_result(json: &Value) -> Vec<CliEvent> {
    let mut events = Vec::new();
    if json.get("is_error").and_then(Value::as_bool).unwrap_or(false) {
        let message = json
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("backend reported an error")
            .to_string();
        events.push(CliEvent::ReportedError(message));
    }
    if let Some(usage) = json.get("usage") {
        let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
        if input > 0 || output > 0 {
            events.push(CliEvent::Tokens(TokenUsage { input, output }));
        }
    }
    events
}

#[cfg(test)]
#[path = "claude_tests.rs"]
mod tests;
