//! Line dispatcher for the opencode run JSON format.
//!
//! Records nest under `{sessionID, type, ...}`; the session id rides on
//! every record, so the dispatcher emits it whenever present and the
//! runner's event layer deduplicates.

use super::CliEvent;
use az_core::{ChunkKind, OutputChunk};
use serde_json::Value;

pub(crate) fn parse(json: &Value, at_ms: u64) -> Vec<CliEvent> {
    let mut events = Vec::new();
    if let Some(id) = json.get("sessionID").and_then(Value::as_str) {
        events.push(CliEvent::SessionId(id.to_string()));
    }

    match json.get("type").and_then(Value::as_str) {
        Some("message") => {
            let text = json
                .get("text")
                .or_else(|| json.pointer("/part/text"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !text.is_empty() {
                events.push(CliEvent::Chunk(OutputChunk::text(text, at_ms)));
            }
        }
        Some("tool_call") => {
            let tool = json.get("tool").and_then(Value::as_str).unwrap_or("unknown");
            let args = json.get("args").cloned().unwrap_or(Value::Null);
            let mut chunk = OutputChunk::new(
                ChunkKind::ToolUse,
                serde_json::to_string(&args).unwrap_or_default(),
                at_ms,
            )
            .with_meta("tool", tool);
            if let Some(path) = args
                .get("path")
                .or_else(|| args.get("file_path"))
                .and_then(Value::as_str)
            {
                chunk = chunk.with_meta("path", path);
            }
            events.push(CliEvent::Chunk(chunk));
        }
        Some("tool_result") => {
            let content = json.get("output").and_then(Value::as_str).unwrap_or_default();
            let success = !json.get("error").and_then(Value::as_bool).unwrap_or(false);
            events.push(CliEvent::Chunk(
                OutputChunk::new(ChunkKind::ToolResult, content, at_ms).with_meta("success", success),
            ));
        }
        Some("error") => {
            let message = json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend reported an error")
                .to_string();
            events.push(CliEvent::ReportedError(message));
        }
        // Unknown record types still surface the riding session id;
        // the engine deduplicates repeats.
        _ => {}
    }
    events
}

#[cfg(test)]
#[path = "opencode_tests.rs"]
mod tests;
