//! Shared helpers for tests across the workspace.

use crate::chunk::{ChunkKind, OutputChunk};

/// A tool_use chunk naming a tool and a path, as adapters emit them.
pub fn tool_use_chunk(tool: &str, path: &str, at_ms: u64) -> OutputChunk {
    OutputChunk::new(ChunkKind::ToolUse, "", at_ms)
        .with_meta("tool", tool)
        .with_meta("path", path)
}

/// A tool_result chunk with the given success flag.
pub fn tool_result_chunk(tool: &str, success: bool, at_ms: u64) -> OutputChunk {
    OutputChunk::new(ChunkKind::ToolResult, "", at_ms)
        .with_meta("tool", tool)
        .with_meta("success", success)
}
