//! Output chunk types — one immutable unit of observable agent output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of an output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Thinking,
    ToolUse,
    ToolResult,
    UserMessage,
    System,
    Error,
}

crate::simple_display! {
    ChunkKind {
        Text => "text",
        Thinking => "thinking",
        ToolUse => "tool_use",
        ToolResult => "tool_result",
        UserMessage => "user_message",
        System => "system",
        Error => "error",
    }
}

/// Image attached to a `user_message` chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub mime_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// One unit of observable agent output. Immutable once appended.
///
/// `meta` carries scalar annotations; recognized keys include `tool`,
/// `toolName`, `path`, and `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub kind: ChunkKind,
    pub content: String,
    pub at_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    /// Only populated on `user_message` chunks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

impl OutputChunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>, at_ms: u64) -> Self {
        Self { kind, content: content.into(), at_ms, meta: BTreeMap::new(), images: Vec::new() }
    }

    pub fn text(content: impl Into<String>, at_ms: u64) -> Self {
        Self::new(ChunkKind::Text, content, at_ms)
    }

    pub fn error(content: impl Into<String>, at_ms: u64) -> Self {
        Self::new(ChunkKind::Error, content, at_ms)
    }

    pub fn system(content: impl Into<String>, at_ms: u64) -> Self {
        Self::new(ChunkKind::System, content, at_ms)
    }

    /// Attach a scalar metadata value.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_images(mut self, images: Vec<ImageAttachment>) -> Self {
        self.images = images;
        self
    }

    /// Tool name, from either the `tool` or `toolName` metadata key.
    pub fn tool_name(&self) -> Option<&str> {
        self.meta
            .get("tool")
            .or_else(|| self.meta.get("toolName"))
            .and_then(|v| v.as_str())
    }

    /// Path annotation, if any.
    pub fn path(&self) -> Option<&str> {
        self.meta.get("path").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
#[path = "chunk_tests.rs"]
mod tests;
