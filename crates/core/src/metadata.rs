//! Derived session metadata, folded from the chunk stream.
//!
//! The analyzer is a passive observer: it never mutates the stream, only
//! maintains counters, the per-tool histogram, the edited-files list, and a
//! context-window estimate that actual token counts replace on completion.

use crate::chunk::{ChunkKind, OutputChunk};
use crate::session::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Assumed token cost of the system prompt before any output is observed.
pub const SYSTEM_PROMPT_BASELINE: u64 = 2_000;

/// Context-window size for a model name, with a conservative default.
pub fn context_limit_for(model: &str) -> u64 {
    let model = model.to_ascii_lowercase();
    if model.starts_with("claude") {
        200_000
    } else if model.starts_with("gpt-5") || model.starts_with("o3") {
        400_000
    } else if model.starts_with("gpt-4o") || model.starts_with("gpt-4-turbo") {
        128_000
    } else {
        128_000
    }
}

/// Coarse classification of a tool by what it does to the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
    Execute,
    Other,
}

impl ToolCategory {
    /// Classify by lowercase substring rules.
    pub fn classify(tool: &str) -> Self {
        let tool = tool.to_ascii_lowercase();
        if ["write", "edit", "create", "delete", "patch", "mkdir", "move", "rename"]
            .iter()
            .any(|s| tool.contains(s))
        {
            Self::Write
        } else if ["exec", "bash", "shell", "command", "run", "terminal"]
            .iter()
            .any(|s| tool.contains(s))
        {
            Self::Execute
        } else if ["read", "cat", "grep", "glob", "search", "list", "find", "fetch", "get"]
            .iter()
            .any(|s| tool.contains(s))
        {
            Self::Read
        } else {
            Self::Other
        }
    }

    /// Whether a tool of this category edits files (drives `edited_files`).
    pub fn is_write_like(&self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Snapshot of derived metadata carried on the session entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub text_chunks: u32,
    #[serde(default)]
    pub thinking_chunks: u32,
    #[serde(default)]
    pub error_chunks: u32,
    #[serde(default)]
    pub system_chunks: u32,
    #[serde(default)]
    pub tool_calls: u32,
    /// tool name → call count
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_histogram: BTreeMap<String, u32>,
    #[serde(default)]
    pub reads: u32,
    #[serde(default)]
    pub writes: u32,
    #[serde(default)]
    pub executes: u32,
    #[serde(default)]
    pub other_tools: u32,
    /// Paths written via write-like tools, in first-seen order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edited_files: Vec<String>,
    /// Estimated tokens in the context window; replaced by actual counts
    /// once the adapter reports them.
    #[serde(default)]
    pub estimated_tokens: u64,
    /// True once `estimated_tokens` reflects adapter-reported counts.
    #[serde(default)]
    pub tokens_actual: bool,
}

impl SessionMetadata {
    pub fn utilization_percent(&self, model_limit: u64) -> f64 {
        if model_limit == 0 {
            return 0.0;
        }
        self.estimated_tokens as f64 / model_limit as f64 * 100.0
    }
}

/// Passive observer that folds chunks into a [`SessionMetadata`].
#[derive(Debug, Clone, Default)]
pub struct MetadataAnalyzer {
    meta: SessionMetadata,
}

impl MetadataAnalyzer {
    pub fn new() -> Self {
        Self { meta: SessionMetadata { estimated_tokens: SYSTEM_PROMPT_BASELINE, ..Default::default() } }
    }

    /// Resume observation over metadata recovered from persistence.
    pub fn resume(meta: SessionMetadata) -> Self {
        Self { meta }
    }

    pub fn snapshot(&self) -> SessionMetadata {
        self.meta.clone()
    }

    /// Fold one chunk into the derived state.
    pub fn observe(&mut self, chunk: &OutputChunk) {
        match chunk.kind {
            ChunkKind::Text => {
                self.meta.text_chunks += 1;
                self.estimate_chars(chunk.content.len());
            }
            ChunkKind::Thinking => {
                self.meta.thinking_chunks += 1;
                self.estimate_chars(chunk.content.len());
            }
            ChunkKind::Error => self.meta.error_chunks += 1,
            ChunkKind::System => self.meta.system_chunks += 1,
            ChunkKind::ToolUse => self.observe_tool_use(chunk),
            ChunkKind::ToolResult | ChunkKind::UserMessage => {}
        }
    }

    /// Replace the estimate with adapter-reported token counts.
    pub fn set_actual_tokens(&mut self, tokens: TokenUsage) {
        self.meta.estimated_tokens = tokens.total();
        self.meta.tokens_actual = true;
    }

    fn estimate_chars(&mut self, chars: usize) {
        // Actual counts, once reported, are not overwritten by estimates.
        if !self.meta.tokens_actual {
            self.meta.estimated_tokens += (chars as u64).div_ceil(4);
        }
    }

    fn observe_tool_use(&mut self, chunk: &OutputChunk) {
        self.meta.tool_calls += 1;
        let Some(tool) = chunk.tool_name().map(str::to_string) else {
            self.meta.other_tools += 1;
            return;
        };
        *self.meta.tool_histogram.entry(tool.clone()).or_insert(0) += 1;

        let category = ToolCategory::classify(&tool);
        match category {
            ToolCategory::Read => self.meta.reads += 1,
            ToolCategory::Write => self.meta.writes += 1,
            ToolCategory::Execute => self.meta.executes += 1,
            ToolCategory::Other => self.meta.other_tools += 1,
        }

        if category.is_write_like() {
            if let Some(path) = chunk.path() {
                if !self.meta.edited_files.iter().any(|p| p == path) {
                    self.meta.edited_files.push(path.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "metadata_tests.rs"]
mod tests;
