//! SDK-driven adapters: in-process tool-calling loops over a chat API.

pub mod chat;
pub mod context;
pub mod mcp;
pub mod multimodal;
