// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! az-adapters: uniform wrappers over heterogeneous agent backends.
//!
//! Every backend — CLI subprocess or in-process SDK loop — presents the
//! same six-event surface ([`AdapterEvent`]) over an mpsc channel, with
//! cancellation threaded through a `CancellationToken`. An adapter that
//! cannot natively express one of the six events synthesizes it (e.g. the
//! CLI free-text approval heuristic).

mod adapter;
pub mod cli;
pub mod sdk;
pub mod security;
pub mod tools;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeAdapter, FakeStep};

pub use adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
pub use cli::{discover_binary, CliAdapter, CliProduct};
pub use sdk::chat::ChatAdapter;
pub use sdk::mcp::McpAdapter;
pub use sdk::multimodal::MultimodalAdapter;
pub use security::SecurityError;
pub use tools::ToolOutcome;
