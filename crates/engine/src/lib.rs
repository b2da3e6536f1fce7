// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! az-engine: the session lifecycle engine.
//!
//! The supervisor owns the registry of live sessions and the concurrency
//! cap; each session runs as its own tokio task driving one adapter. All
//! state transitions and chunks flow through the event bus, which makes
//! records durable before notifying subscribers.

mod bus;
mod config;
mod hooks;
mod logger;
mod recovery;
mod run;
mod supervisor;
mod worktree;

pub use bus::{EventBus, Notification, Subscriber};
pub use config::{log_filter, SupervisorConfig};
pub use hooks::{NoopHooks, TaskHooks};
pub use logger::SessionLogger;
pub use recovery::{probe_daemon, DAEMON_DIED};
pub use supervisor::{AdapterFactory, Supervisor};
pub use worktree::WorktreeManager;
