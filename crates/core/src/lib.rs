// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! az-core: Core library for the agentz session orchestrator

pub mod macros;

pub mod chunk;
pub mod clock;
pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod metadata;
pub mod session;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use chunk::{ChunkKind, ImageAttachment, OutputChunk};
pub use clock::{epoch_ms_to_iso, iso_to_epoch_ms, Clock, FakeClock, SystemClock};
pub use error::{ControlError, SpawnError};
pub use event::{RegistryEvent, SessionEvent, SessionPatch};
pub use id::{short, SessionId};
pub use message::{ConversationMessage, Role, ToolCallRef};
pub use metadata::{MetadataAnalyzer, SessionMetadata, ToolCategory};
#[cfg(any(test, feature = "test-support"))]
pub use session::SessionBuilder;
pub use session::{AgentKind, ResumeRecord, Session, SessionStatus, SpawnRequest, TokenUsage};
