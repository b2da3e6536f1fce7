// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! az-storage: durable streams, snapshot store, and the materialized
//! session index for the agentz orchestrator.
//!
//! The streams are canonical; the snapshot is a fast path that can always
//! be rebuilt by replay.

mod index;
pub mod paths;
mod snapshot;
mod store;
mod stream;

pub use index::{DaemonMark, SessionIndex};
pub use snapshot::{load_snapshot, rotate_bak_path, Snapshot, SnapshotError};
pub use store::{SessionStore, StoreHandle};
pub use stream::{RegistryLog, SessionLog, StreamError, StreamLog, StreamRecord};
