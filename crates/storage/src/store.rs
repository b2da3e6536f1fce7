//! Coalescing snapshot writer.
//!
//! State changes mark the store dirty; the background task flushes the
//! snapshot when a short window closes (200 ms) or enough chunks have
//! accumulated (32), whichever comes first. The snapshot is advisory —
//! a crash between flushes loses nothing, because the streams replay.

use crate::index::SessionIndex;
use crate::snapshot::Snapshot;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Maximum time a dirty snapshot waits before flushing.
const COALESCE_WINDOW: Duration = Duration::from_millis(200);
/// Chunk count that forces an early flush.
const COALESCE_MAX_CHUNKS: u32 = 32;

enum StoreMsg {
    Change,
    Chunk,
    Flush(oneshot::Sender<()>),
}

/// Handle for notifying the store task of state changes.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreMsg>,
}

impl StoreHandle {
    /// Mark the snapshot dirty after a non-chunk state change.
    pub fn note_change(&self) {
        let _ = self.tx.send(StoreMsg::Change);
    }

    /// Mark the snapshot dirty after an output chunk was appended.
    pub fn note_chunk(&self) {
        let _ = self.tx.send(StoreMsg::Chunk);
    }

    /// Force a flush and wait for it to complete.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StoreMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Background snapshot writer over a shared [`SessionIndex`].
pub struct SessionStore;

impl SessionStore {
    /// Spawn the writer task. Dropping every handle flushes once and stops.
    pub fn spawn(path: PathBuf, index: Arc<Mutex<SessionIndex>>) -> StoreHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut dirty = false;
            let mut pending_chunks: u32 = 0;
            let mut deadline: Option<Instant> = None;

            loop {
                let sleep_until = deadline.unwrap_or_else(|| {
                    // No deadline pending: park far in the future
                    Instant::now() + Duration::from_secs(3600)
                });
                tokio::select! {
                    msg = rx.recv() => match msg {
                        None => {
                            if dirty {
                                write_snapshot(&path, &index);
                            }
                            break;
                        }
                        Some(StoreMsg::Change) => {
                            dirty = true;
                            deadline.get_or_insert(Instant::now() + COALESCE_WINDOW);
                        }
                        Some(StoreMsg::Chunk) => {
                            dirty = true;
                            pending_chunks += 1;
                            deadline.get_or_insert(Instant::now() + COALESCE_WINDOW);
                            if pending_chunks >= COALESCE_MAX_CHUNKS {
                                write_snapshot(&path, &index);
                                dirty = false;
                                pending_chunks = 0;
                                deadline = None;
                            }
                        }
                        Some(StoreMsg::Flush(ack)) => {
                            if dirty {
                                write_snapshot(&path, &index);
                                dirty = false;
                                pending_chunks = 0;
                                deadline = None;
                            }
                            let _ = ack.send(());
                        }
                    },
                    _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                        write_snapshot(&path, &index);
                        dirty = false;
                        pending_chunks = 0;
                        deadline = None;
                    }
                }
            }
        });
        StoreHandle { tx }
    }
}

fn write_snapshot(path: &PathBuf, index: &Arc<Mutex<SessionIndex>>) {
    let snapshot = {
        let guard = index.lock();
        Snapshot { sessions: guard.sessions().cloned().collect() }
    };
    if let Err(e) = snapshot.store(path) {
        tracing::error!(path = %path.display(), error = %e, "failed to write snapshot");
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
