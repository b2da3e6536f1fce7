//! Event bus: durable append, then fan-out.
//!
//! One writer per stream, serialized through the bus. Every publish makes
//! the record durable (append + fsync) and applies it to the materialized
//! index before any subscriber is notified, so a subscriber never observes
//! an event that is not already on disk.
//!
//! Cancelled sessions have their chunk stream closed: once the
//! `cancelled` status record lands, late output from a still-unwinding
//! adapter is dropped rather than appended after the terminal record.

use az_core::{Clock, OutputChunk, RegistryEvent, SessionEvent, SessionId, SessionStatus};
use az_storage::{paths, RegistryLog, SessionIndex, SessionLog, StoreHandle, StreamError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// What subscribers see.
#[derive(Debug, Clone)]
pub enum Notification {
    Chunk { id: SessionId, chunk: OutputChunk },
    Status { id: SessionId, status: SessionStatus },
    Error { id: SessionId, error: String },
}

/// A live subscription: replays are read separately via
/// [`EventBus::registry_entries_after`]; this receives new events.
pub struct Subscriber {
    rx: broadcast::Receiver<Notification>,
}

impl Subscriber {
    /// Next notification; `None` when the bus shut down or this
    /// subscriber lagged past the buffer.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged; catch up via stream replay");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct SessionStream {
    log: SessionLog,
    /// Set when the session reached `cancelled`; drops late chunks.
    closed: bool,
}

/// Shared bus over the registry stream, the per-session streams, the
/// materialized index, and the snapshot store.
pub struct EventBus<C: Clock> {
    root: PathBuf,
    clock: C,
    buffer_size: usize,
    registry: Mutex<RegistryLog>,
    sessions: Mutex<HashMap<String, SessionStream>>,
    pub index: Arc<Mutex<SessionIndex>>,
    store: StoreHandle,
    broadcast: broadcast::Sender<Notification>,
}

impl<C: Clock> EventBus<C> {
    pub fn open(
        root: PathBuf,
        clock: C,
        buffer_size: usize,
        index: Arc<Mutex<SessionIndex>>,
        store: StoreHandle,
    ) -> Result<Self, StreamError> {
        let registry =
            RegistryLog::open(paths::registry_log_path(&root))?.with_buffer_size(buffer_size);
        let (broadcast, _) = broadcast::channel(1024);
        Ok(Self {
            root,
            clock,
            buffer_size,
            registry: Mutex::new(registry),
            sessions: Mutex::new(HashMap::new()),
            index,
            store,
            broadcast,
        })
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber { rx: self.broadcast.subscribe() }
    }

    /// Durable registry records with offset greater than `offset`, for
    /// subscriber catch-up.
    pub fn registry_entries_after(
        &self,
        offset: u64,
    ) -> Result<Vec<az_storage::StreamRecord<RegistryEvent>>, StreamError> {
        self.registry.lock().entries_after(offset)
    }

    /// Durable per-session records with offset greater than `offset`.
    pub fn session_entries_after(
        &self,
        id: &SessionId,
        offset: u64,
    ) -> Result<Vec<az_storage::StreamRecord<SessionEvent>>, StreamError> {
        let log = SessionLog::open(paths::session_log_path(&self.root, id))?;
        log.entries_after(offset)
    }

    /// Append a registry event (durable), apply it, then notify.
    pub fn publish_registry(&self, event: &RegistryEvent) -> Result<u64, StreamError> {
        let now_ms = self.clock.epoch_ms();
        // With the default buffer size of 1 the append itself flushes, so
        // the record is durable before anyone hears about it; larger
        // buffers trade that for throughput
        let offset = self.registry.lock().append(event, self.clock.iso_now())?;
        self.index.lock().apply_registry(event, now_ms);
        self.store.note_change();
        self.notify_registry(event);
        Ok(offset)
    }

    /// Append a per-session event (durable), apply it, then notify.
    ///
    /// Returns `None` without appending when the event is output for a
    /// session whose stream was closed by cancellation.
    pub fn publish_session(
        &self,
        id: &SessionId,
        event: &SessionEvent,
    ) -> Result<Option<u64>, StreamError> {
        let now_ms = self.clock.epoch_ms();
        let offset = {
            let mut sessions = self.sessions.lock();
            let stream = match sessions.entry(id.to_string()) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let log = SessionLog::open(paths::session_log_path(&self.root, id))?
                        .with_buffer_size(self.buffer_size);
                    entry.insert(SessionStream { log, closed: false })
                }
            };
            if stream.closed && matches!(event, SessionEvent::Output { .. }) {
                return Ok(None);
            }
            if matches!(
                event,
                SessionEvent::StatusChange { status: SessionStatus::Cancelled }
            ) {
                stream.closed = true;
            }
            stream.log.append(event, self.clock.iso_now())?
        };
        self.index.lock().apply_session(id, offset, event, now_ms);
        match event {
            SessionEvent::Output { chunk } => {
                self.store.note_chunk();
                let _ = self
                    .broadcast
                    .send(Notification::Chunk { id: id.clone(), chunk: chunk.clone() });
            }
            _ => self.store.note_change(),
        }
        Ok(Some(offset))
    }

    /// Replay a persisted session stream into the index (recovery path).
    pub fn replay_session(&self, id: &SessionId) -> Result<(), StreamError> {
        let path = paths::session_log_path(&self.root, id);
        if !path.exists() {
            return Ok(());
        }
        let log = SessionLog::open(path)?;
        let records = log.entries_after(0)?;
        let mut index = self.index.lock();
        for record in records {
            let at_ms = az_core::iso_to_epoch_ms(&record.ts).unwrap_or(0);
            index.apply_session(id, record.offset, &record.event, at_ms);
        }
        Ok(())
    }

    /// Drop a session from the index and snapshot (deletion). Its stream
    /// file remains on disk for audit.
    pub fn remove_session(&self, id: &SessionId) {
        self.index.lock().remove(id);
        self.sessions.lock().remove(id.as_str());
        self.store.note_change();
    }

    /// Ask the snapshot store to flush now.
    pub async fn flush_store(&self) {
        self.store.flush().await;
    }

    fn notify_registry(&self, event: &RegistryEvent) {
        let notification = match event {
            RegistryEvent::Created { session } => {
                Notification::Status { id: session.id.clone(), status: session.status }
            }
            RegistryEvent::Updated { id, patch } => match (&patch.status, &patch.error) {
                (Some(status), _) => Notification::Status { id: id.clone(), status: *status },
                (None, Some(error)) => {
                    Notification::Error { id: id.clone(), error: error.clone() }
                }
                _ => return,
            },
            RegistryEvent::Completed { id, .. } => {
                Notification::Status { id: id.clone(), status: SessionStatus::Completed }
            }
            RegistryEvent::Failed { id, error, .. } => {
                let _ = self
                    .broadcast
                    .send(Notification::Error { id: id.clone(), error: error.clone() });
                Notification::Status { id: id.clone(), status: SessionStatus::Failed }
            }
            RegistryEvent::Cancelled { id } => {
                Notification::Status { id: id.clone(), status: SessionStatus::Cancelled }
            }
            RegistryEvent::Custom => return,
        };
        let _ = self.broadcast.send(notification);
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
