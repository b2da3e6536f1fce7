//! Startup recovery: rebuild state from the streams and resolve sessions
//! whose owning process died.
//!
//! Order: (1) snapshot fast path, (2) registry replay, (3) per-session
//! stream replay for active sessions, (4) PID+nonce liveness probe,
//! (5) orphan worktree sweep (done by the supervisor once the index is
//! settled).

use crate::bus::EventBus;
use az_core::{Clock, RegistryEvent, SessionId, SessionStatus};
use az_storage::paths;
use az_storage::DaemonMark;
use std::path::Path;

/// Error recorded on sessions whose owning process is gone.
pub const DAEMON_DIED: &str = "daemon died";

/// Is the process that announced `mark` still alive?
///
/// Two checks: the PID answers signal 0, and the nonce side-channel file
/// written by that process still carries the announced nonce (defeating
/// PID reuse).
pub fn probe_daemon(root: &Path, mark: &DaemonMark) -> bool {
    let pid = nix::unistd::Pid::from_raw(mark.pid as i32);
    if nix::sys::signal::kill(pid, None).is_err() {
        return false;
    }
    match std::fs::read_to_string(paths::nonce_path(root, mark.pid)) {
        Ok(content) => content.trim() == mark.nonce,
        Err(_) => false,
    }
}

/// Replay streams into the bus index and fail sessions whose daemon died.
///
/// Returns the ids that were resolved to `failed`.
pub(crate) fn reconcile<C: Clock>(bus: &EventBus<C>, root: &Path) -> Vec<SessionId> {
    // (2) registry replay — the snapshot already seeded the index
    match bus.registry_entries_after(0) {
        Ok(records) => {
            let mut index = bus.index.lock();
            for record in records {
                let at_ms = az_core::iso_to_epoch_ms(&record.ts).unwrap_or(0);
                index.apply_registry(&record.event, at_ms);
            }
        }
        Err(e) => tracing::error!(error = %e, "registry replay failed; continuing with snapshot state"),
    }

    // (3) per-session tails for active sessions
    let active: Vec<SessionId> =
        bus.index.lock().active_sessions().map(|s| s.id.clone()).collect();
    for id in &active {
        if let Err(e) = bus.replay_session(id) {
            tracing::warn!(session_id = %id, error = %e, "session stream replay failed");
        }
    }

    // (4) liveness probe for statuses that imply an in-flight adapter.
    // `idle` needs no live backend, so it survives restarts as idle and
    // stays resumable.
    let mut failed = Vec::new();
    let still_active: Vec<SessionId> = bus
        .index
        .lock()
        .active_sessions()
        .filter(|s| s.status.is_live() || s.status == SessionStatus::WaitingInput)
        .map(|s| s.id.clone())
        .collect();
    for id in still_active {
        let mark = bus.index.lock().daemon_mark(&id).cloned();
        let alive = mark.as_ref().map(|m| probe_daemon(root, m)).unwrap_or(false);
        if alive {
            tracing::info!(session_id = %id, "session daemon still alive; leaving attached");
            continue;
        }
        let metadata = bus
            .index
            .lock()
            .get(&id)
            .map(|s| s.metadata.clone())
            .unwrap_or_default();
        tracing::warn!(session_id = %id, "active session has no live daemon; marking failed");
        let _ = bus.publish_session(
            &id,
            &az_core::SessionEvent::StatusChange { status: SessionStatus::Failed },
        );
        if let Err(e) = bus.publish_registry(&RegistryEvent::Failed {
            id: id.clone(),
            error: DAEMON_DIED.to_string(),
            metadata,
        }) {
            tracing::error!(session_id = %id, error = %e, "failed to persist daemon-death");
        }
        failed.push(id);
    }
    failed
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
