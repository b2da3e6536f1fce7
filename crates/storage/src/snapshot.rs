//! Snapshot persistence for fast startup.
//!
//! The snapshot (`sessions.json`) stores resolved session state at a point
//! in time. It is an optimization only: the streams are canonical, and a
//! snapshot that fails to parse is set aside (`.corrupt-<ts>`) while state
//! is rebuilt from replay.

use az_core::Session;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur in snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The snapshot file payload: `{"sessions": [...]}`.
///
/// Unknown fields are ignored on read so newer writers stay compatible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub sessions: Vec<Session>,
}

impl Snapshot {
    /// Atomically write the snapshot (tmp file + rename).
    pub fn store(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Load the snapshot, or `None` when absent or unusable.
///
/// An unparseable file is renamed `.corrupt-<epoch_ms>` so the evidence
/// survives while the caller rebuilds from the streams.
pub fn load_snapshot(path: &Path, now_ms: u64) -> Result<Option<Snapshot>, SnapshotError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    match serde_json::from_slice::<Snapshot>(&bytes) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            let quarantine = corrupt_path(path, now_ms);
            tracing::warn!(
                path = %path.display(),
                error = %e,
                quarantine = %quarantine.display(),
                "snapshot unreadable; setting aside and rebuilding from streams"
            );
            fs::rename(path, &quarantine)?;
            Ok(None)
        }
    }
}

fn corrupt_path(path: &Path, now_ms: u64) -> PathBuf {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("sessions.json");
    path.with_file_name(format!("{name}.corrupt-{now_ms}"))
}

const MAX_BAK_FILES: u32 = 3;

/// Pick the next `.bak` / `.bak.N` path, rotating older backups out.
///
/// Keeps up to [`MAX_BAK_FILES`] backups: `.bak`, `.bak.2`, `.bak.3`.
/// The oldest backup is removed when the limit is reached.
pub fn rotate_bak_path(path: &Path) -> PathBuf {
    let bak = |n: u32| {
        if n == 1 {
            path.with_extension("bak")
        } else {
            path.with_extension(format!("bak.{n}"))
        }
    };

    // Remove the oldest if at capacity
    let oldest = bak(MAX_BAK_FILES);
    if oldest.exists() {
        let _ = fs::remove_file(&oldest);
    }

    // Shift existing backups up by one
    for n in (1..MAX_BAK_FILES).rev() {
        let src = bak(n);
        if src.exists() {
            let _ = fs::rename(&src, bak(n + 1));
        }
    }

    bak(1)
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
