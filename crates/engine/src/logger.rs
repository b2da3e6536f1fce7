//! Append-only logger for per-session activity logs.
//!
//! Writes human-readable timestamped lines to
//! `<root>/.agentz/logs/<session_id>.log` for operator debugging. This is
//! side-channel observability only: the canonical record is the stream.

use az_core::SessionId;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// One formatted activity line.
pub type ActivityMessage = (SessionId, String);

pub struct SessionLogger {
    log_dir: PathBuf,
}

impl SessionLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Return the path to a session's activity log file.
    pub fn log_path(&self, id: &SessionId) -> PathBuf {
        self.log_dir.join(format!("{id}.log"))
    }

    /// Append one line to the session log.
    ///
    /// Failures are logged via tracing but do not propagate — logging
    /// must not break the engine.
    pub fn append(&self, id: &SessionId, line: &str) {
        if let Err(e) = self.write_line(id, line) {
            tracing::warn!(session_id = %id, error = %e, "failed to write session activity log");
        }
    }

    fn write_line(&self, id: &SessionId, line: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        let mut file =
            OpenOptions::new().create(true).append(true).open(self.log_path(id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Spawn a background task that drains the channel into log files.
    pub fn spawn_writer(
        log_dir: PathBuf,
        mut rx: mpsc::Receiver<ActivityMessage>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let logger = SessionLogger::new(log_dir);
            while let Some((id, line)) = rx.recv().await {
                logger.append(&id, &line);
            }
        })
    }
}

#[cfg(test)]
#[path = "logger_tests.rs"]
mod tests;
