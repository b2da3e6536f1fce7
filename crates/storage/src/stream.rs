//! Append-only event streams.
//!
//! A stream is a newline-delimited JSON file where each record carries a
//! strictly increasing `offset`, an ISO-8601 `ts`, and the event's own
//! tagged fields. The writer assigns offsets at append time; readers use
//! them for subscriber catch-up and idempotent re-reads.
//!
//! Durability: `append` buffers up to `buffer_size` records (default 1,
//! i.e. publish immediately) and `flush` fsyncs. A publisher must not
//! notify subscribers of a record it has not flushed.
//!
//! Corruption: on open, a file with an undecodable or offset-discontinuous
//! tail is rotated to `.bak` (up to three rotated backups) and the valid
//! prefix is preserved in a clean rewrite. Readers stop at the first bad
//! record rather than erroring.

use crate::snapshot::rotate_bak_path;
use az_core::{RegistryEvent, SessionEvent};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed stream record: {0}")]
    Format(String),
}

/// One decoded stream record.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord<E> {
    pub offset: u64,
    pub ts: String,
    pub event: E,
}

/// The global registry stream.
pub type RegistryLog = StreamLog<RegistryEvent>;
/// A per-session stream.
pub type SessionLog = StreamLog<SessionEvent>;

/// An append-only NDJSON journal with monotonic offsets.
pub struct StreamLog<E> {
    path: PathBuf,
    file: File,
    pending: Vec<String>,
    buffer_size: usize,
    next_offset: u64,
    _marker: PhantomData<E>,
}

impl<E> StreamLog<E>
where
    E: Serialize + DeserializeOwned,
{
    /// Open (or create) a stream, recovering from a corrupt tail.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StreamError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (valid_lines, last_offset, corrupt) = scan::<E>(&path)?;
        if corrupt {
            let bak = rotate_bak_path(&path);
            std::fs::rename(&path, &bak)?;
            tracing::warn!(
                path = %path.display(),
                bak = %bak.display(),
                kept = valid_lines.len(),
                "stream had a corrupt tail; rotated and kept valid prefix"
            );
            let mut clean = File::create(&path)?;
            for line in &valid_lines {
                writeln!(clean, "{line}")?;
            }
            clean.sync_data()?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            pending: Vec::new(),
            buffer_size: 1,
            next_offset: last_offset + 1,
            _marker: PhantomData,
        })
    }

    /// Set how many records may buffer before an implicit flush.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the most recently appended record (0 if empty).
    pub fn last_offset(&self) -> u64 {
        self.next_offset - 1
    }

    /// Append a record, returning its assigned offset.
    ///
    /// The record is durable once this returns if `buffer_size` is 1
    /// (the default); otherwise after the next [`StreamLog::flush`].
    pub fn append(&mut self, event: &E, ts: impl Into<String>) -> Result<u64, StreamError> {
        let offset = self.next_offset;
        let line = encode(offset, &ts.into(), event)?;
        self.pending.push(line);
        self.next_offset += 1;
        if self.pending.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(offset)
    }

    /// Write buffered records and fsync.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        for line in self.pending.drain(..) {
            writeln!(self.file, "{line}")?;
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// All flushed records with offset strictly greater than `offset`.
    ///
    /// Stops silently at the first corrupt record.
    pub fn entries_after(&self, offset: u64) -> Result<Vec<StreamRecord<E>>, StreamError> {
        let (lines, _, _) = scan::<E>(&self.path)?;
        let mut records = Vec::new();
        for line in &lines {
            // scan() already validated these lines
            if let Ok(record) = decode::<E>(line) {
                if record.offset > offset {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

/// Serialize a record: the event's tagged fields plus `offset` and `ts`.
fn encode<E: Serialize>(offset: u64, ts: &str, event: &E) -> Result<String, StreamError> {
    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(StreamError::Format("stream events must serialize as objects".to_string()));
    };
    obj.insert("offset".to_string(), offset.into());
    obj.insert("ts".to_string(), ts.into());
    Ok(serde_json::to_string(&serde_json::Value::Object(obj))?)
}

/// Decode one NDJSON line into a record.
fn decode<E: DeserializeOwned>(line: &str) -> Result<StreamRecord<E>, StreamError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(StreamError::Format("record is not a JSON object".to_string()));
    };
    let offset = obj
        .remove("offset")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| StreamError::Format("record missing offset".to_string()))?;
    let ts = obj
        .remove("ts")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| StreamError::Format("record missing ts".to_string()))?;
    let event: E = serde_json::from_value(serde_json::Value::Object(obj))?;
    Ok(StreamRecord { offset, ts, event })
}

/// Scan a stream file: returns (valid lines, last valid offset, saw corruption).
///
/// Corruption is any undecodable line (including binary garbage) or an
/// offset that fails to increase.
fn scan<E: DeserializeOwned>(path: &Path) -> Result<(Vec<String>, u64, bool), StreamError> {
    if !path.exists() {
        return Ok((Vec::new(), 0, false));
    }
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut valid = Vec::new();
    let mut last_offset = 0u64;
    let mut corrupt = false;
    for raw in bytes.split(|b| *b == b'\n') {
        if raw.is_empty() {
            continue;
        }
        let Ok(line) = std::str::from_utf8(raw) else {
            corrupt = true;
            break;
        };
        match decode::<E>(line) {
            Ok(record) if record.offset > last_offset => {
                last_offset = record.offset;
                valid.push(line.to_string());
            }
            _ => {
                corrupt = true;
                break;
            }
        }
    }
    Ok((valid, last_offset, corrupt))
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
