//! Error taxonomy for the supervisor surface.
//!
//! Every component boundary translates failures into these explicit results;
//! nothing panics across boundaries. Fatal errors also land in the session's
//! persisted `error` field and a stream event.

use crate::id::SessionId;
use thiserror::Error;

/// Errors surfaced synchronously from `spawn`.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("capacity reached: {running} of {cap} sessions live")]
    CapacityReached { running: usize, cap: usize },
    #[error("session {0} already exists")]
    DuplicateId(SessionId),
    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Errors from control operations on an existing session
/// (send_message, approve, cancel, delete).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("operation not permitted: {0}")]
    IllegalState(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("capacity reached: {running} of {cap} sessions live")]
    CapacityReached { running: usize, cap: usize },
    #[error("persistence error: {0}")]
    Persistence(String),
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
