//! Free-text fallback for backends that prompt outside their JSON stream.
//!
//! Scans stderr and unparsed stdout lines for y/n prompts and approval
//! keywords, synthesizing `waiting_approval` / `waiting_input` events the
//! uniform contract requires.

use super::CliEvent;

const APPROVAL_MARKERS: &[&str] = &[
    "(y/n)",
    "[y/n]",
    "y/n?",
    "approval required",
    "needs approval",
    "waiting for approval",
    "permission required",
    "allow this action",
];

const INPUT_MARKERS: &[&str] =
    &["waiting for input", "please provide", "enter a value", "awaiting your reply"];

/// Classify one free-text line, if it looks like a prompt.
pub(crate) fn scan_free_text(line: &str) -> Option<CliEvent> {
    let lowered = line.to_ascii_lowercase();
    if APPROVAL_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(CliEvent::WaitingApproval);
    }
    if INPUT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Some(CliEvent::WaitingInput);
    }
    None
}

#[cfg(test)]
#[path = "heuristics_tests.rs"]
mod tests;
