//! Context-window management for the SDK tool-calling loops.
//!
//! Token counts are estimated as one token per four characters. At 85% of
//! the model's limit the loop emits a warning chunk (once per crossing);
//! at 90% it prunes, always preserving the system message and keeping the
//! most recent `max(MIN_KEEP, min(0.4·N, MAX_HISTORY))` messages. An
//! absolute message-count ceiling applies regardless of tokens.

use az_core::{ConversationMessage, Role};

/// Iteration cap of the tool-calling loop.
pub const MAX_ITERATIONS: usize = 20;
/// Absolute ceiling on retained messages.
pub const MAX_HISTORY: usize = 100;
/// Fewest non-system messages a prune may keep.
pub const MIN_KEEP: usize = 4;
/// Fraction of the model limit that triggers a warning.
pub const WARN_THRESHOLD: f64 = 0.85;
/// Fraction of the model limit that triggers a prune.
pub const PRUNE_THRESHOLD: f64 = 0.90;

/// What [`manage`] did to the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    None,
    /// Crossed the warn threshold; caller emits a system chunk.
    Warn { estimated: u64, limit: u64 },
    /// Old messages were dropped.
    Pruned { dropped: usize },
}

/// Estimated tokens across the message list.
pub fn estimate_tokens(messages: &[ConversationMessage]) -> u64 {
    messages.iter().map(ConversationMessage::estimated_tokens).sum()
}

/// Inspect the message list and prune or warn as needed.
///
/// `warned` tracks the 85% crossing so each crossing warns exactly once;
/// it resets when the estimate drops back under the threshold.
pub fn manage(
    messages: &mut Vec<ConversationMessage>,
    limit: u64,
    warned: &mut bool,
) -> ContextAction {
    // Absolute ceiling first, independent of token estimates
    if messages.len() > MAX_HISTORY {
        let dropped = prune(messages, MAX_HISTORY);
        return ContextAction::Pruned { dropped };
    }

    let estimated = estimate_tokens(messages);
    let utilization = estimated as f64 / limit as f64;

    if utilization >= PRUNE_THRESHOLD {
        let n = messages.len();
        let keep = MIN_KEEP.max(((n as f64 * 0.4) as usize).min(MAX_HISTORY));
        let dropped = prune(messages, keep);
        if estimate_tokens(messages) < (limit as f64 * WARN_THRESHOLD) as u64 {
            *warned = false;
        }
        return ContextAction::Pruned { dropped };
    }

    if utilization >= WARN_THRESHOLD {
        if !*warned {
            *warned = true;
            return ContextAction::Warn { estimated, limit };
        }
        return ContextAction::None;
    }

    *warned = false;
    ContextAction::None
}

/// Keep the system message plus the `keep` most recent others.
/// Returns how many messages were dropped.
fn prune(messages: &mut Vec<ConversationMessage>, keep: usize) -> usize {
    let system: Vec<ConversationMessage> =
        messages.iter().filter(|m| m.role == Role::System).take(1).cloned().collect();
    let rest: Vec<ConversationMessage> =
        messages.iter().filter(|m| m.role != Role::System).cloned().collect();

    let keep = keep.min(rest.len());
    let tail = rest[rest.len() - keep..].to_vec();

    let before = messages.len();
    *messages = system.into_iter().chain(tail).collect();
    before - messages.len()
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
