//! CLI subprocess adapter.
//!
//! Spawns an external agent binary, streams stdout line by line, parses
//! each non-empty line as JSON, and maps it to uniform events through a
//! per-product dispatcher. Free text on stderr (and unparsed stdout) goes
//! through an approval/input heuristic so backends that only print
//! `Proceed? (y/n)` still surface `waiting_approval`.
//!
//! Prompts up to 100 KB travel in argv when the product's argv shape has a
//! prompt slot; larger prompts (and all claude prompts) go to stdin with
//! EOF. A 30-second no-output watchdog catches misconfigured binaries that
//! hang without diagnostics.

mod claude;
mod codex;
mod heuristics;
mod opencode;

use crate::adapter::{AdapterError, AdapterEvent, AgentAdapter, TurnRequest};
use async_trait::async_trait;
use az_core::{Clock, OutputChunk, SystemClock, TokenUsage};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Largest prompt passed in argv; larger prompts stream over stdin.
pub const MAX_ARGV_PROMPT: usize = 100 * 1024;
/// Abort if neither stream produced output within this window.
pub const STARTUP_WATCHDOG: Duration = Duration::from_secs(30);

/// Watchdog window, overridable for tests via `AGENTZ_STARTUP_WATCHDOG_MS`.
fn startup_watchdog() -> Duration {
    std::env::var("AGENTZ_STARTUP_WATCHDOG_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(STARTUP_WATCHDOG)
}
/// Grace between SIGTERM and SIGKILL on abort.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Parsed per-line event, internal to the CLI adapter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CliEvent {
    Chunk(OutputChunk),
    SessionId(String),
    WaitingApproval,
    WaitingInput,
    Tokens(TokenUsage),
    /// The backend reported an error in-stream (may still exit zero).
    ReportedError(String),
}

/// The external products this adapter can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliProduct {
    Claude,
    Codex,
    Opencode,
}

az_core::simple_display! {
    CliProduct {
        Claude => "claude",
        Codex => "codex",
        Opencode => "opencode",
    }
}

impl CliProduct {
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }

    /// Conventional install locations probed after `command -v` fails.
    fn conventional_paths(&self) -> Vec<PathBuf> {
        let home = std::env::var("HOME").unwrap_or_default();
        let shared = [
            format!("/usr/local/bin/{}", self.binary_name()),
            format!("/opt/homebrew/bin/{}", self.binary_name()),
            format!("{home}/.local/bin/{}", self.binary_name()),
        ];
        let specific = match self {
            Self::Claude => format!("{home}/.claude/local/claude"),
            Self::Codex => format!("{home}/.codex/bin/codex"),
            Self::Opencode => format!("{home}/.opencode/bin/opencode"),
        };
        shared.into_iter().chain([specific]).map(PathBuf::from).collect()
    }

    /// Build the product argv. Returns the command and whether the prompt
    /// must be written to stdin.
    fn build_command(&self, binary: &PathBuf, turn: &TurnRequest) -> (Command, bool) {
        let mut cmd = Command::new(binary);
        let prompt_fits_argv = turn.prompt.len() <= MAX_ARGV_PROMPT;
        let on_stdin = match self {
            Self::Claude => {
                cmd.args([
                    "-p",
                    "--verbose",
                    "--output-format",
                    "stream-json",
                    "--dangerously-skip-permissions",
                ]);
                if let Some(id) = &turn.backend_session_id {
                    cmd.args(["--resume", id]);
                }
                // claude always reads the prompt on stdin
                true
            }
            Self::Codex => {
                match (&turn.backend_session_id, turn.resume) {
                    (Some(id), true) => {
                        cmd.args(["resume", id, "--json"]);
                    }
                    _ => {
                        cmd.args(["exec", "--json"]);
                    }
                }
                cmd.env("CODEX_HOME", turn.working_dir.join(".agentz").join("codex-home"));
                if prompt_fits_argv {
                    cmd.arg(&turn.prompt);
                    false
                } else {
                    true
                }
            }
            Self::Opencode => {
                cmd.args(["run", "--format", "json"]);
                if !turn.model.is_empty() {
                    cmd.args(["--model", &turn.model]);
                }
                if let Some(id) = &turn.backend_session_id {
                    cmd.args(["--session", id]);
                }
                if prompt_fits_argv {
                    cmd.arg(&turn.prompt);
                    false
                } else {
                    true
                }
            }
        };
        (cmd, on_stdin)
    }

    /// Dispatch one stdout line. Empty result means the line was not a
    /// recognized JSON record; the caller falls back to heuristics.
    fn parse_line(&self, line: &str, at_ms: u64) -> Vec<CliEvent> {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            return Vec::new();
        };
        match self {
            Self::Claude => claude::parse(&json, at_ms),
            Self::Codex => codex::parse(&json, at_ms),
            Self::Opencode => opencode::parse(&json, at_ms),
        }
    }
}

/// Locate a product binary: `command -v`, then conventional paths.
pub fn discover_binary(product: CliProduct) -> Option<PathBuf> {
    let probe = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {}", product.binary_name()))
        .output();
    if let Ok(output) = probe {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
    }
    product.conventional_paths().into_iter().find(|p| p.exists())
}

/// Adapter driving one CLI agent binary for one session.
pub struct CliAdapter {
    product: CliProduct,
    binary: PathBuf,
    /// Held open for y/n approval answers when the prompt went via argv.
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
}

impl CliAdapter {
    /// Discover the product binary and build an adapter.
    pub fn new(product: CliProduct) -> Result<Self, AdapterError> {
        let binary = discover_binary(product).ok_or_else(|| {
            AdapterError::LaunchFailed(format!("{} binary not found", product.binary_name()))
        })?;
        Ok(Self::with_binary(product, binary))
    }

    /// Build an adapter around an explicit binary path.
    pub fn with_binary(product: CliProduct, binary: PathBuf) -> Self {
        Self { product, binary, stdin: Mutex::new(None) }
    }
}

#[async_trait]
impl AgentAdapter for CliAdapter {
    async fn run(
        &self,
        turn: TurnRequest,
        events: mpsc::Sender<AdapterEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        let clock = SystemClock;
        let (mut cmd, prompt_on_stdin) = self.product.build_command(&self.binary, &turn);
        cmd.current_dir(&turn.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::LaunchFailed(format!("failed to spawn {}: {e}", self.product)))?;
        let pid = child.id();

        let mut stdin = child.stdin.take();
        if prompt_on_stdin {
            if let Some(mut pipe) = stdin.take() {
                pipe.write_all(turn.prompt.as_bytes())
                    .await
                    .map_err(|e| AdapterError::LaunchFailed(format!("stdin write failed: {e}")))?;
                // Drop closes the pipe; the backend sees EOF
            }
        } else {
            *self.stdin.lock() = stdin;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdapterError::LaunchFailed("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AdapterError::LaunchFailed("no stderr pipe".to_string()))?;

        let got_output = Arc::new(AtomicBool::new(false));
        let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        // stderr task: heuristics + tail collection for error reporting
        let stderr_task = {
            let got_output = Arc::clone(&got_output);
            let stderr_tail = Arc::clone(&stderr_tail);
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    got_output.store(true, Ordering::Relaxed);
                    if line.trim().is_empty() {
                        continue;
                    }
                    {
                        let mut tail = stderr_tail.lock();
                        tail.push(line.clone());
                        if tail.len() > 20 {
                            tail.remove(0);
                        }
                    }
                    match heuristics::scan_free_text(&line) {
                        Some(CliEvent::WaitingApproval) => {
                            let _ = events.send(AdapterEvent::WaitingApproval).await;
                        }
                        Some(CliEvent::WaitingInput) => {
                            let _ = events.send(AdapterEvent::WaitingInput).await;
                        }
                        _ => {}
                    }
                }
            })
        };

        let mut tokens = TokenUsage::default();
        let mut reported_error: Option<String> = None;
        let mut lines = BufReader::new(stdout).lines();
        let watchdog = startup_watchdog();

        loop {
            let next = tokio::select! {
                line = lines.next_line() => line,
                _ = cancel.cancelled() => {
                    terminate(pid, &mut child).await;
                    stderr_task.abort();
                    return Err(AdapterError::Aborted);
                }
                _ = tokio::time::sleep(watchdog), if !got_output.load(Ordering::Relaxed) => {
                    terminate(pid, &mut child).await;
                    stderr_task.abort();
                    return Err(AdapterError::LaunchFailed(format!(
                        "no output from {} within {}s",
                        self.product,
                        watchdog.as_secs()
                    )));
                }
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(product = %self.product, error = %e, "stdout read error");
                    break;
                }
            };
            got_output.store(true, Ordering::Relaxed);
            if line.trim().is_empty() {
                continue;
            }

            let parsed = self.product.parse_line(&line, clock.epoch_ms());
            if parsed.is_empty() {
                if let Some(event) = heuristics::scan_free_text(&line) {
                    let mapped = match event {
                        CliEvent::WaitingApproval => AdapterEvent::WaitingApproval,
                        CliEvent::WaitingInput => AdapterEvent::WaitingInput,
                        _ => continue,
                    };
                    let _ = events.send(mapped).await;
                } else {
                    tracing::debug!(product = %self.product, line = %az_core::short(&line, 200), "unparsed stdout line");
                }
                continue;
            }
            for event in parsed {
                match event {
                    CliEvent::Chunk(chunk) => {
                        let _ = events.send(AdapterEvent::Output(chunk)).await;
                    }
                    CliEvent::SessionId(id) => {
                        let _ = events.send(AdapterEvent::SessionId(id)).await;
                    }
                    CliEvent::WaitingApproval => {
                        let _ = events.send(AdapterEvent::WaitingApproval).await;
                    }
                    CliEvent::WaitingInput => {
                        let _ = events.send(AdapterEvent::WaitingInput).await;
                    }
                    CliEvent::Tokens(usage) => tokens = usage,
                    CliEvent::ReportedError(message) => {
                        let _ = events
                            .send(AdapterEvent::Output(OutputChunk::error(
                                message.clone(),
                                clock.epoch_ms(),
                            )))
                            .await;
                        reported_error = Some(message);
                    }
                }
            }
        }

        self.stdin.lock().take();
        let status = child
            .wait()
            .await
            .map_err(|e| AdapterError::RuntimeFailed(format!("wait failed: {e}")))?;
        let _ = stderr_task.await;

        if cancel.is_cancelled() {
            return Err(AdapterError::Aborted);
        }
        if let Some(message) = reported_error {
            // Reported error with zero exit code still fails the turn
            let _ = events.send(AdapterEvent::Error(message)).await;
            return Ok(());
        }
        match status.code() {
            Some(0) => {
                let _ = events.send(AdapterEvent::Complete { tokens }).await;
                Ok(())
            }
            // SIGINT / SIGTERM exits follow an abort we initiated
            Some(130) | Some(143) => Err(AdapterError::Aborted),
            code => {
                let tail = stderr_tail.lock().join("\n");
                let message = match code {
                    Some(code) => format!("{} exited with code {code}: {tail}", self.product),
                    None => format!("{} killed by signal: {tail}", self.product),
                };
                let _ = events.send(AdapterEvent::Error(message)).await;
                Ok(())
            }
        }
    }

    async fn approve(&self, approved: bool) -> Result<(), AdapterError> {
        let mut guard = self.stdin.lock().take();
        let Some(pipe) = guard.as_mut() else {
            return Err(AdapterError::Unsupported(
                "backend stdin is not available for approvals".to_string(),
            ));
        };
        let answer = if approved { "y\n" } else { "n\n" };
        pipe.write_all(answer.as_bytes())
            .await
            .map_err(|e| AdapterError::RuntimeFailed(format!("approval write failed: {e}")))?;
        *self.stdin.lock() = guard;
        Ok(())
    }

    async fn send_input(&self, text: &str) -> Result<(), AdapterError> {
        let mut guard = self.stdin.lock().take();
        let Some(pipe) = guard.as_mut() else {
            return Err(AdapterError::Unsupported(
                "backend stdin is not available for input".to_string(),
            ));
        };
        let result = pipe.write_all(format!("{text}\n").as_bytes()).await;
        *self.stdin.lock() = guard;
        result.map_err(|e| AdapterError::RuntimeFailed(format!("input write failed: {e}")))
    }

    fn supports_approval(&self) -> bool {
        // claude runs with --dangerously-skip-permissions and consumes
        // stdin for the prompt, so it never asks
        self.product != CliProduct::Claude
    }
}

/// SIGTERM the child and its process group children, then SIGKILL after a
/// grace period.
async fn terminate(pid: Option<u32>, child: &mut tokio::process::Child) {
    if let Some(pid) = pid {
        let target = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGTERM);
        // Best-effort sweep of children the backend spawned
        let _ = tokio::process::Command::new("pkill")
            .args(["-TERM", "-P", &pid.to_string()])
            .output()
            .await;
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
