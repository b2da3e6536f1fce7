//! Security gates enforced in every tool executor.
//!
//! Three gates: the path gate (all agent-supplied paths must resolve inside
//! the session's effective working directory), the command denylist, and
//! the MCP hostname blacklist (checked both before and after DNS
//! resolution). A gate failure fails the tool, never the session.

use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("path traversal: {0} escapes the working directory")]
    PathTraversal(String),
    #[error("command rejected by denylist: {0}")]
    DeniedCommand(String),
    #[error("host rejected by blacklist: {0}")]
    BlacklistedHost(String),
}

/// Substrings that reject a command outright.
const COMMAND_DENYLIST: &[&str] = &["rm -rf /", "rm -rf ~", "mkfs", "dd if="];

/// Resolve an agent-supplied path, requiring the result to stay inside
/// `working_dir`.
///
/// Resolution is lexical (normalize `.` and `..` components) so the gate
/// also covers paths that do not exist yet. The target may be a file to
/// create; `working_dir` itself must exist.
pub fn resolve_within(working_dir: &Path, supplied: &str) -> Result<PathBuf, SecurityError> {
    let supplied_path = Path::new(supplied);
    let joined = if supplied_path.is_absolute() {
        supplied_path.to_path_buf()
    } else {
        working_dir.join(supplied_path)
    };

    let base = normalize(working_dir);
    let resolved = normalize(&joined);

    if !resolved.starts_with(&base) {
        return Err(SecurityError::PathTraversal(supplied.to_string()));
    }
    Ok(resolved)
}

/// Lexically normalize a path: resolve `.` and `..` without touching disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Reject commands containing a denylisted substring.
pub fn check_command(command: &str) -> Result<(), SecurityError> {
    for needle in COMMAND_DENYLIST {
        if command.contains(needle) {
            return Err(SecurityError::DeniedCommand(command.to_string()));
        }
    }
    Ok(())
}

/// Reject blacklisted hostnames before DNS resolution.
pub fn check_host(host: &str) -> Result<(), SecurityError> {
    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost"
        || lowered.ends_with(".localhost")
        || lowered == "metadata.google.internal"
    {
        return Err(SecurityError::BlacklistedHost(host.to_string()));
    }
    if let Ok(ip) = lowered.parse::<IpAddr>() {
        return check_ip(ip).map_err(|_| SecurityError::BlacklistedHost(host.to_string()));
    }
    Ok(())
}

/// Reject blacklisted resolved addresses (the post-DNS half of the gate).
pub fn check_ip(ip: IpAddr) -> Result<(), SecurityError> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // includes 169.254.169.254 metadata
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    };
    if blocked {
        return Err(SecurityError::BlacklistedHost(ip.to_string()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "security_tests.rs"]
mod tests;
