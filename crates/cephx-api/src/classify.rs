//! Maps a failed ceph invocation onto the closed [`CephError`] taxonomy.
//!
//! Matching is a case-insensitive substring search over stderr (stdout when
//! stderr is empty), checked in this order:
//!
//! 1. `no such file or directory` on a command whose text contains `fs`
//!    (including `cephfs.*` pool names) is a missing filesystem.
//! 2. `cluster unavailable`, `connection refused`, `no such host`.
//! 3. `already exists`.
//! 4. `not found`, `does not exist`.
//! 5. `permission denied`, `unauthorized`.
//! 6. anything else is a plain command failure.
//!
//! The order is significant: text carrying both "already exists" and
//! "not found" classifies as already-exists.

use crate::error::{CephError, ResourceKind};

/// Classifies a non-zero exit. Pure and deterministic.
pub fn classify(exit_code: i32, stderr: &str, stdout: &str, args: &[String]) -> CephError {
    let message = failure_message(exit_code, stderr, stdout);
    let text = message.to_lowercase();

    if text.contains("no such file or directory") && mentions_fs(args) {
        let name = fs_flag_value(args)
            .or_else(|| match subject(args) {
                (ResourceKind::Filesystem, name) => Some(name),
                _ => None,
            })
            .unwrap_or_else(|| "unknown".to_string());
        return CephError::NotFound {
            kind: ResourceKind::Filesystem,
            name,
        };
    }

    if ["cluster unavailable", "connection refused", "no such host"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        return CephError::ClusterUnavailable { message };
    }

    if text.contains("already exists") {
        let (kind, name) = subject(args);
        return CephError::AlreadyExists { kind, name };
    }

    if text.contains("not found") || text.contains("does not exist") {
        let (kind, name) = subject(args);
        return CephError::NotFound { kind, name };
    }

    if text.contains("permission denied") || text.contains("unauthorized") {
        return CephError::PermissionDenied { message };
    }

    CephError::CommandFailed {
        command: command_line(args),
        exit_code,
        stderr: stderr.to_string(),
        stdout: stdout.to_string(),
    }
}

/// Renders an argument vector for messages and logs.
pub fn command_line(args: &[String]) -> String {
    let mut line = String::from("ceph");
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn failure_message(exit_code: i32, stderr: &str, stdout: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    format!("Command failed with exit code {}", exit_code)
}

fn mentions_fs(args: &[String]) -> bool {
    args.iter().any(|a| a.contains("fs"))
}

fn fs_flag_value(args: &[String]) -> Option<String> {
    args.iter()
        .position(|a| a == "--fs")
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn positional(args: &[String], index: usize) -> Option<&str> {
    args.get(index)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
}

/// Best-effort guess of which resource a command addressed.
fn subject(args: &[String]) -> (ResourceKind, String) {
    let words: Vec<&str> = args.iter().map(String::as_str).collect();
    let found = match words.as_slice() {
        ["auth", _verb, ..] => positional(args, 2).map(|n| (ResourceKind::AuthEntity, n)),
        ["osd", "pool", _verb, ..] => positional(args, 3).map(|n| (ResourceKind::Pool, n)),
        ["osd", "crush", "rule", _verb, ..] => {
            positional(args, 4).map(|n| (ResourceKind::CrushRule, n))
        }
        ["fs", "snap-schedule", ..] => words
            .iter()
            .find(|w| w.starts_with('/'))
            .map(|p| (ResourceKind::SnapshotSchedule, *p)),
        ["fs", "volume", _verb, ..] => positional(args, 3).map(|n| (ResourceKind::Filesystem, n)),
        ["fs", _verb, ..] => positional(args, 2).map(|n| (ResourceKind::Filesystem, n)),
        ["osd", _verb, ..] => positional(args, 2).map(|n| (ResourceKind::Osd, n)),
        _ => None,
    };

    match found {
        Some((kind, name)) => (kind, name.to_string()),
        None => (ResourceKind::Resource, args.join(" ")),
    }
}
