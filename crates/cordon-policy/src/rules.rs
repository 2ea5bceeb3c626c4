// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in denylist rules and pattern compilation.

use crate::PolicyError;
use regex::Regex;

/// The default denylist, applied before any configured patterns.
///
/// Each entry is `(pattern, reason)`. Patterns match anywhere in the raw
/// command string.
pub const DEFAULT_DENYLIST: &[(&str, &str)] = &[
    (
        r"rm\s+(-[a-zA-Z]+\s+)*-(rf|fr)[a-zA-Z]*\s+/\s*$",
        "removes the root directory",
    ),
    (
        r"rm\s+(-[a-zA-Z]+\s+)*-(rf|fr)[a-zA-Z]*\s+/\*",
        "removes everything under the root directory",
    ),
    (
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (r"^\s*(sudo\s+)?shutdown\b", "shuts the host down"),
    (r"^\s*(sudo\s+)?reboot\b", "reboots the host"),
    (r"\bmkfs(\.\w+)?\b", "formats a filesystem"),
    (
        r"\bdd\s+[^|;]*\bof=/dev/(sd|hd|nvme)",
        "writes directly to a raw block device",
    ),
    (
        r"\bchmod\s+(-[a-zA-Z]+\s+)*777\s+/\s*$",
        "makes the root directory world-writable",
    ),
    (
        r"\b(curl|wget)\b[^|;]*\|\s*(sudo\s+)?(ba|z|da)?sh\b",
        "pipes a network fetch into a shell",
    ),
];

/// A compiled denylist entry.
#[derive(Debug, Clone)]
pub struct DenyRule {
    /// Compiled pattern.
    pub regex: Regex,
    /// Reason reported on a match.
    pub reason: String,
}

/// Compile one pattern, mapping failures to the fatal
/// [`PolicyError::BadPattern`].
pub(crate) fn compile(pattern: &str) -> Result<Regex, PolicyError> {
    Regex::new(pattern).map_err(|e| PolicyError::BadPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Compile the built-in denylist plus configured extras.
pub(crate) fn compile_denylist(extra: &[String]) -> Result<Vec<DenyRule>, PolicyError> {
    let mut rules = Vec::with_capacity(DEFAULT_DENYLIST.len() + extra.len());
    for (pattern, reason) in DEFAULT_DENYLIST {
        rules.push(DenyRule {
            regex: compile(pattern)?,
            reason: (*reason).to_string(),
        });
    }
    for pattern in extra {
        rules.push(DenyRule {
            regex: compile(pattern)?,
            reason: format!("matches denylist pattern {pattern:?}"),
        });
    }
    Ok(rules)
}

/// Compile the configured allowlist (possibly empty).
pub(crate) fn compile_allowlist(patterns: &[String]) -> Result<Vec<Regex>, PolicyError> {
    patterns.iter().map(|p| compile(p)).collect()
}
