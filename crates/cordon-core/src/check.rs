// SPDX-License-Identifier: MIT OR Apache-2.0
//! Check-chain verdicts and the execution context handed to every check.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ambient facts about the execution environment, visible to every check
/// and plugin in the chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionContext {
    /// Working directory the command would run in.
    pub working_dir: String,
    /// The requesting principal.
    pub user: String,
    /// When the evaluation happens.
    pub timestamp: DateTime<Utc>,
}

impl ExecutionContext {
    /// Context for the given user in the given directory, stamped now.
    #[must_use]
    pub fn new(working_dir: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            user: user.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The accumulated verdict of the check chain.
///
/// Individual checks produce one of these; the chain folds them together
/// with [`CheckResult::absorb`]. A deny short-circuits the fold.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CheckResult {
    /// Whether execution may proceed.
    pub allowed: bool,
    /// Reason for a denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether a human approval gate must pass before execution.
    #[serde(default)]
    pub requires_approval: bool,
    /// Message shown to the approver; the strongest contributor wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_message: Option<String>,
    /// Follow-up checks suggested by plugins (advisory).
    #[serde(default)]
    pub additional_checks: Vec<String>,
    /// Open metadata bag; merged last-writer-wins per key.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CheckResult {
    /// A plain allow with nothing attached.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            requires_approval: false,
            approval_message: None,
            additional_checks: vec![],
            metadata: BTreeMap::new(),
        }
    }

    /// A denial with the given reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            requires_approval: false,
            approval_message: None,
            additional_checks: vec![],
            metadata: BTreeMap::new(),
        }
    }

    /// An allow that requires the approval gate with the given message.
    #[must_use]
    pub fn needs_approval(message: impl Into<String>) -> Self {
        let mut r = Self::allow();
        r.requires_approval = true;
        r.approval_message = Some(message.into());
        r
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Fold another check's verdict into this one.
    ///
    /// - a deny wins and copies its reason verbatim
    /// - `requires_approval` ORs; a longer approval message replaces a
    ///   shorter one (the strongest single message wins)
    /// - metadata merges last-writer-wins per key
    /// - additional checks concatenate
    pub fn absorb(&mut self, other: CheckResult) {
        if !other.allowed {
            self.allowed = false;
            self.reason = other.reason.clone();
        }
        if other.requires_approval {
            self.requires_approval = true;
            match (&self.approval_message, &other.approval_message) {
                (None, Some(_)) => self.approval_message = other.approval_message.clone(),
                (Some(current), Some(incoming)) if incoming.len() > current.len() => {
                    self.approval_message = other.approval_message.clone();
                }
                _ => {}
            }
        }
        self.additional_checks.extend(other.additional_checks);
        self.metadata.extend(other.metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_is_allowed() {
        let r = CheckResult::allow();
        assert!(r.allowed);
        assert!(r.reason.is_none());
        assert!(!r.requires_approval);
    }

    #[test]
    fn deny_carries_reason() {
        let r = CheckResult::deny("blocked: rm of root directory");
        assert!(!r.allowed);
        assert_eq!(r.reason.as_deref(), Some("blocked: rm of root directory"));
    }

    #[test]
    fn absorb_deny_wins() {
        let mut verdict = CheckResult::allow();
        verdict.absorb(CheckResult::deny("nope"));
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason.as_deref(), Some("nope"));
    }

    #[test]
    fn absorb_ors_approval_and_keeps_strongest_message() {
        let mut verdict = CheckResult::needs_approval("short");
        verdict.absorb(CheckResult::needs_approval("a much longer, sterner warning"));
        assert!(verdict.requires_approval);
        assert_eq!(
            verdict.approval_message.as_deref(),
            Some("a much longer, sterner warning")
        );

        // A shorter message does not displace the stronger one.
        verdict.absorb(CheckResult::needs_approval("tiny"));
        assert_eq!(
            verdict.approval_message.as_deref(),
            Some("a much longer, sterner warning")
        );
    }

    #[test]
    fn absorb_merges_metadata_last_writer_wins() {
        let mut verdict =
            CheckResult::allow().with_metadata("service", serde_json::json!("s3"));
        verdict.absorb(
            CheckResult::allow()
                .with_metadata("service", serde_json::json!("ec2"))
                .with_metadata("estimated_cost", serde_json::json!(1.5)),
        );
        assert_eq!(verdict.metadata["service"], "ec2");
        assert_eq!(verdict.metadata["estimated_cost"], 1.5);
    }

    #[test]
    fn absorb_concatenates_additional_checks() {
        let mut verdict = CheckResult::allow();
        let mut other = CheckResult::allow();
        other.additional_checks.push("verify branch protection".into());
        verdict.absorb(other);
        assert_eq!(verdict.additional_checks.len(), 1);
    }
}
