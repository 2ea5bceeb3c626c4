// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-policy
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The ordered, short-circuiting gate over a candidate command.
//!
//! Evaluation order is fixed: denylist, then allowlist, then plugins, then
//! the approval policy. The denylist precedes the allowlist so a permissive
//! allowlist can never re-enable a hard-blocked form; plugins run after the
//! lists so ecosystem checks can still demand approval for list-allowed
//! commands.

/// Built-in git/kubectl/aws plugins.
pub mod builtin;
/// The [`Plugin`](plugin::Plugin) trait and process-wide registry.
pub mod plugin;
/// Default denylist rules and pattern compilation.
pub mod rules;

use cordon_config::{ApprovalPolicy, PolicyConfig};
use cordon_core::JobPayload;
use cordon_core::check::{CheckResult, ExecutionContext};
use plugin::PluginRegistry;
use regex::Regex;
use rules::DenyRule;
use std::sync::Arc;
use tracing::warn;

/// Errors raised while building the chain.
///
/// A pattern that fails to compile is a fatal configuration error: the
/// chain refuses to start rather than run with a weakened rule set.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A denylist or allowlist pattern did not compile.
    #[error("policy pattern {pattern:?} failed to compile: {reason}")]
    BadPattern {
        /// The offending pattern source.
        pattern: String,
        /// Compiler diagnostic.
        reason: String,
    },
}

/// The compiled check chain.
///
/// Construction compiles every pattern; evaluation is pure given a fixed
/// plugin set and policy, so one chain instance is shared across workers.
#[derive(Debug)]
pub struct CheckChain {
    denylist: Vec<DenyRule>,
    allowlist: Vec<Regex>,
    approval: ApprovalPolicy,
    registry: Arc<PluginRegistry>,
}

impl CheckChain {
    /// Compile a chain from policy configuration and a plugin registry.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::BadPattern`] for the first pattern that fails
    /// to compile.
    pub fn new(policy: &PolicyConfig, registry: Arc<PluginRegistry>) -> Result<Self, PolicyError> {
        Ok(Self {
            denylist: rules::compile_denylist(&policy.denylist)?,
            allowlist: rules::compile_allowlist(&policy.allowlist)?,
            approval: policy.approval.clone(),
            registry,
        })
    }

    /// Evaluate a candidate, producing a single merged verdict.
    #[must_use]
    pub fn evaluate(&self, ctx: &ExecutionContext, payload: &JobPayload) -> CheckResult {
        let command = payload.command.as_str();

        // 1. Denylist: first match denies with that rule's reason.
        for rule in &self.denylist {
            if rule.regex.is_match(command) {
                return CheckResult::deny(format!("blocked: {}", rule.reason));
            }
        }

        // 2. Allowlist, skipped entirely when empty.
        if !self.allowlist.is_empty() && !self.allowlist.iter().any(|re| re.is_match(command)) {
            return CheckResult::deny("not in allowlist");
        }

        // 3. Plugins: a named plugin when the payload selects one, else all
        //    enabled plugins. Denials short-circuit; errors soft-fail.
        let mut verdict = CheckResult::allow();
        for plugin in self.selected_plugins(payload) {
            match plugin.pre_run_check(ctx, payload) {
                Ok(result) => {
                    if !result.allowed {
                        return result;
                    }
                    verdict.absorb(result);
                }
                Err(error) => {
                    warn!(
                        plugin = plugin.name(),
                        error = %error,
                        "plugin check failed; continuing without its verdict"
                    );
                }
            }
            if plugin.requires_approval(payload) {
                verdict.absorb(CheckResult::needs_approval(format!(
                    "plugin '{}' requires approval for this command",
                    plugin.name()
                )));
            }
        }

        // 4. Approval policy.
        if self.approval.require_approval_high_risk
            && payload.candidate_metadata.risk_level == cordon_core::RiskLevel::High
        {
            verdict.absorb(CheckResult::needs_approval(
                self.approval.default_message.clone(),
            ));
        }
        if self.approval.require_approval_destructive && payload.candidate_metadata.destructive {
            verdict.absorb(CheckResult::needs_approval(
                self.approval.default_message.clone(),
            ));
        }

        // 5. Nothing denied: allow (possibly with the approval flag set).
        verdict
    }

    fn selected_plugins(&self, payload: &JobPayload) -> Vec<Arc<dyn plugin::Plugin>> {
        if let Some(name) = payload
            .plugin_metadata
            .get("plugin")
            .and_then(|v| v.as_str())
        {
            return self.registry.get(name).into_iter().collect();
        }
        self.registry.enabled_plugins()
    }
}
