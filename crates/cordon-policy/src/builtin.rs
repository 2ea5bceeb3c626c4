// SPDX-License-Identifier: MIT OR Apache-2.0
//! Built-in plugins: ecosystem-specific pre-run checks for git, kubectl,
//! and the AWS CLI.
//!
//! These cover the safety surface only; candidate translation for these
//! tools lives with the controller, not here.

use crate::plugin::{Plugin, PluginRegistry};
use cordon_core::JobPayload;
use cordon_core::check::{CheckResult, ExecutionContext};
use serde_json::json;

/// Register every built-in plugin into `registry`.
pub fn register_builtins(registry: &PluginRegistry) {
    registry.register(GitPlugin);
    registry.register(KubernetesPlugin);
    registry.register(AwsPlugin);
}

fn first_word_after(command: &str, tool: &str) -> Option<String> {
    let rest = command.trim_start().strip_prefix(tool)?;
    rest.split_whitespace()
        .find(|w| !w.starts_with('-'))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Guards history-rewriting and destructive git operations.
pub struct GitPlugin;

const GIT_WRITE_OPS: &[&str] = &["push", "reset", "rebase", "branch", "clean", "gc"];

impl Plugin for GitPlugin {
    fn name(&self) -> &'static str {
        "git"
    }

    fn pre_run_check(
        &self,
        _ctx: &ExecutionContext,
        payload: &JobPayload,
    ) -> anyhow::Result<CheckResult> {
        let command = payload.command.trim_start();
        if !command.starts_with("git ") {
            return Ok(CheckResult::allow());
        }
        let Some(op) = first_word_after(command, "git") else {
            return Ok(CheckResult::allow());
        };

        let mut verdict = CheckResult::allow().with_metadata("operation", json!(op.clone()));

        if GIT_WRITE_OPS.contains(&op.as_str())
            && !payload.required_scopes.contains("git:write")
        {
            return Ok(CheckResult::deny(format!(
                "git {op} requires the 'git:write' scope"
            )));
        }

        let force_push =
            op == "push" && (command.contains("--force") || command.contains(" -f"));
        let hard_reset = op == "reset" && command.contains("--hard");
        let branch_delete = op == "branch" && (command.contains(" -D") || command.contains(" -d"));
        let remote_delete = op == "push" && command.contains("--delete");
        let force_clean = op == "clean" && command.contains("-f");

        if force_push || remote_delete {
            verdict.absorb(CheckResult::needs_approval(
                "git push rewrites or removes remote history; confirm the target branch",
            ));
        } else if hard_reset || branch_delete || force_clean {
            verdict.absorb(CheckResult::needs_approval(
                "this git operation discards local work irrecoverably",
            ));
        }

        Ok(verdict)
    }

    fn scopes(&self) -> Vec<String> {
        vec!["git:read".into(), "git:write".into()]
    }
}

// ---------------------------------------------------------------------------
// Kubernetes
// ---------------------------------------------------------------------------

/// Guards cluster-mutating kubectl operations.
pub struct KubernetesPlugin;

const KUBECTL_WRITE_VERBS: &[&str] = &["delete", "drain", "apply", "scale", "patch", "replace"];

impl Plugin for KubernetesPlugin {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn pre_run_check(
        &self,
        _ctx: &ExecutionContext,
        payload: &JobPayload,
    ) -> anyhow::Result<CheckResult> {
        let command = payload.command.trim_start();
        if !command.starts_with("kubectl ") {
            return Ok(CheckResult::allow());
        }
        let Some(verb) = first_word_after(command, "kubectl") else {
            return Ok(CheckResult::allow());
        };

        let mut verdict = CheckResult::allow();
        if let Some(namespace) = namespace_of(command) {
            verdict = verdict.with_metadata("namespace", json!(namespace));
        }

        if KUBECTL_WRITE_VERBS.contains(&verb.as_str())
            && !payload.required_scopes.contains("k8s:write")
        {
            return Ok(CheckResult::deny(format!(
                "kubectl {verb} requires the 'k8s:write' scope"
            )));
        }

        let scale_to_zero = verb == "scale" && command.contains("--replicas=0");
        if verb == "delete" || verb == "drain" || scale_to_zero {
            verdict.absorb(CheckResult::needs_approval(format!(
                "kubectl {verb} disrupts running workloads; confirm the target resources"
            )));
        }

        Ok(verdict)
    }

    fn scopes(&self) -> Vec<String> {
        vec!["k8s:read".into(), "k8s:write".into()]
    }
}

fn namespace_of(command: &str) -> Option<String> {
    let mut words = command.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if word == "-n" || word == "--namespace" {
            return words.next().map(str::to_string);
        }
        if let Some(ns) = word.strip_prefix("--namespace=") {
            return Some(ns.to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// AWS
// ---------------------------------------------------------------------------

/// Guards account-mutating AWS CLI operations.
pub struct AwsPlugin;

const AWS_DANGEROUS: &[&str] = &[
    "terminate-instances",
    "delete-bucket",
    "rb",
    "delete-stack",
    "delete-db-instance",
];

impl Plugin for AwsPlugin {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn pre_run_check(
        &self,
        _ctx: &ExecutionContext,
        payload: &JobPayload,
    ) -> anyhow::Result<CheckResult> {
        let command = payload.command.trim_start();
        if !command.starts_with("aws ") {
            return Ok(CheckResult::allow());
        }
        let Some(service) = first_word_after(command, "aws") else {
            return Ok(CheckResult::allow());
        };

        let mut verdict =
            CheckResult::allow().with_metadata("service", json!(service.clone()));

        let operation = command
            .split_whitespace()
            .nth(2)
            .unwrap_or_default()
            .to_string();

        let mutating = AWS_DANGEROUS.contains(&operation.as_str())
            || operation.starts_with("delete-")
            || operation.starts_with("terminate-")
            || (service == "iam"
                && (operation.starts_with("put-") || operation.starts_with("attach-")));

        if mutating && !payload.required_scopes.contains("aws:write") {
            return Ok(CheckResult::deny(format!(
                "aws {service} {operation} requires the 'aws:write' scope"
            )));
        }

        if mutating {
            verdict.absorb(CheckResult::needs_approval(format!(
                "aws {service} {operation} permanently alters cloud resources; confirm the account and region"
            )));
        }

        Ok(verdict)
    }

    fn scopes(&self) -> Vec<String> {
        vec!["aws:read".into(), "aws:write".into()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::JobPayloadBuilder;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("/workspace", "tester")
    }

    fn payload(command: &str) -> JobPayload {
        JobPayloadBuilder::new(command).build()
    }

    fn payload_with_scope(command: &str, scope: &str) -> JobPayload {
        JobPayloadBuilder::new(command).scope(scope).build()
    }

    // -----------------------------------------------------------------------
    // Git
    // -----------------------------------------------------------------------

    #[test]
    fn git_ignores_non_git_commands() {
        let verdict = GitPlugin.pre_run_check(&ctx(), &payload("ls -la")).unwrap();
        assert!(verdict.allowed);
        assert!(!verdict.requires_approval);
    }

    #[test]
    fn git_write_without_scope_is_denied() {
        let verdict = GitPlugin
            .pre_run_check(&ctx(), &payload("git push origin main"))
            .unwrap();
        assert!(!verdict.allowed);
        assert!(verdict.reason.unwrap().contains("git:write"));
    }

    #[test]
    fn git_force_push_needs_approval() {
        let verdict = GitPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope("git push --force origin main", "git:write"),
            )
            .unwrap();
        assert!(verdict.allowed);
        assert!(verdict.requires_approval);
        assert_eq!(verdict.metadata["operation"], "push");
    }

    #[test]
    fn git_hard_reset_needs_approval() {
        let verdict = GitPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope("git reset --hard HEAD~3", "git:write"),
            )
            .unwrap();
        assert!(verdict.requires_approval);
    }

    #[test]
    fn git_status_is_plain_allow() {
        let verdict = GitPlugin
            .pre_run_check(&ctx(), &payload("git status"))
            .unwrap();
        assert!(verdict.allowed);
        assert!(!verdict.requires_approval);
        assert_eq!(verdict.metadata["operation"], "status");
    }

    // -----------------------------------------------------------------------
    // Kubernetes
    // -----------------------------------------------------------------------

    #[test]
    fn kubectl_get_is_plain_allow() {
        let verdict = KubernetesPlugin
            .pre_run_check(&ctx(), &payload("kubectl get pods -n prod"))
            .unwrap();
        assert!(verdict.allowed);
        assert!(!verdict.requires_approval);
        assert_eq!(verdict.metadata["namespace"], "prod");
    }

    #[test]
    fn kubectl_delete_needs_scope_then_approval() {
        let denied = KubernetesPlugin
            .pre_run_check(&ctx(), &payload("kubectl delete pod web-0"))
            .unwrap();
        assert!(!denied.allowed);

        let verdict = KubernetesPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope("kubectl delete pod web-0 -n prod", "k8s:write"),
            )
            .unwrap();
        assert!(verdict.allowed);
        assert!(verdict.requires_approval);
        assert_eq!(verdict.metadata["namespace"], "prod");
    }

    #[test]
    fn kubectl_scale_to_zero_needs_approval() {
        let verdict = KubernetesPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope(
                    "kubectl scale deploy web --replicas=0 --namespace=prod",
                    "k8s:write",
                ),
            )
            .unwrap();
        assert!(verdict.requires_approval);
        assert_eq!(verdict.metadata["namespace"], "prod");
    }

    // -----------------------------------------------------------------------
    // AWS
    // -----------------------------------------------------------------------

    #[test]
    fn aws_describe_is_plain_allow() {
        let verdict = AwsPlugin
            .pre_run_check(&ctx(), &payload("aws ec2 describe-instances"))
            .unwrap();
        assert!(verdict.allowed);
        assert!(!verdict.requires_approval);
        assert_eq!(verdict.metadata["service"], "ec2");
    }

    #[test]
    fn aws_terminate_needs_scope_then_approval() {
        let denied = AwsPlugin
            .pre_run_check(
                &ctx(),
                &payload("aws ec2 terminate-instances --instance-ids i-1"),
            )
            .unwrap();
        assert!(!denied.allowed);

        let verdict = AwsPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope(
                    "aws ec2 terminate-instances --instance-ids i-1",
                    "aws:write",
                ),
            )
            .unwrap();
        assert!(verdict.requires_approval);
    }

    #[test]
    fn aws_bucket_removal_needs_approval() {
        let verdict = AwsPlugin
            .pre_run_check(
                &ctx(),
                &payload_with_scope("aws s3 rb s3://my-bucket --force", "aws:write"),
            )
            .unwrap();
        assert!(verdict.requires_approval);
        assert_eq!(verdict.metadata["service"], "s3");
    }
}
