// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scripted sandbox for tests.
//!
//! Results are keyed by command substring; the first matching script wins.
//! A scripted latency longer than the job's timeout produces the real
//! timeout contract (exit 124, flushed output, timeout error), so the full
//! pipeline can be exercised without a container runtime.

use crate::cancel::CancellationToken;
use crate::{Sandbox, SandboxResult, short_id};
use async_trait::async_trait;
use chrono::Utc;
use cordon_core::{EXIT_INFRA, EXIT_TIMEOUT, SandboxOptions};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// One scripted response.
#[derive(Debug, Clone)]
pub struct Script {
    /// Commands containing this substring use this script.
    pub needle: String,
    /// Exit code to report.
    pub exit_code: i64,
    /// Stdout to report.
    pub stdout: String,
    /// Stderr to report.
    pub stderr: String,
    /// Simulated execution latency.
    pub latency: Duration,
    /// Simulate an infrastructure failure with this message.
    pub infra_error: Option<String>,
}

impl Script {
    /// A successful script echoing `stdout`.
    #[must_use]
    pub fn ok(needle: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            latency: Duration::ZERO,
            infra_error: None,
        }
    }

    /// A script exiting with `code` and the given stderr.
    #[must_use]
    pub fn failing(needle: impl Into<String>, code: i64, stderr: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.into(),
            latency: Duration::ZERO,
            infra_error: None,
        }
    }

    /// A script that simulates an infrastructure failure.
    #[must_use]
    pub fn infra(needle: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            needle: needle.into(),
            exit_code: EXIT_INFRA,
            stdout: String::new(),
            stderr: String::new(),
            latency: Duration::ZERO,
            infra_error: Some(message.into()),
        }
    }

    /// Add simulated latency.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add partial stdout that survives a timeout kill.
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }
}

/// A [`Sandbox`] that replays scripts instead of running containers.
#[derive(Default)]
pub struct MockSandbox {
    scripts: Mutex<Vec<Script>>,
    calls: Mutex<Vec<String>>,
}

impl MockSandbox {
    /// An empty mock: every command succeeds with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a script; earlier scripts take precedence.
    pub fn script(&self, script: Script) {
        self.scripts.lock().expect("mock scripts poisoned").push(script);
    }

    /// Commands that have been executed, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock calls poisoned").clone()
    }

    fn lookup(&self, command: &str) -> Option<Script> {
        self.scripts
            .lock()
            .expect("mock scripts poisoned")
            .iter()
            .find(|s| command.contains(&s.needle))
            .cloned()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn run(
        &self,
        command: &str,
        options: &SandboxOptions,
        cancel: &CancellationToken,
    ) -> SandboxResult {
        self.calls
            .lock()
            .expect("mock calls poisoned")
            .push(command.to_string());

        let start = Utc::now();
        let script = self
            .lookup(command)
            .unwrap_or_else(|| Script::ok("", ""));

        if let Some(message) = script.infra_error {
            return SandboxResult::infrastructure(start, message);
        }

        let sandbox_id = short_id(&Uuid::new_v4().simple().to_string());
        let timed_out = script.latency > options.timeout;
        let sleep_for = script.latency.min(options.timeout);

        let cancelled = tokio::select! {
            () = tokio::time::sleep(sleep_for) => false,
            () = cancel.cancelled() => true,
        };

        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds().max(0) as u64;

        let (exit_code, error) = if cancelled {
            (EXIT_INFRA, Some("cancelled before completion".to_string()))
        } else if timed_out {
            (
                EXIT_TIMEOUT,
                Some(format!(
                    "execution timeout after {}s",
                    options.timeout.as_secs()
                )),
            )
        } else {
            (script.exit_code, None)
        };

        SandboxResult {
            sandbox_id,
            exit_code,
            stdout: script.stdout,
            stderr: script.stderr,
            start_time: start,
            end_time: end,
            duration_ms,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SandboxOptions {
        SandboxOptions::default()
    }

    #[tokio::test]
    async fn unscripted_command_succeeds_empty() {
        let mock = MockSandbox::new();
        let result = mock
            .run("echo hello", &options(), &CancellationToken::new())
            .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.is_empty());
        assert_eq!(result.sandbox_id.len(), 12);
        assert_eq!(mock.calls(), vec!["echo hello"]);
    }

    #[tokio::test]
    async fn scripted_output_is_returned() {
        let mock = MockSandbox::new();
        mock.script(Script::ok("echo hello", "hello\n"));
        let result = mock
            .run("echo hello", &options(), &CancellationToken::new())
            .await;
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
    }

    #[tokio::test]
    async fn first_matching_script_wins() {
        let mock = MockSandbox::new();
        mock.script(Script::failing("deploy", 3, "boom"));
        mock.script(Script::ok("deploy", "never"));
        let result = mock
            .run("./deploy.sh", &options(), &CancellationToken::new())
            .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "boom");
    }

    #[tokio::test]
    async fn latency_beyond_timeout_is_exit_124_with_flushed_output() {
        let mock = MockSandbox::new();
        mock.script(
            Script::ok("sleep 10", "partial")
                .with_latency(Duration::from_secs(10)),
        );
        let mut opts = options();
        opts.timeout = Duration::from_millis(20);
        let result = mock
            .run("sleep 10", &opts, &CancellationToken::new())
            .await;
        assert_eq!(result.exit_code, cordon_core::EXIT_TIMEOUT);
        assert_eq!(result.stdout, "partial");
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_execution() {
        let mock = MockSandbox::new();
        mock.script(Script::ok("slow", "").with_latency(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = mock.run("slow thing", &options(), &cancel).await;
        assert_eq!(result.exit_code, cordon_core::EXIT_INFRA);
        assert!(result.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn infra_script_reports_sentinel() {
        let mock = MockSandbox::new();
        mock.script(Script::infra("docker", "daemon unreachable"));
        let result = mock
            .run("docker ps", &options(), &CancellationToken::new())
            .await;
        assert_eq!(result.exit_code, cordon_core::EXIT_INFRA);
        assert!(result.sandbox_id.is_empty());
    }
}
