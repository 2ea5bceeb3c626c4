// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-sandbox
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! One-shot, resource-limited sandbox execution.
//!
//! The [`Sandbox`] trait is the seam between the agent's job workers and the
//! container runtime: [`docker::DockerSandbox`] is the production
//! implementation, [`mock::MockSandbox`] the scripted one for tests. A
//! sandbox is never reused between jobs, output capture completes before
//! `run` returns, and resources are cleaned up on every exit path.

/// Cancellation primitives shared by workers and sandboxes.
pub mod cancel;
/// Docker-backed sandbox runner.
pub mod docker;
/// Scripted sandbox for tests.
pub mod mock;

use async_trait::async_trait;
use cancel::CancellationToken;
use chrono::{DateTime, Utc};
use cordon_core::SandboxOptions;

/// The outcome of one sandbox execution.
///
/// Timeouts and infrastructure failures are *results*, not errors: the
/// envelope always comes back, with `exit_code`/`error` describing what
/// happened ([`cordon_core::EXIT_TIMEOUT`], [`cordon_core::EXIT_INFRA`]).
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// First 12 hex characters of the container id; enough for audit
    /// correlation without leaking the full internal id.
    pub sandbox_id: String,
    /// Process exit code (or a sentinel).
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// When execution started.
    pub start_time: DateTime<Utc>,
    /// When execution finished.
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Populated for timeouts, cancellations, and infrastructure failures.
    pub error: Option<String>,
}

impl SandboxResult {
    /// Build an infrastructure-failure result covering `start..now`.
    #[must_use]
    pub fn infrastructure(start: DateTime<Utc>, error: impl Into<String>) -> Self {
        let end = Utc::now();
        Self {
            sandbox_id: String::new(),
            exit_code: cordon_core::EXIT_INFRA,
            stdout: String::new(),
            stderr: String::new(),
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds().max(0) as u64,
            error: Some(error.into()),
        }
    }
}

/// A runner that executes one command in a fresh, disposable sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Execute `command` under `options`, honoring `cancel`.
    ///
    /// Returns when the sandbox has exited (or been killed) and all output
    /// has been captured; no residual bytes stream in the background.
    async fn run(
        &self,
        command: &str,
        options: &SandboxOptions,
        cancel: &CancellationToken,
    ) -> SandboxResult;
}

/// Truncate a full container id to the 12-hex-char audit form.
#[must_use]
pub fn short_id(full: &str) -> String {
    full.chars().take(12).collect()
}
