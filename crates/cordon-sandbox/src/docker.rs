// SPDX-License-Identifier: MIT OR Apache-2.0
//! Docker-backed sandbox runner.
//!
//! Each execution is a fresh one-shot container: non-root user, resource
//! limits from [`SandboxOptions`], no network unless requested, killed on
//! timeout, removed on every exit path.

use crate::cancel::CancellationToken;
use crate::{Sandbox, SandboxResult, short_id};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use cordon_core::{EXIT_INFRA, EXIT_TIMEOUT, SandboxOptions};
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors raised while talking to the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The Docker daemon rejected a call or was unreachable.
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    /// The wait stream closed without reporting an exit.
    #[error("sandbox wait stream ended unexpectedly")]
    WaitEnded,
}

enum WaitOutcome {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Production [`Sandbox`] implementation on top of the local Docker daemon.
pub struct DockerSandbox {
    docker: Docker,
    user: String,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon with the default non-root user.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Docker`] when the daemon is unreachable.
    pub fn new() -> Result<Self, SandboxError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
            user: "1000:1000".to_string(),
        })
    }

    /// Override the container UID/GID.
    #[must_use]
    pub fn with_user(mut self, uid: u32, gid: u32) -> Self {
        self.user = format!("{uid}:{gid}");
        self
    }

    /// Pull the image when it is not available locally, blocking until the
    /// pull completes.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        debug!(image, "pulling sandbox image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    async fn create(&self, command: &str, options: &SandboxOptions) -> Result<String, SandboxError> {
        self.ensure_image(&options.image).await?;

        let name = format!("cordon-{}", short_id(&Uuid::new_v4().simple().to_string()));
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container_config(&self.user, command, options),
            )
            .await?;
        Ok(created.id)
    }

    async fn execute(
        &self,
        id: &str,
        options: &SandboxOptions,
        cancel: &CancellationToken,
        start: chrono::DateTime<Utc>,
    ) -> Result<SandboxResult, SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;

        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);

        let outcome = tokio::select! {
            waited = tokio::time::timeout(options.timeout, wait.next()) => match waited {
                Ok(Some(Ok(response))) => WaitOutcome::Exited(response.status_code),
                // bollard reports non-zero exits through the error channel.
                Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError {
                    code, ..
                }))) => WaitOutcome::Exited(code),
                Ok(Some(Err(other))) => return Err(other.into()),
                Ok(None) => return Err(SandboxError::WaitEnded),
                Err(_elapsed) => WaitOutcome::TimedOut,
            },
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
        };

        if matches!(outcome, WaitOutcome::TimedOut | WaitOutcome::Cancelled) {
            if let Err(error) = self
                .docker
                .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await
            {
                warn!(sandbox = short_id(id), %error, "kill after timeout failed");
            }
        }

        // Best-effort capture even after a kill: buffered output survives.
        let (stdout, stderr) = self.capture_output(id).await.unwrap_or_default();

        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds().max(0) as u64;
        let (exit_code, error) = match outcome {
            WaitOutcome::Exited(code) => (code, None),
            WaitOutcome::TimedOut => (
                EXIT_TIMEOUT,
                Some(format!(
                    "execution timeout after {}s",
                    options.timeout.as_secs()
                )),
            ),
            WaitOutcome::Cancelled => (EXIT_INFRA, Some("cancelled before completion".into())),
        };

        Ok(SandboxResult {
            sandbox_id: short_id(id),
            exit_code,
            stdout,
            stderr,
            start_time: start,
            end_time: end,
            duration_ms,
            error,
        })
    }

    /// Read back the container log, demultiplexed into the two streams.
    async fn capture_output(&self, id: &str) -> Result<(String, String), SandboxError> {
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn cleanup(&self, id: &str) {
        if let Err(error) = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(sandbox = short_id(id), %error, "sandbox removal failed");
        }
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(
        &self,
        command: &str,
        options: &SandboxOptions,
        cancel: &CancellationToken,
    ) -> SandboxResult {
        let start = Utc::now();

        let id = match self.create(command, options).await {
            Ok(id) => id,
            Err(error) => {
                return SandboxResult::infrastructure(start, format!("create sandbox: {error}"));
            }
        };

        let result = self.execute(&id, options, cancel, start).await;
        // Cleanup happens on every exit path before returning to the caller.
        self.cleanup(&id).await;

        match result {
            Ok(result) => result,
            Err(error) => {
                SandboxResult::infrastructure(start, format!("run sandbox: {error}"))
            }
        }
    }
}

/// CPU cores → Docker `NanoCpus`.
fn nano_cpus(cores: f64) -> i64 {
    (cores * 1e9) as i64
}

/// Build the one-shot container configuration for a command.
fn container_config(user: &str, command: &str, options: &SandboxOptions) -> Config<String> {
    let binds: Vec<String> = options.mounts.iter().map(|m| m.to_bind()).collect();
    let host_config = HostConfig {
        nano_cpus: Some(nano_cpus(options.cpu_limit)),
        memory: Some(options.memory_limit as i64),
        pids_limit: Some(options.pids_limit),
        network_mode: Some(
            if options.network_access {
                "bridge"
            } else {
                "none"
            }
            .to_string(),
        ),
        readonly_rootfs: Some(options.read_only),
        binds: if binds.is_empty() { None } else { Some(binds) },
        auto_remove: Some(false),
        ..Default::default()
    };

    Config {
        image: Some(options.image.clone()),
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]),
        user: Some(user.to_string()),
        working_dir: Some(options.working_dir.clone()),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}
