// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-client
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Controller-side access to an agent: sign a payload, submit it, poll its
//! status. Log streaming is a WebSocket concern and lives with the caller.
//!
//! Retries follow the transport contract: capped exponential backoff on
//! 5xx and network errors, never on 4xx. A retry resubmits the *same*
//! signed job; the agent's duplicate-id rejection makes the submission
//! idempotent.

use cordon_core::{JobPayload, JobResult, JobStatus, SignedJob};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry schedule for agent calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling each time and
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Signing the payload failed.
    #[error("sign job: {0}")]
    Sign(#[from] cordon_codec::SignError),
    /// The agent answered with a non-retryable 4xx.
    #[error("agent rejected the request ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Error message from the agent.
        message: String,
    },
    /// Every attempt failed with a retryable error.
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The final error.
        last: String,
    },
    /// A response body could not be decoded.
    #[error("decode agent response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Response to a job submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitReceipt {
    /// The admitted job id.
    pub job_id: String,
    /// Status at admission (always `pending`).
    pub status: JobStatus,
}

/// Response to a status poll.
#[derive(Debug, Clone, Deserialize)]
pub struct JobStatusView {
    /// The job id.
    pub job_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Terminal result, when available.
    #[serde(default)]
    pub result: Option<JobResult>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Whether a response status should be retried.
#[must_use]
pub fn is_retryable(status: u16) -> bool {
    status >= 500
}

/// Sign a payload for submission.
///
/// # Errors
///
/// Returns [`ClientError::Sign`] when canonicalization fails.
pub fn sign_job(payload: JobPayload, secret: &[u8]) -> Result<SignedJob, ClientError> {
    Ok(cordon_codec::sign(payload, secret)?)
}

/// HTTP client for one agent.
pub struct AgentClient {
    base_url: String,
    secret: Vec<u8>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl AgentClient {
    /// Client for the agent at `base_url` (e.g. `https://agent:8443`),
    /// sharing `secret` with it.
    #[must_use]
    pub fn new(base_url: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
            http: reqwest::Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry schedule.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sign and submit a payload.
    ///
    /// # Errors
    ///
    /// [`ClientError::Sign`], [`ClientError::Rejected`] (4xx), or
    /// [`ClientError::Exhausted`] after the retry budget.
    pub async fn submit(&self, payload: JobPayload) -> Result<SubmitReceipt, ClientError> {
        let signed = sign_job(payload, &self.secret)?;
        self.submit_signed(&signed).await
    }

    /// Submit an already-signed job (retries reuse the identical bytes).
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] (4xx) or [`ClientError::Exhausted`].
    pub async fn submit_signed(&self, signed: &SignedJob) -> Result<SubmitReceipt, ClientError> {
        let url = format!("{}/api/v1/jobs", self.base_url);
        let body = self
            .request_with_retry(|| self.http.post(&url).json(signed))
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Poll a job's status.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] (4xx) or [`ClientError::Exhausted`].
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusView, ClientError> {
        let url = format!("{}/api/v1/jobs/{job_id}", self.base_url);
        let body = self.request_with_retry(|| self.http.get(&url)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Check agent health.
    ///
    /// # Errors
    ///
    /// [`ClientError::Rejected`] (4xx) or [`ClientError::Exhausted`].
    pub async fn health(&self) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}/health", self.base_url);
        let body = self.request_with_retry(|| self.http.get(&url)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<String, ClientError> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!(attempt, ?delay, "retrying agent request");
                tokio::time::sleep(delay).await;
            }

            let response = match build().send().await {
                Ok(response) => response,
                Err(error) => {
                    warn!(attempt, %error, "agent request transport error");
                    last_error = error.to_string();
                    continue;
                }
            };

            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();

            if (200..300).contains(&status) {
                return Ok(body);
            }
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| body.clone());

            if !is_retryable(status) {
                return Err(ClientError::Rejected { status, message });
            }
            warn!(attempt, status, %message, "agent request failed; will retry");
            last_error = format!("{status}: {message}");
        }
        Err(ClientError::Exhausted {
            attempts: self.retry.max_attempts,
            last: last_error,
        })
    }
}
