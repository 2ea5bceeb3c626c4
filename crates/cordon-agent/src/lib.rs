// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-agent
#![deny(unsafe_code)]
//!
//! The agent: admits signed jobs over HTTPS, schedules them on a bounded
//! worker pool, executes each inside a sandbox, streams log frames over
//! WebSocket, and records every attempt in the audit store.

/// The agent-local job table.
pub mod job;
/// Operational counters.
pub mod metrics;
/// WebSocket log streaming.
pub mod stream;
/// The worker pool.
pub mod worker;

use axum::{
    Json, Router,
    extract::{Path as AxPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use cordon_audit::AuditStore;
use cordon_approval::ApprovalStore;
use cordon_codec::VerifyError;
use cordon_config::AgentConfig;
use cordon_core::{JobStatus, RunRecord, SandboxOptions, SignedJob};
use cordon_policy::CheckChain;
use cordon_sandbox::Sandbox;
use cordon_sandbox::cancel::{CancelReason, CancellationToken};
use job::JobTable;
use metrics::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Bound of the admission queue. Overflow turns into a 503 rather than
/// unbounded memory growth.
pub const JOB_QUEUE_CAPACITY: usize = 1024;

/// Shared state behind every handler and worker.
pub struct AppState {
    /// Validated agent configuration.
    pub config: AgentConfig,
    /// All admitted jobs.
    pub jobs: JobTable,
    /// The compiled check chain.
    pub chain: CheckChain,
    /// Append-only audit store.
    pub audit: AuditStore,
    /// Approval lifecycle store.
    pub approvals: ApprovalStore,
    /// The sandbox runner.
    pub sandbox: Arc<dyn Sandbox>,
    /// Job counters.
    pub metrics: Metrics,
    /// Process-wide shutdown signal.
    pub shutdown: CancellationToken,
    queue_tx: mpsc::Sender<String>,
}

impl AppState {
    /// Assemble the state and the worker-queue receiver.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        chain: CheckChain,
        audit: AuditStore,
        approvals: ApprovalStore,
        sandbox: Arc<dyn Sandbox>,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (queue_tx, queue_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let state = Arc::new(Self {
            config,
            jobs: JobTable::new(),
            chain,
            audit,
            approvals,
            sandbox,
            metrics: Metrics::new(),
            shutdown: CancellationToken::new(),
            queue_tx,
        });
        (state, queue_rx)
    }

    /// Sandbox options derived from the agent configuration defaults.
    #[must_use]
    pub fn sandbox_options(&self) -> SandboxOptions {
        SandboxOptions {
            image: self.config.default_image.clone(),
            cpu_limit: self.config.default_cpu_limit,
            memory_limit: self.config.default_memory_limit,
            timeout: Duration::from_secs(self.config.default_timeout_seconds),
            ..SandboxOptions::default()
        }
    }

    /// Initiate shutdown: cancel running jobs, stop workers, and wait up
    /// to `deadline` for in-flight jobs to finalize.
    pub async fn shutdown(&self, deadline: Duration) {
        info!("agent shutting down");
        self.shutdown.cancel();
        self.jobs.cancel_all(CancelReason::SystemShutdown).await;

        let waited = tokio::time::timeout(deadline, async {
            loop {
                if self.jobs.count_in(JobStatus::Running).await == 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!("shutdown deadline expired with jobs still running");
        }
    }
}

// ---------------------------------------------------------------------------
// API envelopes
// ---------------------------------------------------------------------------

/// Response body for `POST /api/v1/jobs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// The admitted job id.
    pub job_id: String,
    /// Always `pending` on admission.
    pub status: JobStatus,
}

/// Response body for `GET /api/v1/jobs/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    /// The job id.
    pub job_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Terminal result, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<cordon_core::JobResult>,
}

/// Structured API error.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to return.
    pub status: StatusCode,
    /// Human-readable message (already free of secret material).
    pub message: String,
}

impl ApiError {
    /// Create an error with the given status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the Axum router with all agent routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/jobs", post(submit_job))
        .route("/api/v1/jobs/{id}", get(job_status))
        .route("/api/v1/stream/{id}", get(stream::stream_logs))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown is signalled.
///
/// # Errors
///
/// Returns the underlying I/O error when the server fails.
pub async fn serve(state: Arc<AppState>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
    let app = build_app(Arc::clone(&state));
    let shutdown = state.shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(signed): Json<SignedJob>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "agent is shutting down",
        ));
    }

    // Signature, TTL, and freshness checks run before any state mutation.
    if let Err(error) = cordon_codec::verify(
        &signed,
        state.config.hmac_secret.as_bytes(),
        Utc::now().timestamp(),
    ) {
        // An unverifiable payload is never audited: nothing in it can be
        // trusted. Stale-but-authentic payloads are.
        let message = match &error {
            VerifyError::InvalidSignature | VerifyError::Canonicalize => "invalid signature",
            VerifyError::JobExpired { .. } => {
                audit_admission_failure(&state, &signed, "job expired").await;
                "job expired"
            }
            VerifyError::JobTooOld { .. } => {
                audit_admission_failure(&state, &signed, "job too old").await;
                "job too old"
            }
        };
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, message));
    }

    // Controller allowlist.
    if !state
        .config
        .allowed_controllers
        .iter()
        .any(|c| c == &signed.payload.controller_id)
    {
        let message = format!("unknown controller {:?}", signed.payload.controller_id);
        audit_admission_failure(&state, &signed, &message).await;
        return Err(ApiError::new(StatusCode::FORBIDDEN, message));
    }

    // Admit and schedule.
    let job_id = signed.payload.job_id.clone();
    if state.jobs.insert(signed.payload).await.is_err() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("job {job_id:?} already submitted"),
        ));
    }

    if state.queue_tx.try_send(job_id.clone()).is_err() {
        // The queue is bounded; shedding here beats unbounded memory.
        state.jobs.remove(&job_id).await;
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "job queue full",
        ));
    }

    state.metrics.job_admitted();
    info!(job_id, "job admitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let view = state
        .jobs
        .view(&id)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("job {id:?} not found")))?;
    Ok(Json(JobStatusResponse {
        job_id: view.job_id,
        status: view.status,
        result: view.result,
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Record a failed admission (bad signature, stale payload, unknown
/// controller) with `executed = false`.
async fn audit_admission_failure(state: &Arc<AppState>, signed: &SignedJob, reason: &str) {
    let record = RunRecord {
        id: 0,
        timestamp: Utc::now(),
        user: signed.payload.controller_id.clone(),
        prompt: signed.payload.prompt.clone(),
        selected_command: signed.payload.command.clone(),
        sandbox_id: String::new(),
        exit_code: cordon_core::EXIT_INFRA,
        stdout: String::new(),
        stderr: reason.to_string(),
        risk_level: signed.payload.candidate_metadata.risk_level,
        snapshot: None,
        executed: false,
        duration_ms: 0,
        created_at: Utc::now(),
    };
    if let Err(error) = state.audit.log(&record) {
        tracing::error!(%error, "AUDIT WRITE FAILED for admission failure");
    }
}
