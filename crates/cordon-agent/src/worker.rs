// SPDX-License-Identifier: MIT OR Apache-2.0
//! The worker pool: takes admitted jobs off the queue and drives each one
//! through check chain → approval gate → snapshot → sandbox → audit.
//!
//! Every admitted job reaches exactly one terminal status and produces
//! exactly one audit row; the final log frame is sent on every path.

use crate::AppState;
use chrono::Utc;
use cordon_core::check::ExecutionContext;
use cordon_core::{
    Approval, ApprovalStatus, EXIT_INFRA, JobPayload, JobResult, JobStatus, LogFrame, RunRecord,
    StreamKind,
};
use cordon_sandbox::SandboxResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Poll interval of the approval wait loop.
const APPROVAL_POLL: Duration = Duration::from_millis(500);

/// Spawn `count` workers consuming job ids from `queue`.
pub fn spawn_workers(
    state: Arc<AppState>,
    queue: mpsc::Receiver<String>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..count)
        .map(|index| {
            let state = Arc::clone(&state);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                worker_loop(index, state, queue).await;
            })
        })
        .collect()
}

async fn worker_loop(index: usize, state: Arc<AppState>, queue: Arc<Mutex<mpsc::Receiver<String>>>) {
    loop {
        // Each worker runs exactly one job at a time; the queue mutex is
        // released before the job itself executes.
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                () = state.shutdown.cancelled() => None,
                id = rx.recv() => id,
            }
        };
        let Some(job_id) = next else {
            info!(worker = index, "worker stopping");
            return;
        };
        process_job(&state, &job_id).await;
    }
}

/// Drive one job from `pending` to a terminal state.
pub async fn process_job(state: &Arc<AppState>, job_id: &str) {
    let Some(payload) = state.jobs.payload(job_id).await else {
        warn!(job_id, "queued job vanished from the table");
        return;
    };
    let Some(cancel) = state.jobs.cancel_handle(job_id).await else {
        return;
    };

    // 1. Check chain.
    let ctx = ExecutionContext::new(
        cordon_core::DEFAULT_WORKING_DIR,
        payload.controller_id.clone(),
    );
    let verdict = state.chain.evaluate(&ctx, &payload);
    if !verdict.allowed {
        let reason = verdict
            .reason
            .unwrap_or_else(|| "denied by policy".to_string());
        info!(job_id, %reason, "job rejected by check chain");
        state.metrics.job_rejected();
        finalize(
            state,
            job_id,
            &payload,
            JobStatus::Rejected,
            denial_result(&payload, JobStatus::Rejected, &reason),
            false,
        )
        .await;
        return;
    }

    // 2. Approval gate.
    if verdict.requires_approval {
        match approval_gate(state, job_id, &payload, verdict.approval_message, &cancel).await {
            GateOutcome::Proceed => {}
            GateOutcome::Stop => return,
        }
    }

    // 3. Pre-run snapshot for destructive candidates.
    let snapshot = if payload.candidate_metadata.destructive {
        Some(payload.snapshot_metadata.clone().unwrap_or_else(|| {
            format!("snapshot-{}-{}", payload.job_id, Utc::now().timestamp())
        }))
    } else {
        None
    };

    // 4. Sandbox execution.
    if state.jobs.transition(job_id, JobStatus::Running).await.is_err() {
        // Cancelled between admission and execution.
        return;
    }
    state.metrics.job_started();
    let options = state.sandbox_options();
    let sandbox_result = state
        .sandbox
        .run(&payload.command, &options, cancel.token())
        .await;
    state.metrics.job_stopped();

    // 5. Stream captured output, then the mandatory final frame.
    emit_output_frames(state, job_id, &sandbox_result).await;

    // 6. Terminal status: infrastructure failures and cancellations fail
    //    the job; every container-reported exit code (124 included)
    //    completes it.
    let status = if sandbox_result.exit_code == EXIT_INFRA {
        JobStatus::Failed
    } else {
        JobStatus::Completed
    };
    if status == JobStatus::Failed || sandbox_result.exit_code == cordon_core::EXIT_TIMEOUT {
        state.metrics.job_failed();
    } else {
        state.metrics.job_completed();
    }

    let executed = !sandbox_result.sandbox_id.is_empty();
    let mut result = job_result(&payload, status, sandbox_result);
    result.snapshot = snapshot;
    if let Some(reason) = cancel.reason() {
        result.error = Some(reason.description().to_string());
    }

    finalize(state, job_id, &payload, status, result, executed).await;
}

enum GateOutcome {
    Proceed,
    Stop,
}

async fn approval_gate(
    state: &Arc<AppState>,
    job_id: &str,
    payload: &JobPayload,
    message: Option<String>,
    cancel: &cordon_sandbox::cancel::CancelHandle,
) -> GateOutcome {
    let request = approval_request(payload, message.as_deref());
    let approval_id = match state.approvals.create(&request) {
        Ok(id) => id,
        Err(error) => {
            error!(job_id, %error, "failed to file approval request");
            state.metrics.job_failed();
            finalize(
                state,
                job_id,
                payload,
                JobStatus::Failed,
                denial_result(payload, JobStatus::Failed, &format!("approval store error: {error}")),
                false,
            )
            .await;
            return GateOutcome::Stop;
        }
    };

    notify(state, job_id, format!("awaiting approval #{approval_id}")).await;
    info!(job_id, approval_id, "job parked awaiting approval");

    let decision = tokio::select! {
        decision = state.approvals.wait_decision(approval_id, APPROVAL_POLL) => decision,
        () = cancel.token().cancelled() => {
            let reason = cancel
                .reason()
                .map_or("cancelled", |r| r.description());
            state.metrics.job_failed();
            finalize(
                state,
                job_id,
                payload,
                JobStatus::Failed,
                denial_result(payload, JobStatus::Failed, reason),
                false,
            )
            .await;
            return GateOutcome::Stop;
        }
    };

    match decision {
        Ok(approval) if approval.status == ApprovalStatus::Approved => GateOutcome::Proceed,
        Ok(approval) => {
            let reason = approval
                .rejection_reason
                .unwrap_or_else(|| "no reason given".to_string());
            info!(job_id, approval_id, %reason, "approval rejected");
            state.metrics.job_failed();
            finalize(
                state,
                job_id,
                payload,
                JobStatus::Failed,
                denial_result(payload, JobStatus::Failed, &format!("approval rejected: {reason}")),
                false,
            )
            .await;
            GateOutcome::Stop
        }
        Err(error) => {
            warn!(job_id, %error, "approval wait failed");
            state.metrics.job_failed();
            finalize(
                state,
                job_id,
                payload,
                JobStatus::Failed,
                denial_result(payload, JobStatus::Failed, "approval wait failed"),
                false,
            )
            .await;
            GateOutcome::Stop
        }
    }
}

/// Send stdout/stderr as non-blocking frames; drops are acceptable for
/// intermediate frames (the audit row keeps the full output).
async fn emit_output_frames(state: &Arc<AppState>, job_id: &str, result: &SandboxResult) {
    let Some(tx) = state.jobs.log_sender(job_id).await else {
        return;
    };
    if !result.stdout.is_empty() {
        let _ = tx.try_send(LogFrame::output(job_id, StreamKind::Stdout, &result.stdout));
    }
    if !result.stderr.is_empty() {
        let _ = tx.try_send(LogFrame::output(job_id, StreamKind::Stderr, &result.stderr));
    }
}

async fn notify(state: &Arc<AppState>, job_id: &str, message: String) {
    if let Some(tx) = state.jobs.log_sender(job_id).await {
        let _ = tx.try_send(LogFrame::output(job_id, StreamKind::Stdout, message));
    }
}

/// Write the terminal state: result, status, final frame, audit row.
async fn finalize(
    state: &Arc<AppState>,
    job_id: &str,
    payload: &JobPayload,
    status: JobStatus,
    result: JobResult,
    executed: bool,
) {
    if let Err(error) = state.jobs.set_result(job_id, result.clone()).await {
        warn!(job_id, %error, "failed to attach result");
    }
    if let Err(error) = state.jobs.transition(job_id, status).await {
        warn!(job_id, %error, "terminal transition refused");
    }

    // The final frame is sent blocking so it is never dropped; the channel
    // holds at most a handful of frames, so this cannot deadlock.
    if let Some(tx) = state.jobs.log_sender(job_id).await {
        let data = result.error.clone().unwrap_or_default();
        let _ = tx.send(LogFrame::terminal(job_id, data)).await;
    }

    let record = RunRecord {
        id: 0,
        timestamp: result.start_time,
        user: payload.controller_id.clone(),
        prompt: payload.prompt.clone(),
        selected_command: payload.command.clone(),
        sandbox_id: result.sandbox_id.clone(),
        exit_code: result.exit_code,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        risk_level: payload.candidate_metadata.risk_level,
        snapshot: result.snapshot.clone(),
        executed,
        duration_ms: result.duration_ms,
        created_at: Utc::now(),
    };
    // Audit failures must never fail the job itself; they are logged
    // loudly and the response proceeds.
    if let Err(error) = state.audit.log(&record) {
        error!(job_id, %error, "AUDIT WRITE FAILED; execution record lost");
    }
}

fn approval_request(payload: &JobPayload, message: Option<&str>) -> Approval {
    Approval {
        id: 0,
        run_id: payload.job_id.clone(),
        prompt: message
            .map(|m| format!("{} [{m}]", payload.prompt))
            .unwrap_or_else(|| payload.prompt.clone()),
        command: payload.command.clone(),
        risk_level: payload.candidate_metadata.risk_level,
        required_scopes: payload.required_scopes.clone(),
        plugin_metadata: payload.plugin_metadata.clone(),
        requested_by: payload.controller_id.clone(),
        requested_at: Utc::now(),
        status: ApprovalStatus::Pending,
        approved_by: None,
        approved_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
        confirmation: String::new(),
        approval_note: None,
    }
}

/// A result for jobs that never reached a sandbox.
fn denial_result(payload: &JobPayload, status: JobStatus, reason: &str) -> JobResult {
    let now = Utc::now();
    JobResult {
        job_id: payload.job_id.clone(),
        status,
        sandbox_id: String::new(),
        exit_code: EXIT_INFRA,
        stdout: String::new(),
        stderr: String::new(),
        start_time: now,
        end_time: now,
        duration_ms: 0,
        error: Some(reason.to_string()),
        snapshot: None,
    }
}

fn job_result(payload: &JobPayload, status: JobStatus, sandbox: SandboxResult) -> JobResult {
    JobResult {
        job_id: payload.job_id.clone(),
        status,
        sandbox_id: sandbox.sandbox_id,
        exit_code: sandbox.exit_code,
        stdout: sandbox.stdout,
        stderr: sandbox.stderr,
        start_time: sandbox.start_time,
        end_time: sandbox.end_time,
        duration_ms: sandbox.duration_ms,
        error: sandbox.error,
        snapshot: None,
    }
}
