// SPDX-License-Identifier: MIT OR Apache-2.0
//! The agent-local job table.
//!
//! One [`Job`] per admitted signed job. The table is the only shared
//! mutable state between the admission handlers and the workers; it is
//! guarded by a reader/writer lock that is never held across a suspension
//! point.

use chrono::{DateTime, Utc};
use cordon_core::{JobPayload, JobResult, JobStatus, LogFrame};
use cordon_sandbox::cancel::{CancelHandle, CancelReason};
use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};

/// Bound of each job's log channel. Intermediate frames are dropped when
/// the buffer is full; the final frame is sent blocking and never dropped.
pub const LOG_CHANNEL_CAPACITY: usize = 256;

/// One admitted job and its execution state.
pub struct Job {
    /// The verified payload.
    pub payload: JobPayload,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Terminal result; always present once the status is terminal.
    pub result: Option<JobResult>,
    /// When the job was admitted.
    pub created_at: DateTime<Utc>,
    /// Cancellation handle shared with the worker and the sandbox.
    pub cancel: CancelHandle,
    log_tx: mpsc::Sender<LogFrame>,
    log_rx: Option<mpsc::Receiver<LogFrame>>,
}

impl Job {
    fn new(payload: JobPayload) -> Self {
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        Self {
            payload,
            status: JobStatus::Pending,
            result: None,
            created_at: Utc::now(),
            cancel: CancelHandle::new(),
            log_tx,
            log_rx: Some(log_rx),
        }
    }
}

/// Errors from table mutations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JobTableError {
    /// A job with this id is already admitted (idempotency key collision).
    #[error("job {0} already exists")]
    AlreadyExists(String),
    /// No job with this id.
    #[error("job {0} not found")]
    NotFound(String),
    /// The log stream for this job was already claimed by a subscriber.
    #[error("log stream for job {0} already attached")]
    StreamTaken(String),
    /// The requested status change would violate the state machine.
    #[error("job {id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Job id.
        id: String,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },
}

/// Status plus result, as returned to HTTP clients.
#[derive(Debug, Clone)]
pub struct JobView {
    /// Job id.
    pub job_id: String,
    /// Current status.
    pub status: JobStatus,
    /// Terminal result, when available.
    pub result: Option<JobResult>,
}

/// The table of all admitted jobs, keyed by job id.
#[derive(Default)]
pub struct JobTable {
    jobs: RwLock<HashMap<String, Job>>,
}

impl JobTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a payload, creating a pending job.
    ///
    /// # Errors
    ///
    /// [`JobTableError::AlreadyExists`] when the id is already admitted.
    pub async fn insert(&self, payload: JobPayload) -> Result<(), JobTableError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&payload.job_id) {
            return Err(JobTableError::AlreadyExists(payload.job_id));
        }
        jobs.insert(payload.job_id.clone(), Job::new(payload));
        Ok(())
    }

    /// Current status and result of a job.
    pub async fn view(&self, id: &str) -> Option<JobView> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| JobView {
            job_id: id.to_string(),
            status: job.status,
            result: job.result.clone(),
        })
    }

    /// The payload of a job.
    pub async fn payload(&self, id: &str) -> Option<JobPayload> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| job.payload.clone())
    }

    /// The cancellation handle of a job.
    pub async fn cancel_handle(&self, id: &str) -> Option<CancelHandle> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| job.cancel.clone())
    }

    /// The log-frame producer for a job.
    pub async fn log_sender(&self, id: &str) -> Option<mpsc::Sender<LogFrame>> {
        let jobs = self.jobs.read().await;
        jobs.get(id).map(|job| job.log_tx.clone())
    }

    /// Claim the single log-frame consumer for a job.
    ///
    /// # Errors
    ///
    /// [`JobTableError::NotFound`] or [`JobTableError::StreamTaken`].
    pub async fn take_log_receiver(
        &self,
        id: &str,
    ) -> Result<mpsc::Receiver<LogFrame>, JobTableError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobTableError::NotFound(id.to_string()))?;
        job.log_rx
            .take()
            .ok_or_else(|| JobTableError::StreamTaken(id.to_string()))
    }

    /// Transition a job's status, enforcing the state machine.
    ///
    /// # Errors
    ///
    /// [`JobTableError::NotFound`] or [`JobTableError::InvalidTransition`].
    pub async fn transition(&self, id: &str, next: JobStatus) -> Result<(), JobTableError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobTableError::NotFound(id.to_string()))?;
        if !job.status.can_transition_to(next) {
            return Err(JobTableError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        Ok(())
    }

    /// Attach the terminal result to a job.
    ///
    /// # Errors
    ///
    /// [`JobTableError::NotFound`].
    pub async fn set_result(&self, id: &str, result: JobResult) -> Result<(), JobTableError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobTableError::NotFound(id.to_string()))?;
        job.result = Some(result);
        Ok(())
    }

    /// Remove a job entirely (failed admissions only).
    pub async fn remove(&self, id: &str) {
        self.jobs.write().await.remove(id);
    }

    /// Cancel every non-terminal job with the given reason.
    pub async fn cancel_all(&self, reason: CancelReason) {
        let jobs = self.jobs.read().await;
        for job in jobs.values() {
            if !job.status.is_terminal() {
                job.cancel.cancel(reason);
            }
        }
    }

    /// Number of jobs currently in the given status.
    pub async fn count_in(&self, status: JobStatus) -> usize {
        let jobs = self.jobs.read().await;
        jobs.values().filter(|j| j.status == status).count()
    }

    /// Total number of tracked jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::JobPayloadBuilder;

    fn payload(id: &str) -> JobPayload {
        JobPayloadBuilder::new("echo hi").job_id(id).build()
    }

    #[tokio::test]
    async fn insert_then_view() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        let view = table.view("a").await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert!(view.result.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        let err = table.insert(payload("a")).await.unwrap_err();
        assert_eq!(err, JobTableError::AlreadyExists("a".into()));
    }

    #[tokio::test]
    async fn transitions_follow_state_machine() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        table.transition("a", JobStatus::Running).await.unwrap();
        table.transition("a", JobStatus::Completed).await.unwrap();

        let err = table
            .transition("a", JobStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, JobTableError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_to_rejected_is_valid() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        table.transition("a", JobStatus::Rejected).await.unwrap();
        assert_eq!(table.view("a").await.unwrap().status, JobStatus::Rejected);
    }

    #[tokio::test]
    async fn log_receiver_is_single_take() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        assert!(table.take_log_receiver("a").await.is_ok());
        assert_eq!(
            table.take_log_receiver("a").await.unwrap_err(),
            JobTableError::StreamTaken("a".into())
        );
    }

    #[tokio::test]
    async fn frames_flow_from_sender_to_receiver() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        let tx = table.log_sender("a").await.unwrap();
        let mut rx = table.take_log_receiver("a").await.unwrap();

        tx.send(LogFrame::terminal("a", "")).await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.is_final);
    }

    #[tokio::test]
    async fn cancel_all_skips_terminal_jobs() {
        let table = JobTable::new();
        table.insert(payload("running")).await.unwrap();
        table.insert(payload("done")).await.unwrap();
        table.transition("done", JobStatus::Rejected).await.unwrap();

        table.cancel_all(CancelReason::SystemShutdown).await;

        let running = table.cancel_handle("running").await.unwrap();
        let done = table.cancel_handle("done").await.unwrap();
        assert!(running.is_cancelled());
        assert!(!done.is_cancelled());
    }

    #[tokio::test]
    async fn count_in_tracks_statuses() {
        let table = JobTable::new();
        table.insert(payload("a")).await.unwrap();
        table.insert(payload("b")).await.unwrap();
        table.transition("b", JobStatus::Running).await.unwrap();
        assert_eq!(table.count_in(JobStatus::Pending).await, 1);
        assert_eq!(table.count_in(JobStatus::Running).await, 1);
        assert_eq!(table.len().await, 2);
    }
}
