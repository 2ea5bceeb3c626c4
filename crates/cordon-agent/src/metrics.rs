// SPDX-License-Identifier: MIT OR Apache-2.0
//! Operational counters and their text exposition.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-wide job counters.
///
/// Rendered in the Prometheus text exposition format so external scrapers
/// need no special client.
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_total: AtomicU64,
    jobs_running: AtomicI64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_rejected: AtomicU64,
}

impl Metrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A job was admitted.
    pub fn job_admitted(&self) {
        self.jobs_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A job entered `running`.
    pub fn job_started(&self) {
        self.jobs_running.fetch_add(1, Ordering::Relaxed);
    }

    /// A running job reached a terminal state.
    pub fn job_stopped(&self) {
        self.jobs_running.fetch_sub(1, Ordering::Relaxed);
    }

    /// A job completed (timeouts count as failures, not completions).
    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A job failed (including timeouts and infrastructure errors).
    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A job was rejected by the check chain.
    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Current running gauge (for tests).
    #[must_use]
    pub fn running(&self) -> i64 {
        self.jobs_running.load(Ordering::Relaxed)
    }

    /// Total jobs admitted (for tests).
    #[must_use]
    pub fn total(&self) -> u64 {
        self.jobs_total.load(Ordering::Relaxed)
    }

    /// Render the counters in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("# HELP cordon_jobs_total Total jobs admitted.\n");
        out.push_str("# TYPE cordon_jobs_total counter\n");
        out.push_str(&format!(
            "cordon_jobs_total {}\n",
            self.jobs_total.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP cordon_jobs_running Jobs currently executing.\n");
        out.push_str("# TYPE cordon_jobs_running gauge\n");
        out.push_str(&format!(
            "cordon_jobs_running {}\n",
            self.jobs_running.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP cordon_jobs_completed Jobs that completed.\n");
        out.push_str("# TYPE cordon_jobs_completed counter\n");
        out.push_str(&format!(
            "cordon_jobs_completed {}\n",
            self.jobs_completed.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP cordon_jobs_failed Jobs that failed or timed out.\n");
        out.push_str("# TYPE cordon_jobs_failed counter\n");
        out.push_str(&format!(
            "cordon_jobs_failed {}\n",
            self.jobs_failed.load(Ordering::Relaxed)
        ));
        out.push_str("# HELP cordon_jobs_rejected Jobs denied by the check chain.\n");
        out.push_str("# TYPE cordon_jobs_rejected counter\n");
        out.push_str(&format!(
            "cordon_jobs_rejected {}\n",
            self.jobs_rejected.load(Ordering::Relaxed)
        ));
        out
    }
}
