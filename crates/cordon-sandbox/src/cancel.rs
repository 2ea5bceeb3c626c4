// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cancellation primitives for job execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cloneable, cheaply-shareable token used to signal cancellation.
///
/// All clones share the same underlying state; cancelling one immediately
/// makes every clone observe `is_cancelled() == true`.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Create a new token that is **not** cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Returns `true` if [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a future that completes when the token is cancelled.
    ///
    /// If the token is already cancelled the future resolves immediately.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            self.inner.notify.notified().await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ── CancelReason ────────────────────────────────────────────────────

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The agent is shutting down.
    SystemShutdown,
    /// An operator asked for this job to stop.
    OperatorRequested,
}

impl CancelReason {
    /// Human-readable description recorded in the audit row.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::SystemShutdown => "cancelled: agent shutting down",
            Self::OperatorRequested => "cancelled: operator request",
        }
    }
}

// ── CancelHandle ────────────────────────────────────────────────────

/// A [`CancellationToken`] paired with the first recorded reason.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<std::sync::Mutex<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Create a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Cancel with the given reason. Only the first reason is recorded;
    /// later calls still signal the token.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut guard = self.reason.lock().expect("cancel reason lock poisoned");
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Returns `true` if cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The recorded reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        *self.reason.lock().expect("cancel reason lock poisoned")
    }

    /// The underlying token, for passing to the sandbox.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
