// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-approval
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Pending → approved/rejected approval lifecycle with a typed-confirmation
//! requirement.
//!
//! Transitions away from `pending` are one-way and performed atomically
//! (`UPDATE … WHERE status = 'pending'`): when two reviewers race, exactly
//! one wins and the loser observes [`ApprovalError::NotPending`].

use chrono::{DateTime, Utc};
use cordon_core::{Approval, ApprovalStatus, RiskLevel};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Schema version written by the current code.
const SCHEMA_VERSION: i64 = 1;

/// Errors from approval-store operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No approval row with the given id.
    #[error("approval {id} not found")]
    NotFound {
        /// The id that was requested.
        id: i64,
    },
    /// The row is no longer pending (already decided, or a racing caller
    /// won the transition).
    #[error("approval {id} is not pending")]
    NotPending {
        /// The id that was requested.
        id: i64,
    },
    /// The typed confirmation string did not match `APPROVE <id>`.
    #[error("confirmation mismatch for approval {id}")]
    BadConfirmation {
        /// The id that was requested.
        id: i64,
    },
    /// A rejection requires a non-empty reason.
    #[error("rejection reason must not be empty")]
    BadReason,
    /// The underlying SQLite call failed.
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    /// A stored row could not be decoded.
    #[error("corrupt approval row: {0}")]
    Corrupt(String),
    /// The database schema is newer than this build understands.
    #[error("unsupported schema version {found} (supported <= {SCHEMA_VERSION})")]
    SchemaTooNew {
        /// Version found in the database.
        found: i64,
    },
}

/// The confirmation string a reviewer must type to approve row `id`.
#[must_use]
pub fn confirmation_phrase(id: i64) -> String {
    format!("APPROVE {id}")
}

/// The approval lifecycle store.
pub struct ApprovalStore {
    conn: Mutex<Connection>,
}

impl ApprovalStore {
    /// Open (and migrate) the approval database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError`] when the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self, ApprovalError> {
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory store (tests and ephemeral agents).
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError`] when initialization fails.
    pub fn open_in_memory() -> Result<Self, ApprovalError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ApprovalError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// File a new approval request.
    ///
    /// The stored row starts `pending`; id, confirmation phrase, and
    /// `requested_at` are assigned by the store. Returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Sql`] when the insert fails.
    pub fn create(&self, approval: &Approval) -> Result<i64, ApprovalError> {
        let scopes = serde_json::to_string(&approval.required_scopes)
            .map_err(|e| ApprovalError::Corrupt(e.to_string()))?;
        let metadata = serde_json::to_string(&approval.plugin_metadata)
            .map_err(|e| ApprovalError::Corrupt(e.to_string()))?;

        let conn = self.conn.lock().expect("approval lock poisoned");
        conn.execute(
            "INSERT INTO approvals (
                run_id, prompt, command, risk_level, required_scopes,
                plugin_metadata, requested_by, requested_at, status, confirmation
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', '')",
            params![
                approval.run_id,
                approval.prompt,
                approval.command,
                approval.risk_level.as_str(),
                scopes,
                metadata,
                approval.requested_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        conn.execute(
            "UPDATE approvals SET confirmation = ?1 WHERE id = ?2",
            params![confirmation_phrase(id), id],
        )?;
        Ok(id)
    }

    /// Fetch one approval by id.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError`] on query failure or a corrupt row.
    pub fn get(&self, id: i64) -> Result<Option<Approval>, ApprovalError> {
        let conn = self.conn.lock().expect("approval lock poisoned");
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM approvals WHERE id = ?1"),
            params![id],
            row_to_approval,
        )
        .optional()
        .map_err(ApprovalError::from)
    }

    /// All pending approvals, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError`] on query failure or a corrupt row.
    pub fn list_pending(&self) -> Result<Vec<Approval>, ApprovalError> {
        let conn = self.conn.lock().expect("approval lock poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM approvals WHERE status = 'pending' ORDER BY id"
        ))?;
        let mapped = stmt.query_map([], row_to_approval)?;
        let mut out = Vec::new();
        for row in mapped {
            out.push(row?);
        }
        Ok(out)
    }

    /// Approve a pending row.
    ///
    /// `confirmation` must equal `APPROVE <id>` exactly; a mismatch fails
    /// without mutating state. The transition itself is atomic: a zero-row
    /// update means another caller decided the row first.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::BadConfirmation`], [`ApprovalError::NotFound`],
    /// [`ApprovalError::NotPending`], or [`ApprovalError::Sql`].
    pub fn approve(
        &self,
        id: i64,
        approver: &str,
        confirmation: &str,
        note: Option<&str>,
    ) -> Result<Approval, ApprovalError> {
        if confirmation != confirmation_phrase(id) {
            return Err(ApprovalError::BadConfirmation { id });
        }

        {
            let conn = self.conn.lock().expect("approval lock poisoned");
            let changed = conn.execute(
                "UPDATE approvals
                 SET status = 'approved', approved_by = ?1, approved_at = ?2, approval_note = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![approver, Utc::now().to_rfc3339(), note, id],
            )?;
            if changed == 0 {
                let exists: Option<i64> = conn
                    .query_row("SELECT id FROM approvals WHERE id = ?1", params![id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                return Err(match exists {
                    Some(_) => ApprovalError::NotPending { id },
                    None => ApprovalError::NotFound { id },
                });
            }
        }

        self.get(id)?.ok_or(ApprovalError::NotFound { id })
    }

    /// Reject a pending row with a non-empty reason.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::BadReason`], [`ApprovalError::NotFound`],
    /// [`ApprovalError::NotPending`], or [`ApprovalError::Sql`].
    pub fn reject(&self, id: i64, rejecter: &str, reason: &str) -> Result<Approval, ApprovalError> {
        if reason.trim().is_empty() {
            return Err(ApprovalError::BadReason);
        }

        {
            let conn = self.conn.lock().expect("approval lock poisoned");
            let changed = conn.execute(
                "UPDATE approvals
                 SET status = 'rejected', rejected_by = ?1, rejected_at = ?2, rejection_reason = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![rejecter, Utc::now().to_rfc3339(), reason, id],
            )?;
            if changed == 0 {
                let exists: Option<i64> = conn
                    .query_row("SELECT id FROM approvals WHERE id = ?1", params![id], |r| {
                        r.get(0)
                    })
                    .optional()?;
                return Err(match exists {
                    Some(_) => ApprovalError::NotPending { id },
                    None => ApprovalError::NotFound { id },
                });
            }
        }

        self.get(id)?.ok_or(ApprovalError::NotFound { id })
    }

    /// Poll the row until it leaves `pending`, sleeping `poll` between
    /// checks. Cancellation is the caller's concern (wrap in `select!`).
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] or [`ApprovalError::Sql`].
    pub async fn wait_decision(
        &self,
        id: i64,
        poll: Duration,
    ) -> Result<Approval, ApprovalError> {
        loop {
            let approval = self.get(id)?.ok_or(ApprovalError::NotFound { id })?;
            if approval.status != ApprovalStatus::Pending {
                return Ok(approval);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

const COLUMNS: &str = "id, run_id, prompt, command, risk_level, required_scopes, \
                       plugin_metadata, requested_by, requested_at, status, approved_by, \
                       approved_at, rejected_by, rejected_at, rejection_reason, \
                       confirmation, approval_note";

fn parse_time(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_time(
    idx: usize,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.map(|s| parse_time(idx, &s)).transpose()
}

fn bad_column(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, detail.into())
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> Result<Approval, rusqlite::Error> {
    let risk: String = row.get(4)?;
    let scopes: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let requested_at: String = row.get(8)?;
    let status: String = row.get(9)?;

    Ok(Approval {
        id: row.get(0)?,
        run_id: row.get(1)?,
        prompt: row.get(2)?,
        command: row.get(3)?,
        risk_level: RiskLevel::parse(&risk)
            .ok_or_else(|| bad_column(4, format!("unknown risk level {risk:?}")))?,
        required_scopes: serde_json::from_str(&scopes)
            .map_err(|e| bad_column(5, e.to_string()))?,
        plugin_metadata: serde_json::from_str(&metadata)
            .map_err(|e| bad_column(6, e.to_string()))?,
        requested_by: row.get(7)?,
        requested_at: parse_time(8, &requested_at)?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| bad_column(9, format!("unknown status {status:?}")))?,
        approved_by: row.get(10)?,
        approved_at: parse_opt_time(11, row.get(11)?)?,
        rejected_by: row.get(12)?,
        rejected_at: parse_opt_time(13, row.get(13)?)?,
        rejection_reason: row.get(14)?,
        confirmation: row.get(15)?,
        approval_note: row.get(16)?,
    })
}

fn migrate(conn: &Connection) -> Result<(), ApprovalError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;
    let current: Option<i64> = conn
        .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
        .optional()?;

    match current {
        None => {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE approvals (
                     id               INTEGER PRIMARY KEY AUTOINCREMENT,
                     run_id           TEXT    NOT NULL,
                     prompt           TEXT    NOT NULL,
                     command          TEXT    NOT NULL,
                     risk_level       TEXT    NOT NULL,
                     required_scopes  TEXT    NOT NULL,
                     plugin_metadata  TEXT    NOT NULL,
                     requested_by     TEXT    NOT NULL,
                     requested_at     TEXT    NOT NULL,
                     status           TEXT    NOT NULL,
                     approved_by      TEXT,
                     approved_at      TEXT,
                     rejected_by      TEXT,
                     rejected_at      TEXT,
                     rejection_reason TEXT,
                     confirmation     TEXT    NOT NULL,
                     approval_note    TEXT
                 );
                 CREATE INDEX idx_approvals_status ON approvals(status);
                 CREATE INDEX idx_approvals_run_id ON approvals(run_id);
                 INSERT INTO schema_version (version) VALUES (1);
                 COMMIT;",
            )?;
            tracing::info!(version = SCHEMA_VERSION, "approval schema created");
            Ok(())
        }
        Some(v) if v <= SCHEMA_VERSION => Ok(()),
        Some(v) => Err(ApprovalError::SchemaTooNew { found: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> ApprovalStore {
        ApprovalStore::open_in_memory().unwrap()
    }

    fn request() -> Approval {
        Approval {
            id: 0,
            run_id: "job-1".into(),
            prompt: "clean up old releases".into(),
            command: "rm -rf ./releases/v1".into(),
            risk_level: RiskLevel::High,
            required_scopes: ["fs:write".to_string()].into_iter().collect(),
            plugin_metadata: Default::default(),
            requested_by: "ctl-1".into(),
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

    #[test]
    fn create_assigns_id_and_confirmation() {
        let store = store();
        let id = store.create(&request()).unwrap();
        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Pending);
        assert_eq!(row.confirmation, format!("APPROVE {id}"));
        assert_eq!(row.risk_level, RiskLevel::High);
        assert!(row.required_scopes.contains("fs:write"));
    }

    #[test]
    fn approve_happy_path() {
        let store = store();
        let id = store.create(&request()).unwrap();
        let row = store
            .approve(id, "alice", &confirmation_phrase(id), Some("looks fine"))
            .unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.approved_by.as_deref(), Some("alice"));
        assert_eq!(row.approval_note.as_deref(), Some("looks fine"));
        assert!(row.approved_at.is_some());
    }

    #[test]
    fn wrong_confirmation_fails_without_mutating() {
        let store = store();
        let id = store.create(&request()).unwrap();
        let err = store.approve(id, "alice", "APPROVE yes", None).unwrap_err();
        assert!(matches!(err, ApprovalError::BadConfirmation { .. }));
        let row = store.get(id).unwrap().unwrap();
        assert_eq!(row.status, ApprovalStatus::Pending);
    }

    #[test]
    fn confirmation_must_match_exact_id() {
        let store = store();
        let id = store.create(&request()).unwrap();
        let wrong = format!("APPROVE {}", id + 1);
        let err = store.approve(id, "alice", &wrong, None).unwrap_err();
        assert!(matches!(err, ApprovalError::BadConfirmation { .. }));
    }

    #[test]
    fn second_approve_is_not_pending() {
        let store = store();
        let id = store.create(&request()).unwrap();
        store
            .approve(id, "alice", &confirmation_phrase(id), None)
            .unwrap();
        let err = store
            .approve(id, "bob", &confirmation_phrase(id), None)
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending { .. }));
    }

    #[test]
    fn reject_requires_reason() {
        let store = store();
        let id = store.create(&request()).unwrap();
        assert!(matches!(
            store.reject(id, "bob", "").unwrap_err(),
            ApprovalError::BadReason
        ));
        assert!(matches!(
            store.reject(id, "bob", "   ").unwrap_err(),
            ApprovalError::BadReason
        ));
    }

    #[test]
    fn reject_happy_path() {
        let store = store();
        let id = store.create(&request()).unwrap();
        let row = store.reject(id, "bob", "too risky today").unwrap();
        assert_eq!(row.status, ApprovalStatus::Rejected);
        assert_eq!(row.rejected_by.as_deref(), Some("bob"));
        assert_eq!(row.rejection_reason.as_deref(), Some("too risky today"));
    }

    #[test]
    fn approve_after_reject_is_not_pending() {
        let store = store();
        let id = store.create(&request()).unwrap();
        store.reject(id, "bob", "no").unwrap();
        let err = store
            .approve(id, "alice", &confirmation_phrase(id), None)
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending { .. }));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = store();
        let err = store
            .approve(42, "alice", &confirmation_phrase(42), None)
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound { id: 42 }));
    }

    #[test]
    fn list_pending_excludes_decided_rows() {
        let store = store();
        let a = store.create(&request()).unwrap();
        let b = store.create(&request()).unwrap();
        let c = store.create(&request()).unwrap();
        store.approve(a, "alice", &confirmation_phrase(a), None).unwrap();
        store.reject(b, "bob", "no").unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, c);
    }

    #[test]
    fn concurrent_approve_and_reject_decide_exactly_once() {
        let store = Arc::new(store());
        let id = store.create(&request()).unwrap();

        let approve_store = Arc::clone(&store);
        let approver = std::thread::spawn(move || {
            approve_store.approve(id, "alice", &confirmation_phrase(id), None)
        });
        let reject_store = Arc::clone(&store);
        let rejecter = std::thread::spawn(move || reject_store.reject(id, "bob", "no"));

        let approve_result = approver.join().unwrap();
        let reject_result = rejecter.join().unwrap();

        assert_ne!(
            approve_result.is_ok(),
            reject_result.is_ok(),
            "exactly one transition must win"
        );
        let row = store.get(id).unwrap().unwrap();
        assert_ne!(row.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn wait_decision_returns_once_decided() {
        let store = Arc::new(store());
        let id = store.create(&request()).unwrap();

        let decider = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            decider
                .approve(id, "alice", &confirmation_phrase(id), None)
                .unwrap();
        });

        let decided = store
            .wait_decision(id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        handle.await.unwrap();
    }
}
