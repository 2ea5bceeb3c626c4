// SPDX-License-Identifier: MIT OR Apache-2.0
//! cordon-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Durable, append-only record of every execution attempt.
//!
//! Rows are immutable once written: the API has no update or delete. Every
//! write passes `selected_command`, `stdout`, and `stderr` through the
//! injected [`SecretRedactor`]; callers must not pre-redact. Storage is
//! SQLite in WAL mode so readers do not block the single writer.

use chrono::{DateTime, Utc};
use cordon_core::{RiskLevel, RunRecord};
use cordon_redact::SecretRedactor;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

/// Schema version written by the current code.
const SCHEMA_VERSION: i64 = 1;

/// Errors from audit-store operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The underlying SQLite call failed.
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    /// A stored row could not be decoded.
    #[error("corrupt audit row: {0}")]
    Corrupt(String),
    /// The database schema is newer than this build understands.
    #[error("unsupported schema version {found} (supported <= {SCHEMA_VERSION})")]
    SchemaTooNew {
        /// Version found in the database.
        found: i64,
    },
}

/// Aggregate statistics over the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditStats {
    /// Rows with `executed = true`.
    pub total_executions: u64,
    /// Row counts per risk level (all rows).
    pub by_risk_level: BTreeMap<String, u64>,
    /// `exit_code == 0` executions divided by total executions; 0.0 when
    /// nothing has executed.
    pub success_rate: f64,
}

/// The append-only audit store.
///
/// A single connection behind a mutex: SQLite is the single writer, WAL
/// keeps concurrent readers from blocking it. Share via `Arc`.
pub struct AuditStore {
    conn: Mutex<Connection>,
    redactor: SecretRedactor,
}

impl AuditStore {
    /// Open (and migrate) the audit database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when the database cannot be opened or the
    /// schema cannot be migrated.
    pub fn open(path: &Path, redactor: SecretRedactor) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        Self::init(conn, redactor)
    }

    /// Open an in-memory store (tests and ephemeral agents).
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] when initialization fails.
    pub fn open_in_memory(redactor: SecretRedactor) -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, redactor)
    }

    fn init(conn: Connection, redactor: SecretRedactor) -> Result<Self, AuditError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            redactor,
        })
    }

    /// Append one run record, redacting command and output first.
    ///
    /// The record's `id` and `created_at` are assigned by the store; the
    /// incoming values are ignored. Returns the new row id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sql`] when the insert fails.
    pub fn log(&self, record: &RunRecord) -> Result<i64, AuditError> {
        let command = self.redactor.redact_env(&record.selected_command);
        let stdout = self.redactor.redact(&record.stdout);
        let stderr = self.redactor.redact(&record.stderr);

        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.execute(
            "INSERT INTO runs (
                timestamp, user, prompt, selected_command, sandbox_id,
                exit_code, stdout, stderr, risk_level, snapshot,
                executed, duration_ms, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.timestamp.to_rfc3339(),
                record.user,
                record.prompt,
                command,
                record.sandbox_id,
                record.exit_code,
                stdout,
                stderr,
                record.risk_level.as_str(),
                record.snapshot,
                record.executed,
                record.duration_ms as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch one row by id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on query failure or a corrupt row.
    pub fn get_by_id(&self, id: i64) -> Result<Option<RunRecord>, AuditError> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()
        .map_err(AuditError::from)
    }

    /// The most recent rows, newest first.
    ///
    /// When `filter` is non-empty it matches as a substring against both
    /// the prompt and the selected command.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on query failure or a corrupt row.
    pub fn history(
        &self,
        limit: usize,
        filter: Option<&str>,
    ) -> Result<Vec<RunRecord>, AuditError> {
        let conn = self.conn.lock().expect("audit lock poisoned");
        let mut rows = Vec::new();
        match filter.filter(|f| !f.is_empty()) {
            Some(needle) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM runs
                     WHERE instr(prompt, ?1) > 0 OR instr(selected_command, ?1) > 0
                     ORDER BY id DESC LIMIT ?2"
                ))?;
                let mapped = stmt.query_map(params![needle, limit as i64], row_to_record)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
                ))?;
                let mapped = stmt.query_map(params![limit as i64], row_to_record)?;
                for row in mapped {
                    rows.push(row?);
                }
            }
        }
        Ok(rows)
    }

    /// Aggregate statistics over the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Sql`] on query failure.
    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let conn = self.conn.lock().expect("audit lock poisoned");

        let total_executions: u64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE executed = 1",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;

        let successes: u64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE executed = 1 AND exit_code = 0",
            [],
            |row| row.get::<_, i64>(0),
        )? as u64;

        let mut by_risk_level = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT risk_level, COUNT(*) FROM runs GROUP BY risk_level")?;
        let mapped = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for entry in mapped {
            let (level, count) = entry?;
            by_risk_level.insert(level, count);
        }

        let success_rate = if total_executions == 0 {
            0.0
        } else {
            successes as f64 / total_executions as f64
        };

        Ok(AuditStats {
            total_executions,
            by_risk_level,
            success_rate,
        })
    }
}

const COLUMNS: &str = "id, timestamp, user, prompt, selected_command, sandbox_id, \
                       exit_code, stdout, stderr, risk_level, snapshot, executed, \
                       duration_ms, created_at";

fn parse_time(idx: usize, raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<RunRecord, rusqlite::Error> {
    let timestamp: String = row.get(1)?;
    let risk: String = row.get(9)?;
    let created_at: String = row.get(13)?;
    Ok(RunRecord {
        id: row.get(0)?,
        timestamp: parse_time(1, &timestamp)?,
        user: row.get(2)?,
        prompt: row.get(3)?,
        selected_command: row.get(4)?,
        sandbox_id: row.get(5)?,
        exit_code: row.get(6)?,
        stdout: row.get(7)?,
        stderr: row.get(8)?,
        risk_level: RiskLevel::parse(&risk).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                9,
                rusqlite::types::Type::Text,
                format!("unknown risk level {risk:?}").into(),
            )
        })?,
        snapshot: row.get(10)?,
        executed: row.get(11)?,
        duration_ms: row.get::<_, i64>(12)? as u64,
        created_at: parse_time(13, &created_at)?,
    })
}

/// Apply schema migrations under the open connection's lock.
fn migrate(conn: &Connection) -> Result<(), AuditError> {
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
                 CREATE TABLE runs (
                     id               INTEGER PRIMARY KEY AUTOINCREMENT,
                     timestamp        TEXT    NOT NULL,
                     user             TEXT    NOT NULL,
                     prompt           TEXT    NOT NULL,
                     selected_command TEXT    NOT NULL,
                     sandbox_id       TEXT    NOT NULL,
                     exit_code        INTEGER NOT NULL,
                     stdout           TEXT    NOT NULL,
                     stderr           TEXT    NOT NULL,
                     risk_level       TEXT    NOT NULL,
                     snapshot         TEXT,
                     executed         INTEGER NOT NULL,
                     duration_ms      INTEGER NOT NULL,
                     created_at       TEXT    NOT NULL
                 );
                 CREATE INDEX idx_runs_timestamp  ON runs(timestamp);
                 CREATE INDEX idx_runs_user       ON runs(user);
                 CREATE INDEX idx_runs_executed   ON runs(executed);
                 CREATE INDEX idx_runs_risk_level ON runs(risk_level);
                 INSERT INTO schema_version (version) VALUES (1);
                 COMMIT;",
            )?;
            tracing::info!(version = SCHEMA_VERSION, "audit schema created");
            Ok(())
        }
        // Future migrations slot in here, one version step at a time.
        Some(v) if v <= SCHEMA_VERSION => Ok(()),
        Some(v) => Err(AuditError::SchemaTooNew { found: v }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_core::RiskLevel;

    fn store() -> AuditStore {
        AuditStore::open_in_memory(SecretRedactor::new()).unwrap()
    }

    fn record(command: &str) -> RunRecord {
        RunRecord {
            id: 0,
            timestamp: Utc::now(),
            user: "ctl-1".into(),
            prompt: "do the thing".into(),
            selected_command: command.into(),
            sandbox_id: "abc123def456".into(),
            exit_code: 0,
            stdout: "ok".into(),
            stderr: String::new(),
            risk_level: RiskLevel::Safe,
            snapshot: None,
            executed: true,
            duration_ms: 42,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn log_and_fetch_roundtrip() {
        let store = store();
        let id = store.log(&record("echo hello")).unwrap();
        let row = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(row.id, id);
        assert_eq!(row.selected_command, "echo hello");
        assert_eq!(row.user, "ctl-1");
        assert!(row.executed);
    }

    #[test]
    fn missing_row_is_none() {
        assert!(store().get_by_id(999).unwrap().is_none());
    }

    #[test]
    fn command_is_redacted_on_write() {
        let store = store();
        let id = store.log(&record("PASSWORD=hunter2 ./deploy.sh")).unwrap();
        let row = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(row.selected_command, "PASSWORD=***REDACTED*** ./deploy.sh");
    }

    #[test]
    fn output_is_redacted_on_write() {
        let store = store();
        let mut rec = record("./leak.sh");
        rec.stdout = "found api_key=abc123xyz in env".into();
        rec.stderr = "warn: token=deadbeef".into();
        let id = store.log(&rec).unwrap();
        let row = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(row.stdout, "found api_key=***REDACTED*** in env");
        assert_eq!(row.stderr, "warn: token=***REDACTED***");
    }

    #[test]
    fn history_is_newest_first() {
        let store = store();
        store.log(&record("first")).unwrap();
        store.log(&record("second")).unwrap();
        store.log(&record("third")).unwrap();
        let rows = store.history(10, None).unwrap();
        let commands: Vec<&str> = rows.iter().map(|r| r.selected_command.as_str()).collect();
        assert_eq!(commands, vec!["third", "second", "first"]);
    }

    #[test]
    fn history_respects_limit() {
        let store = store();
        for i in 0..5 {
            store.log(&record(&format!("cmd-{i}"))).unwrap();
        }
        assert_eq!(store.history(2, None).unwrap().len(), 2);
    }

    #[test]
    fn history_filters_on_prompt_and_command() {
        let store = store();
        let mut by_prompt = record("ls -la");
        by_prompt.prompt = "list the deploy directory".into();
        store.log(&by_prompt).unwrap();
        store.log(&record("./deploy.sh --dry-run")).unwrap();
        store.log(&record("uptime")).unwrap();

        let rows = store.history(10, Some("deploy")).unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store.history(10, Some("uptime")).unwrap();
        assert_eq!(rows.len(), 1);

        // Empty filter behaves like no filter.
        assert_eq!(store.history(10, Some("")).unwrap().len(), 3);
    }

    #[test]
    fn filter_returns_redacted_rows() {
        let store = store();
        store.log(&record("PASSWORD=hunter2 ./deploy.sh")).unwrap();
        let rows = store.history(10, Some("deploy")).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].selected_command.contains("hunter2"));
    }

    #[test]
    fn stats_counts_and_rate() {
        let store = store();
        store.log(&record("ok-1")).unwrap();
        let mut failed = record("bad");
        failed.exit_code = 2;
        store.log(&failed).unwrap();
        let mut denied = record("rm -rf /tmp/x");
        denied.executed = false;
        denied.risk_level = RiskLevel::High;
        store.log(&denied).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.by_risk_level["safe"], 2);
        assert_eq!(stats.by_risk_level["high"], 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn stats_on_empty_store() {
        let stats = store().stats().unwrap();
        assert_eq!(stats.total_executions, 0);
        assert!(stats.by_risk_level.is_empty());
        assert_eq!(stats.success_rate, 0.0);
    }

    #[test]
    fn reopen_preserves_rows_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&path, SecretRedactor::new()).unwrap();
            store.log(&record("persisted")).unwrap();
        }
        let store = AuditStore::open(&path, SecretRedactor::new()).unwrap();
        let rows = store.history(10, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].selected_command, "persisted");
    }

    #[test]
    fn store_assigns_id_and_created_at() {
        let store = store();
        let mut rec = record("x");
        rec.id = 12345;
        let id = store.log(&rec).unwrap();
        assert_ne!(id, 12345);
        let row = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(row.id, id);
    }
}
