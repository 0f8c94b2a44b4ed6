use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::resilience::FailureRecord;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RemediationAction {
    /// Job rescheduled after a backoff delay.
    RetryScheduled { delay_seconds: u64 },
    /// Failure contained to one conversation; retried next cycle.
    Contained,
    /// Fallback text substituted for generated content.
    Fallback,
    /// Surface torn down and the agent restarted.
    Restart { cooldown_seconds: u64 },
}

#[derive(Debug, Clone, Serialize)]
struct FailureLine<'a> {
    #[serde(flatten)]
    failure: &'a FailureRecord,
    #[serde(flatten)]
    action: &'a RemediationAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunEntry {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub job: String,
    pub outcome: String,
    pub duration_ms: i64,
    pub detail: String,
}

impl JobRunEntry {
    pub fn new(
        job: impl Into<String>,
        outcome: impl Into<String>,
        duration_ms: i64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            job: job.into(),
            outcome: outcome.into(),
            duration_ms,
            detail: detail.into(),
        }
    }
}

/// Append-only record of job runs, failures and session transitions.
///
/// Written for operators; the agent never reads it back.
#[derive(Debug)]
pub struct AgentJournal {
    log: Option<Mutex<File>>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AgentJournal {
    pub fn new(
        db_path: impl AsRef<Path>,
        failure_log: Option<&Path>,
    ) -> Result<Self, JournalError> {
        let log = match failure_log {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let journal = Self {
            log,
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        journal.initialize_db()?;
        Ok(journal)
    }

    fn initialize_db(&self) -> Result<(), JournalError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS job_runs (
                run_id TEXT PRIMARY KEY,
                ts DATETIME NOT NULL,
                job TEXT NOT NULL,
                outcome TEXT NOT NULL,
                duration_ms INTEGER,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_ts ON job_runs(ts DESC);
            CREATE TABLE IF NOT EXISTS failures (
                ts DATETIME NOT NULL,
                context TEXT,
                kind TEXT,
                conversation_id TEXT,
                message TEXT,
                remediation TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_failures_ts ON failures(ts DESC);
            CREATE TABLE IF NOT EXISTS session_transitions (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                from_state TEXT,
                to_state TEXT
            );",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, JournalError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record_failure(
        &self,
        failure: &FailureRecord,
        action: &RemediationAction,
    ) -> Result<(), JournalError> {
        if let Some(log) = &self.log {
            let json = serde_json::to_string(&FailureLine { failure, action })?;
            let mut guard = log.lock().unwrap_or_else(|poisoned| {
                warn!(target: "journal", "failure log lock poisoned, writing anyway");
                poisoned.into_inner()
            });
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO failures (ts, context, kind, conversation_id, message, remediation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                failure.occurred_at,
                failure.context,
                failure.kind.as_str(),
                failure.conversation_id,
                failure.message,
                serde_json::to_string(action)?,
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &JobRunEntry) -> Result<(), JournalError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO job_runs (run_id, ts, job, outcome, duration_ms, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id,
                run.timestamp,
                run.job,
                run.outcome,
                run.duration_ms,
                run.detail,
            ],
        )?;
        Ok(())
    }

    pub fn record_transition(&self, from: &str, to: &str) -> Result<(), JournalError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO session_transitions (from_state, to_state) VALUES (?1, ?2)",
            params![from, to],
        )?;
        Ok(())
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<JobRunEntry>, JournalError> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, ts, job, outcome, duration_ms, detail
             FROM job_runs ORDER BY ts DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(JobRunEntry {
                run_id: row.get(0)?,
                timestamp: row.get(1)?,
                job: row.get(2)?,
                outcome: row.get(3)?,
                duration_ms: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
                detail: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
