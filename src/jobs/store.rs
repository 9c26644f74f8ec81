//! Durable job state machine backed by SQLite.
//!
//! Transitions happen in single transactions; claiming uses an immediate
//! transaction so exactly one worker slot wins a SCHEDULED job.  Every
//! status change is recorded in the `job_transitions` audit table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{ClassifiedError, ErrorClass};

use super::retry::RetryPolicy;
use super::types::{Checkpoint, Job, JobStatus, NewJob};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid job transition for {job_id}: {from} -> {to}")]
    Conflict {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for JobStoreError {
    fn from(err: rusqlite::Error) -> Self {
        JobStoreError::Store(err.to_string())
    }
}

// ─── Transition audit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Allowed job status moves.  `Completed` and `DeadLetter` are sinks.
fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Scheduled, Running)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Scheduled) // stale-heartbeat reclaim
            | (Failed, Scheduled)
            | (Failed, DeadLetter)
    )
}

// ─── Schema ──────────────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL,
    session_id TEXT,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 300,
    payload TEXT NOT NULL,
    result TEXT,
    error TEXT,
    checkpoint TEXT,
    heartbeat_at TEXT,
    approval_expires_at TEXT,
    scheduled_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs (status, scheduled_at, priority);

CREATE TABLE IF NOT EXISTS job_transitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status TEXT NOT NULL,
    reason TEXT NOT NULL,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_transitions_job
    ON job_transitions (job_id, id);
"#;

// ─── JobStore ────────────────────────────────────────────────────────────────

/// SQLite-backed job store; the single state authority for jobs.
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
    retry: RetryPolicy,
}

impl JobStore {
    pub fn open(path: &std::path::Path) -> Result<Self, JobStoreError> {
        Self::from_connection(Connection::open(path).map_err(JobStoreError::from)?)
    }

    pub fn open_in_memory() -> Result<Self, JobStoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(JobStoreError::from)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, JobStoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Insert a new PENDING job.
    pub fn enqueue(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            agent_id: new.agent_id,
            session_id: new.session_id,
            status: JobStatus::Pending,
            priority: new.priority,
            attempt: 0,
            max_attempts: new.max_attempts.max(1),
            timeout_seconds: new.timeout_seconds,
            payload: new.payload.encode(),
            result: None,
            error: None,
            checkpoint: None,
            heartbeat_at: None,
            approval_expires_at: None,
            scheduled_at: now,
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (id, agent_id, session_id, status, priority, attempt, max_attempts,
                               timeout_seconds, payload, scheduled_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.agent_id,
                job.session_id,
                job.status.as_str(),
                job.priority,
                job.attempt,
                job.max_attempts,
                job.timeout_seconds,
                job.payload.to_string(),
                job.scheduled_at.to_rfc3339(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(job)
    }

    /// Move a PENDING job to SCHEDULED so the worker can claim it.
    pub fn schedule(&self, job_id: &str, reason: &str) -> Result<Job, JobStoreError> {
        self.simple_transition(job_id, JobStatus::Scheduled, reason, |_| Ok(()))
    }

    /// Convenience: insert and immediately schedule.
    pub fn enqueue_scheduled(&self, new: NewJob) -> Result<Job, JobStoreError> {
        let job = self.enqueue(new)?;
        self.schedule(&job.id, "enqueued")
    }

    // ── Claiming / running ──────────────────────────────────────────────────

    /// Claim the next due SCHEDULED job (priority order, then age),
    /// atomically setting it RUNNING with a fresh heartbeat and an
    /// incremented attempt counter.
    pub fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE status = 'SCHEDULED' AND scheduled_at <= ?1
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1",
                params![now.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET status = 'RUNNING', attempt = attempt + 1,
                             heartbeat_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![job_id, now.to_rfc3339()],
        )?;
        insert_transition(
            &tx,
            &job_id,
            JobStatus::Scheduled,
            JobStatus::Running,
            "claimed",
            now,
        )?;
        tx.commit()?;

        let job = self.get_locked(&conn, &job_id)?;
        Ok(Some(job))
    }

    /// Refresh the heartbeat of a RUNNING job.
    pub fn heartbeat(&self, job_id: &str) -> Result<(), JobStoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE jobs SET heartbeat_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'RUNNING'",
            params![job_id, now],
        )?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Persist the job's checkpoint (called after the buffer CHECKPOINT
    /// event is durable).
    pub fn save_checkpoint(
        &self,
        job_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), JobStoreError> {
        let body = serde_json::to_string(checkpoint)
            .map_err(|e| JobStoreError::Store(e.to_string()))?;
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE jobs SET checkpoint = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, body, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Record the deadline a job's pending approval expires at.
    pub fn set_approval_deadline(
        &self,
        job_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), JobStoreError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE jobs SET approval_expires_at = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                job_id,
                expires_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(JobStoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    // ── Completion / failure ────────────────────────────────────────────────

    /// RUNNING → COMPLETED with a result payload.
    pub fn complete(
        &self,
        job_id: &str,
        result: serde_json::Value,
    ) -> Result<Job, JobStoreError> {
        self.simple_transition(job_id, JobStatus::Completed, "handler returned", move |tx| {
            tx.execute(
                "UPDATE jobs SET result = ?2 WHERE id = ?1",
                params![job_id, result.to_string()],
            )?;
            Ok(())
        })
    }

    /// Record an attempt failure and decide its fate: retry with backoff,
    /// or dead-letter.
    ///
    /// Permanent errors skip retries even when attempts remain; Unknown
    /// errors are granted exactly one retry.
    pub fn fail(&self, job_id: &str, error: &ClassifiedError) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (status_raw, attempt, max_attempts): (String, u32, u32) = tx
            .query_row(
                "SELECT status, attempt, max_attempts FROM jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;

        let from = JobStatus::parse(&status_raw)
            .ok_or_else(|| JobStoreError::Store(format!("bad status {status_raw}")))?;
        if !transition_allowed(from, JobStatus::Failed) {
            return Err(JobStoreError::Conflict {
                job_id: job_id.to_string(),
                from,
                to: JobStatus::Failed,
            });
        }

        insert_transition(&tx, job_id, from, JobStatus::Failed, &error.message, now)?;

        let exhausted = attempt >= max_attempts;
        let unknown_spent = error.class == ErrorClass::Unknown && attempt >= 2;
        let dead = error.class == ErrorClass::Permanent || exhausted || unknown_spent;

        let error_json = serde_json::to_string(error)
            .map_err(|e| JobStoreError::Store(e.to_string()))?;

        if dead {
            tx.execute(
                "UPDATE jobs SET status = 'DEAD_LETTER', error = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![job_id, error_json, now.to_rfc3339()],
            )?;
            insert_transition(
                &tx,
                job_id,
                JobStatus::Failed,
                JobStatus::DeadLetter,
                "retries exhausted or non-retriable",
                now,
            )?;
        } else {
            let delay = self.retry.delay(attempt);
            let next = now + chrono::Duration::from_std(delay).unwrap_or_default();
            tx.execute(
                "UPDATE jobs SET status = 'SCHEDULED', error = ?2, scheduled_at = ?3,
                                 updated_at = ?4
                 WHERE id = ?1",
                params![job_id, error_json, next.to_rfc3339(), now.to_rfc3339()],
            )?;
            insert_transition(
                &tx,
                job_id,
                JobStatus::Failed,
                JobStatus::Scheduled,
                &format!("retry in {delay:?}"),
                now,
            )?;
        }
        tx.commit()?;

        self.get_locked(&conn, job_id)
    }

    /// Re-schedule RUNNING jobs whose heartbeat is older than twice the
    /// lease (process-crash recovery).  The attempt counter is unchanged:
    /// the re-run resumes the same attempt from its checkpoint.
    pub fn reclaim_stale(&self, lease: Duration) -> Result<Vec<String>, JobStoreError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(lease * 2).unwrap_or_default();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE status = 'RUNNING' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for job_id in &stale {
            tx.execute(
                "UPDATE jobs SET status = 'SCHEDULED', heartbeat_at = NULL,
                                 scheduled_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![job_id, now.to_rfc3339()],
            )?;
            insert_transition(
                &tx,
                job_id,
                JobStatus::Running,
                JobStatus::Scheduled,
                "stale heartbeat reclaimed",
                now,
            )?;
        }
        tx.commit()?;

        if !stale.is_empty() {
            log::warn!("job store: reclaimed {} stale running job(s)", stale.len());
        }
        Ok(stale)
    }

    /// Operator retry: put a FAILED or DEAD_LETTER job back on the queue
    /// with a fresh attempt budget.
    pub fn retry_job(&self, job_id: &str) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status_raw: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let from = JobStatus::parse(&status_raw)
            .ok_or_else(|| JobStoreError::Store(format!("bad status {status_raw}")))?;

        if !matches!(from, JobStatus::Failed | JobStatus::DeadLetter) {
            return Err(JobStoreError::Conflict {
                job_id: job_id.to_string(),
                from,
                to: JobStatus::Scheduled,
            });
        }

        tx.execute(
            "UPDATE jobs SET status = 'SCHEDULED', attempt = 0, error = NULL,
                             scheduled_at = ?2, updated_at = ?2
             WHERE id = ?1",
            params![job_id, now.to_rfc3339()],
        )?;
        insert_transition(&tx, job_id, from, JobStatus::Scheduled, "operator retry", now)?;
        tx.commit()?;

        self.get_locked(&conn, job_id)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn get(&self, job_id: &str) -> Result<Job, JobStoreError> {
        let conn = self.lock();
        self.get_locked(&conn, job_id)
    }

    /// Most recently created jobs first.
    pub fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Transition audit for one job, oldest first.
    pub fn transitions(&self, job_id: &str) -> Result<Vec<TransitionRecord>, JobStoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT job_id, from_status, to_status, reason, at
             FROM job_transitions WHERE job_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (job_id, from, to, reason, at) = row?;
            let (Some(from), Some(to)) = (JobStatus::parse(&from), JobStatus::parse(&to)) else {
                continue;
            };
            records.push(TransitionRecord {
                job_id,
                from,
                to,
                reason,
                at: parse_ts(&at),
            });
        }
        Ok(records)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Run a guarded single-step transition inside one transaction.
    fn simple_transition(
        &self,
        job_id: &str,
        to: JobStatus,
        reason: &str,
        extra: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<(), JobStoreError>,
    ) -> Result<Job, JobStoreError> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let status_raw: String = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))?;
        let from = JobStatus::parse(&status_raw)
            .ok_or_else(|| JobStoreError::Store(format!("bad status {status_raw}")))?;

        if !transition_allowed(from, to) {
            return Err(JobStoreError::Conflict {
                job_id: job_id.to_string(),
                from,
                to,
            });
        }

        extra(&tx)?;
        tx.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, to.as_str(), now.to_rfc3339()],
        )?;
        insert_transition(&tx, job_id, from, to, reason, now)?;
        tx.commit()?;

        self.get_locked(&conn, job_id)
    }

    fn get_locked(&self, conn: &Connection, job_id: &str) -> Result<Job, JobStoreError> {
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            row_to_job,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => JobStoreError::NotFound(job_id.to_string()),
            other => other.into(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

const JOB_COLUMNS: &str = "id, agent_id, session_id, status, priority, attempt, max_attempts, \
                           timeout_seconds, payload, result, error, checkpoint, heartbeat_at, \
                           approval_expires_at, scheduled_at, created_at, updated_at";

fn row_to_job(row: &rusqlite::Row<'_>) -> Result<Job, rusqlite::Error> {
    let status_raw: String = row.get(3)?;
    let payload_raw: String = row.get(8)?;
    let result_raw: Option<String> = row.get(9)?;
    let error_raw: Option<String> = row.get(10)?;
    let checkpoint_raw: Option<String> = row.get(11)?;
    Ok(Job {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        session_id: row.get(2)?,
        status: JobStatus::parse(&status_raw).unwrap_or(JobStatus::Pending),
        priority: row.get(4)?,
        attempt: row.get(5)?,
        max_attempts: row.get(6)?,
        timeout_seconds: row.get(7)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        result: result_raw.and_then(|r| serde_json::from_str(&r).ok()),
        error: error_raw.and_then(|r| serde_json::from_str(&r).ok()),
        checkpoint: checkpoint_raw.and_then(|r| serde_json::from_str(&r).ok()),
        heartbeat_at: row.get::<_, Option<String>>(12)?.map(|t| parse_ts(&t)),
        approval_expires_at: row.get::<_, Option<String>>(13)?.map(|t| parse_ts(&t)),
        scheduled_at: parse_ts(&row.get::<_, String>(14)?),
        created_at: parse_ts(&row.get::<_, String>(15)?),
        updated_at: parse_ts(&row.get::<_, String>(16)?),
    })
}

fn insert_transition(
    tx: &rusqlite::Transaction<'_>,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<(), JobStoreError> {
    tx.execute(
        "INSERT INTO job_transitions (job_id, from_status, to_status, reason, at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![job_id, from.as_str(), to.as_str(), reason, at.to_rfc3339()],
    )?;
    log::info!("job {job_id}: {from} -> {to} ({reason})");
    Ok(())
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
