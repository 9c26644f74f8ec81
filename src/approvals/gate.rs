//! Human-in-the-loop approval gate.
//!
//! A running job creates an approval before performing a sensitive action
//! and blocks until a decision arrives or the request expires.  Channel
//! notifications carry callback tokens (`apr:{a|r}:<32-hex>`) whose opaque
//! portion must match the stored value before any state change.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    Critical,
}

impl RiskLevel {
    fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "CRITICAL" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }

    fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Expired => "EXPIRED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            "EXPIRED" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
}

/// One channel the approval was announced on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub channel_type: String,
    pub chat_id: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub job_id: String,
    pub agent_id: String,
    pub summary: String,
    pub details: serde_json::Value,
    pub risk: RiskLevel,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decision_reason: Option<String>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    /// Full approve callback token (`apr:a:<32-hex>`).
    pub approve_token: String,
    /// Full reject callback token (`apr:r:<32-hex>`).
    pub reject_token: String,
}

// ─── Tokens ──────────────────────────────────────────────────────────────────

/// Parse a callback token into its decision and opaque portion.
pub fn parse_callback_token(token: &str) -> Option<(Decision, &str)> {
    let rest = token.strip_prefix("apr:")?;
    let (kind, opaque) = rest.split_at_checked(2)?;
    let decision = match kind {
        "a:" => Decision::Approved,
        "r:" => Decision::Rejected,
        _ => return None,
    };
    if opaque.len() != 32 || !opaque.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((decision, opaque))
}

fn mint_token(decision: Decision) -> String {
    let kind = match decision {
        Decision::Approved => 'a',
        Decision::Rejected => 'r',
    };
    format!("apr:{kind}:{}", Uuid::new_v4().simple())
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval not found: {0}")]
    NotFound(String),

    #[error("approval_expired")]
    Expired,

    #[error("approval already decided: {0}")]
    AlreadyDecided(String),

    #[error("invalid callback token")]
    InvalidToken,

    #[error("approval ttl must be positive")]
    InvalidTtl,

    #[error("approval store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for ApprovalError {
    fn from(err: rusqlite::Error) -> Self {
        ApprovalError::Store(err.to_string())
    }
}

// ─── ApprovalGate ────────────────────────────────────────────────────────────

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY NOT NULL,
    job_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT NOT NULL,
    risk TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    decided_at TEXT,
    decision_reason TEXT,
    notifications TEXT NOT NULL DEFAULT '[]',
    approve_token TEXT NOT NULL,
    reject_token TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_approvals_pending
    ON approvals (status, expires_at);
"#;

/// SQLite-backed approval store and decision authority.
#[derive(Clone)]
pub struct ApprovalGate {
    conn: Arc<Mutex<Connection>>,
}

impl ApprovalGate {
    pub fn open(path: &std::path::Path) -> Result<Self, ApprovalError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, ApprovalError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, ApprovalError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a PENDING approval with fresh callback tokens.
    pub fn create(
        &self,
        job_id: &str,
        agent_id: &str,
        summary: &str,
        details: serde_json::Value,
        risk: RiskLevel,
        ttl: Duration,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if ttl.is_zero() {
            return Err(ApprovalError::InvalidTtl);
        }
        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            agent_id: agent_id.to_string(),
            summary: summary.to_string(),
            details,
            risk,
            status: ApprovalStatus::Pending,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            created_at: now,
            decided_at: None,
            decision_reason: None,
            notifications: Vec::new(),
            approve_token: mint_token(Decision::Approved),
            reject_token: mint_token(Decision::Rejected),
        };

        let conn = self.lock();
        conn.execute(
            "INSERT INTO approvals (id, job_id, agent_id, summary, details, risk, status,
                                    expires_at, created_at, notifications,
                                    approve_token, reject_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', ?7, ?8, '[]', ?9, ?10)",
            params![
                request.id,
                request.job_id,
                request.agent_id,
                request.summary,
                request.details.to_string(),
                request.risk.as_str(),
                request.expires_at.to_rfc3339(),
                request.created_at.to_rfc3339(),
                request.approve_token,
                request.reject_token,
            ],
        )?;
        Ok(request)
    }

    pub fn get(&self, approval_id: &str) -> Result<ApprovalRequest, ApprovalError> {
        let conn = self.lock();
        self.get_locked(&conn, approval_id)
    }

    /// Record a channel notification for an approval.
    pub fn record_notification(
        &self,
        approval_id: &str,
        channel_type: &str,
        chat_id: &str,
    ) -> Result<(), ApprovalError> {
        let conn = self.lock();
        let mut request = self.get_locked(&conn, approval_id)?;
        request.notifications.push(NotificationRecord {
            channel_type: channel_type.to_string(),
            chat_id: chat_id.to_string(),
            sent_at: Utc::now(),
        });
        let body = serde_json::to_string(&request.notifications)
            .map_err(|e| ApprovalError::Store(e.to_string()))?;
        conn.execute(
            "UPDATE approvals SET notifications = ?2 WHERE id = ?1",
            params![approval_id, body],
        )?;
        Ok(())
    }

    /// Apply a decision, verifying the callback token against the stored
    /// one for that decision.  Exactly one decision is ever recorded.
    pub fn decide(
        &self,
        approval_id: &str,
        decision: Decision,
        token: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let now = Utc::now();
        let conn = self.lock();
        let request = self.get_locked(&conn, approval_id)?;

        if request.status.is_terminal() {
            if request.status == ApprovalStatus::Expired {
                return Err(ApprovalError::Expired);
            }
            return Err(ApprovalError::AlreadyDecided(approval_id.to_string()));
        }

        let expected = match decision {
            Decision::Approved => &request.approve_token,
            Decision::Rejected => &request.reject_token,
        };
        if token != expected {
            return Err(ApprovalError::InvalidToken);
        }

        // A decision arriving after the deadline expires the request
        // instead of applying.
        if now > request.expires_at {
            conn.execute(
                "UPDATE approvals SET status = 'EXPIRED', decided_at = ?2 WHERE id = ?1",
                params![approval_id, now.to_rfc3339()],
            )?;
            return Err(ApprovalError::Expired);
        }

        let status = match decision {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
        };
        conn.execute(
            "UPDATE approvals SET status = ?2, decided_at = ?3, decision_reason = ?4
             WHERE id = ?1 AND status = 'PENDING'",
            params![
                approval_id,
                status.as_str(),
                now.to_rfc3339(),
                reason
            ],
        )?;
        self.get_locked(&conn, approval_id)
    }

    /// Resolve a decision from a bare callback token (chat button press).
    pub fn decide_by_token(&self, token: &str) -> Result<ApprovalRequest, ApprovalError> {
        let (decision, _) = parse_callback_token(token).ok_or(ApprovalError::InvalidToken)?;
        let column = match decision {
            Decision::Approved => "approve_token",
            Decision::Rejected => "reject_token",
        };
        let approval_id: Option<String> = {
            let conn = self.lock();
            conn.query_row(
                &format!("SELECT id FROM approvals WHERE {column} = ?1"),
                params![token],
                |row| row.get(0),
            )
            .optional()?
        };
        let approval_id = approval_id.ok_or(ApprovalError::InvalidToken)?;
        self.decide(&approval_id, decision, token, None)
    }

    /// Expire every PENDING approval past its deadline; returns the newly
    /// expired requests so callers can notify channels.
    pub fn expire_due(&self) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let now = Utc::now();
        let conn = self.lock();
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM approvals WHERE status = 'PENDING' AND expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now.to_rfc3339()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let mut expired = Vec::new();
        for id in ids {
            conn.execute(
                "UPDATE approvals SET status = 'EXPIRED', decided_at = ?2
                 WHERE id = ?1 AND status = 'PENDING'",
                params![id, now.to_rfc3339()],
            )?;
            expired.push(self.get_locked(&conn, &id)?);
        }
        if !expired.is_empty() {
            log::info!("approvals: expired {} pending request(s)", expired.len());
        }
        Ok(expired)
    }

    /// PENDING approvals for a given job.
    pub fn pending_for_job(&self, job_id: &str) -> Result<Vec<ApprovalRequest>, ApprovalError> {
        let conn = self.lock();
        let ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM approvals WHERE job_id = ?1 AND status = 'PENDING' ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![job_id], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_locked(&conn, id)).collect()
    }

    fn get_locked(
        &self,
        conn: &Connection,
        approval_id: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        conn.query_row(
            "SELECT id, job_id, agent_id, summary, details, risk, status, expires_at,
                    created_at, decided_at, decision_reason, notifications,
                    approve_token, reject_token
             FROM approvals WHERE id = ?1",
            params![approval_id],
            |row| {
                let details: String = row.get(4)?;
                let notifications: String = row.get(11)?;
                Ok(ApprovalRequest {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    summary: row.get(3)?,
                    details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                    risk: RiskLevel::parse(&row.get::<_, String>(5)?).unwrap_or(RiskLevel::Low),
                    status: ApprovalStatus::parse(&row.get::<_, String>(6)?)
                        .unwrap_or(ApprovalStatus::Pending),
                    expires_at: parse_ts(&row.get::<_, String>(7)?),
                    created_at: parse_ts(&row.get::<_, String>(8)?),
                    decided_at: row.get::<_, Option<String>>(9)?.map(|t| parse_ts(&t)),
                    decision_reason: row.get(10)?,
                    notifications: serde_json::from_str(&notifications).unwrap_or_default(),
                    approve_token: row.get(12)?,
                    reject_token: row.get(13)?,
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                ApprovalError::NotFound(approval_id.to_string())
            }
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

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
