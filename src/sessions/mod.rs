//! Conversational sessions between users and agents.
//!
//! A session binds (agent, user account, channel) to an ordered message
//! history.  At most one session per binding is `active`; the dispatcher
//! finds-or-creates it on every inbound message.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub user_account_id: String,
    pub channel_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        SessionError::Store(err.to_string())
    }
}

// ─── SessionStore ────────────────────────────────────────────────────────────

/// DDL executed when the store is opened.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL,
    user_account_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_binding
    ON sessions (agent_id, user_account_id, channel_id, status);

CREATE TABLE IF NOT EXISTS session_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_messages_session
    ON session_messages (session_id, id);
"#;

/// SQLite-backed session store.
///
/// A single [`rusqlite::Connection`] behind an `Arc<Mutex<…>>` keeps the
/// store `Send + Sync` while honouring SQLite's single-writer model.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self, SessionError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn open_in_memory() -> Result<Self, SessionError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SessionError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Return the active session for the binding, creating one if absent.
    pub fn find_or_create_active(
        &self,
        agent_id: &str,
        user_account_id: &str,
        channel_id: &str,
    ) -> Result<Session, SessionError> {
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT id, created_at FROM sessions
                 WHERE agent_id = ?1 AND user_account_id = ?2 AND channel_id = ?3
                   AND status = 'active'
                 ORDER BY created_at LIMIT 1",
                params![agent_id, user_account_id, channel_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some((id, created_at)) = existing {
            return Ok(Session {
                id,
                agent_id: agent_id.to_string(),
                user_account_id: user_account_id.to_string(),
                channel_id: channel_id.to_string(),
                status: SessionStatus::Active,
                created_at: parse_ts(&created_at),
            });
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            user_account_id: user_account_id.to_string(),
            channel_id: channel_id.to_string(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO sessions (id, agent_id, user_account_id, channel_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![
                session.id,
                session.agent_id,
                session.user_account_id,
                session.channel_id,
                session.created_at.to_rfc3339()
            ],
        )?;
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, agent_id, user_account_id, channel_id, status, created_at
             FROM sessions WHERE id = ?1",
            params![session_id],
            |row| {
                Ok(Session {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    user_account_id: row.get(2)?,
                    channel_id: row.get(3)?,
                    status: if row.get::<_, String>(4)? == "active" {
                        SessionStatus::Active
                    } else {
                        SessionStatus::Ended
                    },
                    created_at: parse_ts(&row.get::<_, String>(5)?),
                })
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => SessionError::NotFound(session_id.to_string()),
            other => other.into(),
        })
    }

    /// Append one message to a session's ordered history.
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<SessionMessage, SessionError> {
        let message = SessionMessage {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO session_messages (session_id, role, content, timestamp)
             SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1)",
            params![
                message.session_id,
                role.as_str(),
                message.content,
                message.timestamp.to_rfc3339()
            ],
        )?;
        if inserted == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(message)
    }

    /// Full message history in append order.
    pub fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, SessionError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, role, content, timestamp
             FROM session_messages WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (session_id, role, content, timestamp) = row?;
            let Some(role) = MessageRole::parse(&role) else {
                continue;
            };
            messages.push(SessionMessage {
                session_id,
                role,
                content,
                timestamp: parse_ts(&timestamp),
            });
        }
        Ok(messages)
    }

    /// The most recent `limit` messages, oldest first (conversation window
    /// handed to handlers).
    pub fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<SessionMessage>, SessionError> {
        let mut messages = self.messages(session_id)?;
        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    /// Mark a session ended.  Ending an already-ended session is a no-op.
    pub fn end(&self, session_id: &str) -> Result<(), SessionError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE sessions SET status = 'ended' WHERE id = ?1",
            params![session_id],
        )?;
        if updated == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::open_in_memory().unwrap()
    }

    #[test]
    fn find_or_create_reuses_active_session() {
        let store = store();
        let first = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        let second = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        assert_eq!(first.id, second.id, "one active session per binding");
    }

    #[test]
    fn different_bindings_get_different_sessions() {
        let store = store();
        let a = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        let b = store
            .find_or_create_active("a1", "user-2", "telegram:42")
            .unwrap();
        let c = store
            .find_or_create_active("a1", "user-1", "discord:9")
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn ended_session_is_replaced_by_a_new_active_one() {
        let store = store();
        let first = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        store.end(&first.id).unwrap();
        let second = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.get(&first.id).unwrap().status, SessionStatus::Ended);
    }

    #[test]
    fn messages_keep_append_order() {
        let store = store();
        let session = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        store
            .append_message(&session.id, MessageRole::User, "hello")
            .unwrap();
        store
            .append_message(&session.id, MessageRole::Assistant, "hi there")
            .unwrap();
        store
            .append_message(&session.id, MessageRole::User, "how are you?")
            .unwrap();

        let messages = store.messages(&session.id).unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "hi there", "how are you?"]);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn append_to_unknown_session_fails() {
        let store = store();
        let err = store
            .append_message("nope", MessageRole::User, "hello")
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn recent_messages_returns_tail_window() {
        let store = store();
        let session = store
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();
        for i in 0..5 {
            store
                .append_message(&session.id, MessageRole::User, &format!("m{i}"))
                .unwrap();
        }
        let window = store.recent_messages(&session.id, 2).unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[test]
    fn get_unknown_session_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get("missing"),
            Err(SessionError::NotFound(_))
        ));
    }
}
