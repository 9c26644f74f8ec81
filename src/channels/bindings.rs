//! Chat → agent bindings.
//!
//! A binding routes one (channel type, chat id) to an agent; each channel
//! type may also carry a default agent for unbound chats.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub channel_type: String,
    pub chat_id: String,
    pub agent_id: String,
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("binding store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for BindingError {
    fn from(err: rusqlite::Error) -> Self {
        BindingError::Store(err.to_string())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS channel_bindings (
    channel_type TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    PRIMARY KEY (channel_type, chat_id)
);

CREATE TABLE IF NOT EXISTS channel_defaults (
    channel_type TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL
);
"#;

/// SQLite-backed binding store.
#[derive(Clone)]
pub struct BindingStore {
    conn: Arc<Mutex<Connection>>,
}

impl BindingStore {
    pub fn open(path: &std::path::Path) -> Result<Self, BindingError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, BindingError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, BindingError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bind a chat to an agent (replacing any existing binding).
    pub fn bind(
        &self,
        channel_type: &str,
        chat_id: &str,
        agent_id: &str,
    ) -> Result<(), BindingError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO channel_bindings (channel_type, chat_id, agent_id)
             VALUES (?1, ?2, ?3)",
            params![channel_type, chat_id, agent_id],
        )?;
        Ok(())
    }

    /// Remove a binding; returns whether one existed.
    pub fn unbind(&self, channel_type: &str, chat_id: &str) -> Result<bool, BindingError> {
        let removed = self.lock().execute(
            "DELETE FROM channel_bindings WHERE channel_type = ?1 AND chat_id = ?2",
            params![channel_type, chat_id],
        )?;
        Ok(removed > 0)
    }

    /// Set (or clear) the default agent for a channel type.
    pub fn set_default(
        &self,
        channel_type: &str,
        agent_id: Option<&str>,
    ) -> Result<(), BindingError> {
        let conn = self.lock();
        match agent_id {
            Some(agent_id) => {
                conn.execute(
                    "INSERT OR REPLACE INTO channel_defaults (channel_type, agent_id)
                     VALUES (?1, ?2)",
                    params![channel_type, agent_id],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM channel_defaults WHERE channel_type = ?1",
                    params![channel_type],
                )?;
            }
        }
        Ok(())
    }

    /// The direct binding for a chat, ignoring channel defaults.
    pub fn direct_binding(
        &self,
        channel_type: &str,
        chat_id: &str,
    ) -> Result<Option<ChannelBinding>, BindingError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT channel_type, chat_id, agent_id FROM channel_bindings
                 WHERE channel_type = ?1 AND chat_id = ?2",
                params![channel_type, chat_id],
                |row| {
                    Ok(ChannelBinding {
                        channel_type: row.get(0)?,
                        chat_id: row.get(1)?,
                        agent_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Resolve the agent for a chat: direct binding, else channel default.
    pub fn resolve(
        &self,
        channel_type: &str,
        chat_id: &str,
    ) -> Result<Option<String>, BindingError> {
        let conn = self.lock();
        let direct: Option<String> = conn
            .query_row(
                "SELECT agent_id FROM channel_bindings
                 WHERE channel_type = ?1 AND chat_id = ?2",
                params![channel_type, chat_id],
                |row| row.get(0),
            )
            .optional()?;
        if direct.is_some() {
            return Ok(direct);
        }
        Ok(conn
            .query_row(
                "SELECT agent_id FROM channel_defaults WHERE channel_type = ?1",
                params![channel_type],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All bindings for an agent, sorted for stable API output.
    pub fn bindings_for_agent(&self, agent_id: &str) -> Result<Vec<ChannelBinding>, BindingError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT channel_type, chat_id, agent_id FROM channel_bindings
             WHERE agent_id = ?1 ORDER BY channel_type, chat_id",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok(ChannelBinding {
                channel_type: row.get(0)?,
                chat_id: row.get(1)?,
                agent_id: row.get(2)?,
            })
        })?;
        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row?);
        }
        Ok(bindings)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
