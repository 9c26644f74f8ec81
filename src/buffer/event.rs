//! Event record types for the per-job append-only buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every event line.
pub const SCHEMA_VERSION: u32 = 1;

// ─── EventType ───────────────────────────────────────────────────────────────

/// What kind of record a buffer line holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SessionStart,
    SessionEnd,
    LlmRequest,
    LlmResponse,
    ToolCall,
    ToolResult,
    Checkpoint,
    Error,
    Steering,
    ApprovalRequest,
    ApprovalDecision,
}

// ─── BufferEvent ─────────────────────────────────────────────────────────────

/// One append-only record in a job's session file.
///
/// `sequence` is assigned by the writer and restarts at 0 for every session
/// file; `crc32` covers the serialized `data` bag when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferEvent {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crc32: Option<u32>,
}

impl BufferEvent {
    /// Build an event with the current timestamp.  `sequence` is a
    /// placeholder until the writer assigns the real value.
    pub fn new(
        job_id: impl Into<String>,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            job_id: job_id.into(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            sequence: 0,
            event_type,
            data,
            crc32: None,
        }
    }

    /// Attach a CRC32 over the serialized `data` bag.
    pub fn with_crc(mut self) -> Self {
        self.crc32 = Some(data_crc(&self.data));
        self
    }

    /// Whether the stored CRC (if any) matches the `data` bag.
    pub fn crc_matches(&self) -> bool {
        match self.crc32 {
            Some(stored) => stored == data_crc(&self.data),
            None => true,
        }
    }
}

/// CRC32 of the canonical JSON serialization of a data bag.
pub fn data_crc(data: &serde_json::Value) -> u32 {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    crc32fast::hash(&bytes)
}

// ─── Session metadata ────────────────────────────────────────────────────────

/// Summary persisted next to the session files as `metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferMetadata {
    pub job_id: String,
    pub agent_id: String,
    /// Number of session files rolled so far.
    pub session_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
