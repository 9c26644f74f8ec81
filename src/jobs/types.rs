//! Job entity and payload facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ClassifiedError, ErrorClass};

// ─── JobStatus ───────────────────────────────────────────────────────────────

/// Durable job state.  `Completed` and `DeadLetter` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLetter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobStatus::Pending),
            "SCHEDULED" => Some(JobStatus::Scheduled),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "DEAD_LETTER" => Some(JobStatus::DeadLetter),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── JobPayload ──────────────────────────────────────────────────────────────

/// One turn of stored conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Typed facade over the free-form payload bag.
///
/// Payloads travel as JSON keyed by `type`; decoding an unknown tag is a
/// permanent failure (no retry will make it parse).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPayload {
    ChatResponse {
        prompt: String,
        #[serde(default)]
        conversation_history: Vec<HistoryMessage>,
        #[serde(default)]
        goal_type: Option<String>,
        /// Explicit skill selection, when the operator pinned one.
        #[serde(default)]
        skills: Vec<String>,
    },
    MemoryExtract {
        session_id: String,
        /// How many trailing messages to extract over.
        #[serde(default = "default_window")]
        window: usize,
    },
    ApprovalExpire,
    CorrectionStrengthen {
        entries: Vec<serde_json::Value>,
    },
    ProactiveDetect {
        signals: Vec<serde_json::Value>,
    },
}

fn default_window() -> usize {
    20
}

impl JobPayload {
    /// The task handler this payload dispatches to.
    pub fn task_name(&self) -> &'static str {
        match self {
            JobPayload::ChatResponse { .. } => "agent_execute",
            JobPayload::MemoryExtract { .. } => "memory_extract",
            JobPayload::ApprovalExpire => "approval_expire",
            JobPayload::CorrectionStrengthen { .. } => "correction_strengthen",
            JobPayload::ProactiveDetect { .. } => "proactive_detect",
        }
    }

    /// Decode a stored payload bag; unknown tags are permanent errors.
    pub fn decode(value: &serde_json::Value) -> Result<Self, ClassifiedError> {
        serde_json::from_value(value.clone()).map_err(|e| {
            ClassifiedError::new(
                ErrorClass::Permanent,
                format!("undecodable job payload: {e}"),
            )
        })
    }

    pub fn encode(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ─── Checkpoint ──────────────────────────────────────────────────────────────

/// Opaque resumable state plus a CRC over its serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub state: serde_json::Value,
    pub crc: u32,
}

impl Checkpoint {
    pub fn new(state: serde_json::Value) -> Self {
        let crc = crate::buffer::data_crc(&state);
        Self { state, crc }
    }

    pub fn crc_matches(&self) -> bool {
        self.crc == crate::buffer::data_crc(&self.state)
    }
}

// ─── Job ─────────────────────────────────────────────────────────────────────

/// A durable unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: JobStatus,
    pub priority: i32,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<ClassifiedError>,
    #[serde(default)]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approval_expires_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the payload facade.
    pub fn typed_payload(&self) -> Result<JobPayload, ClassifiedError> {
        JobPayload::decode(&self.payload)
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub payload: JobPayload,
    pub priority: i32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
}

impl NewJob {
    pub fn new(agent_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: None,
            payload,
            priority: 0,
            max_attempts: 3,
            timeout_seconds: 300,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
