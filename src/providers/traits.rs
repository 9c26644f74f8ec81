//! Execution backend abstraction.
//!
//! A **backend** is anything that can run one step of agent work: an LLM
//! endpoint, a browser-automation sidecar, a shell sandbox.  The control
//! plane treats them as opaque; concrete SDK bindings live outside the
//! core and implement [`Backend`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, classify};

// ─── TaskKind ────────────────────────────────────────────────────────────────

/// What capability a task step needs from its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// LLM completion over a prompt + history.
    Completion,
    /// Drive a browser session.
    Browser,
    /// Run a sandboxed shell command.
    Shell,
}

// ─── TaskRequest / TaskOutput ────────────────────────────────────────────────

/// One unit of work handed to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub kind: TaskKind,
    /// Opaque input bag (prompt, history, tool arguments, …).
    pub input: serde_json::Value,
    /// Deadline for this single call.
    #[serde(with = "duration_millis")]
    pub deadline: Duration,
}

impl TaskRequest {
    pub fn completion(input: serde_json::Value) -> Self {
        Self {
            kind: TaskKind::Completion,
            input,
            deadline: Duration::from_secs(60),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// A backend's answer to one [`TaskRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    /// Primary textual result (assistant turn, command stdout, …).
    pub content: String,
    /// Structured extras (tool calls, usage, artifacts).
    #[serde(default)]
    pub data: serde_json::Value,
}

// ─── BackendError ────────────────────────────────────────────────────────────

/// Failure reported by a backend call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("backend error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct BackendError {
    /// HTTP-ish status, when the transport had one.
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Map this failure onto the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        classify(self.status, &self.message)
    }
}

// ─── Backend trait ───────────────────────────────────────────────────────────

/// An opaque execution backend.
///
/// Implementations must be `Send + Sync`; they are stored behind `Arc` in
/// the provider router and may be called from many handlers at once (the
/// router's per-provider semaphore limits actual concurrency).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Stable identifier, e.g. `"llm-primary"`, `"browser-sidecar"`.
    fn id(&self) -> &str;

    /// Which task kinds this backend can serve.
    fn supports(&self, kind: TaskKind) -> bool;

    /// Run one task.  The implementation should respect `task.deadline`;
    /// the router also enforces it from the outside.
    async fn execute(&self, task: TaskRequest) -> Result<TaskOutput, BackendError>;
}

// ─── serde helper ────────────────────────────────────────────────────────────

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
