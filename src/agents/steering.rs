//! Operator steering: guidance injected into an EXECUTING agent.
//!
//! Messages land in a per-agent inbox and are drained by the job handler
//! at its yield points (tool boundaries and LLM-turn boundaries).  A
//! high-priority message additionally wakes the handler's cancellation
//! point so the current tool call can be preempted.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

// ─── SteeringMessage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SteeringPriority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteeringMessage {
    pub id: String,
    pub agent_id: String,
    pub message: String,
    pub priority: SteeringPriority,
    pub timestamp: DateTime<Utc>,
}

impl SteeringMessage {
    pub fn new(
        agent_id: impl Into<String>,
        message: impl Into<String>,
        priority: SteeringPriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            message: message.into(),
            priority,
            timestamp: Utc::now(),
        }
    }
}

// ─── SteeringInbox ───────────────────────────────────────────────────────────

/// FIFO inbox for one agent's steering messages.
///
/// Cloneable handle; the queue itself is shared.  The embedded `Notify` is
/// signalled on high-priority pushes so an executing handler can treat it
/// as a preemption point.
#[derive(Debug, Clone)]
pub struct SteeringInbox {
    queue: Arc<Mutex<VecDeque<SteeringMessage>>>,
    preempt: Arc<Notify>,
}

impl SteeringInbox {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            preempt: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a message.  High priority also wakes any handler parked on
    /// [`preempted`](Self::preempted).
    pub fn push(&self, message: SteeringMessage) {
        let high = message.priority == SteeringPriority::High;
        lock(&self.queue).push_back(message);
        if high {
            self.preempt.notify_waiters();
            self.preempt.notify_one();
        }
    }

    /// Drain all pending messages in arrival order.
    pub fn drain(&self) -> Vec<SteeringMessage> {
        lock(&self.queue).drain(..).collect()
    }

    /// Whether any message is pending.
    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Whether a high-priority message is pending (checked at cancellation
    /// points without draining).
    pub fn has_high_priority(&self) -> bool {
        lock(&self.queue)
            .iter()
            .any(|m| m.priority == SteeringPriority::High)
    }

    /// Resolves when a high-priority message arrives.  Used in
    /// `tokio::select!` alongside the current tool-call future.
    pub async fn preempted(&self) {
        self.preempt.notified().await;
    }
}

impl Default for SteeringInbox {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
