//! Per-agent lifecycle state machine.
//!
//! Six states, a fixed allowed-transition table, and post-commit listener
//! fan-out.  Invalid transitions leave the state untouched and report
//! `InvalidTransition{from, to}`.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ─── AgentState ──────────────────────────────────────────────────────────────

/// Lifecycle state of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Booting,
    Hydrating,
    Ready,
    Executing,
    Draining,
    Terminated,
}

impl AgentState {
    /// The full allowed-transition table.  Self-transitions are invalid.
    pub fn can_transition_to(self, to: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, to),
            (Booting, Hydrating)
                | (Booting, Terminated)
                | (Hydrating, Ready)
                | (Hydrating, Terminated)
                | (Ready, Executing)
                | (Ready, Draining)
                | (Executing, Draining)
                | (Executing, Terminated)
                | (Draining, Terminated)
        )
    }

    /// Agent can accept work (READY) or is doing work (EXECUTING).
    pub fn is_ready(self) -> bool {
        matches!(self, AgentState::Ready | AgentState::Executing)
    }

    pub fn is_alive(self) -> bool {
        self != AgentState::Terminated
    }

    pub fn is_terminal(self) -> bool {
        self == AgentState::Terminated
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Booting => "BOOTING",
            AgentState::Hydrating => "HYDRATING",
            AgentState::Ready => "READY",
            AgentState::Executing => "EXECUTING",
            AgentState::Draining => "DRAINING",
            AgentState::Terminated => "TERMINATED",
        };
        write!(f, "{name}")
    }
}

// ─── Errors / events ─────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: AgentState, to: AgentState },
}

/// Delivered to listeners after (and only after) a successful transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub agent_id: String,
    pub from: AgentState,
    pub to: AgentState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Listener registry ───────────────────────────────────────────────────────

#[derive(Debug)]
struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<Transition>,
}

/// Handle returned by [`LifecycleMachine::on_transition`]; pass it to
/// [`LifecycleMachine::unsubscribe`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(u64);

// ─── LifecycleMachine ────────────────────────────────────────────────────────

/// State machine for a single agent.
///
/// State changes and listener registration share one mutex, so listeners
/// observe transitions in commit order.  A listener whose channel is gone
/// is dropped silently; one dead sink never blocks the rest.
#[derive(Debug)]
pub struct LifecycleMachine {
    agent_id: String,
    state: Mutex<AgentState>,
    listeners: Mutex<Vec<Listener>>,
    next_listener_id: AtomicU64,
}

impl LifecycleMachine {
    /// Agents are created in BOOTING.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: Mutex::new(AgentState::Booting),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    /// Attempt a transition.  On success, listeners receive the committed
    /// [`Transition`]; on failure the state is unchanged and nothing fires.
    pub fn transition(
        &self,
        to: AgentState,
        reason: impl Into<String>,
    ) -> Result<Transition, LifecycleError> {
        let transition = {
            let mut state = lock(&self.state);
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(LifecycleError::InvalidTransition { from, to });
            }
            *state = to;
            Transition {
                agent_id: self.agent_id.clone(),
                from,
                to,
                reason: reason.into(),
                timestamp: Utc::now(),
            }
        };

        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.tx.send(transition.clone()).is_ok());

        log::debug!(
            "lifecycle: {} {} -> {} ({})",
            transition.agent_id,
            transition.from,
            transition.to,
            transition.reason
        );
        Ok(transition)
    }

    /// Register a transition listener.  Returns the receiving channel and
    /// an unsubscribe handle.
    pub fn on_transition(&self) -> (ListenerHandle, mpsc::UnboundedReceiver<Transition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push(Listener { id, tx });
        (ListenerHandle(id), rx)
    }

    pub fn unsubscribe(&self, handle: ListenerHandle) {
        lock(&self.listeners).retain(|l| l.id != handle.0);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
