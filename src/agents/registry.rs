//! Agent registry: identity, resource limits, lifecycle, and steering.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::lifecycle::{AgentState, LifecycleError, LifecycleMachine, Transition};
use super::steering::{SteeringInbox, SteeringMessage, SteeringPriority};

// ─── Agent identity ──────────────────────────────────────────────────────────

/// Numeric caps applied to an agent's work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Token budget for skill content injected per request.
    pub skill_token_budget: usize,
    /// Maximum concurrent jobs for this agent.
    pub max_concurrent_jobs: usize,
    /// Default per-job timeout in seconds.
    pub job_timeout_seconds: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            skill_token_budget: 4_000,
            max_concurrent_jobs: 1,
            job_timeout_seconds: 300,
        }
    }
}

/// Static description of a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub slug: String,
    pub display_name: String,
    #[serde(default)]
    pub limits: ResourceLimits,
}

// ─── AgentHandle ─────────────────────────────────────────────────────────────

/// Live handle pairing a profile with its lifecycle machine and inbox.
#[derive(Debug)]
pub struct AgentHandle {
    pub profile: AgentProfile,
    pub lifecycle: LifecycleMachine,
    pub inbox: SteeringInbox,
}

impl AgentHandle {
    fn new(profile: AgentProfile) -> Self {
        let lifecycle = LifecycleMachine::new(profile.id.clone());
        Self {
            profile,
            lifecycle,
            inbox: SteeringInbox::new(),
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("agent {agent_id} is {state}, steering requires EXECUTING")]
    NotExecuting { agent_id: String, state: AgentState },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

// ─── AgentRegistry ───────────────────────────────────────────────────────────

/// Process-wide set of known agents.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new agent (created in BOOTING).
    pub fn register(&self, profile: AgentProfile) -> Result<Arc<AgentHandle>, AgentError> {
        let mut agents = write(&self.agents);
        if agents.contains_key(&profile.id) {
            return Err(AgentError::AlreadyRegistered(profile.id));
        }
        let handle = Arc::new(AgentHandle::new(profile));
        agents.insert(handle.profile.id.clone(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        read(&self.agents).get(agent_id).cloned()
    }

    pub fn require(&self, agent_id: &str) -> Result<Arc<AgentHandle>, AgentError> {
        self.get(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<AgentHandle>> {
        let mut agents: Vec<_> = read(&self.agents).values().cloned().collect();
        agents.sort_by(|a, b| a.profile.id.cmp(&b.profile.id));
        agents
    }

    /// Enqueue a steering message; only valid while the agent is EXECUTING.
    pub fn steer(
        &self,
        agent_id: &str,
        message: impl Into<String>,
        priority: SteeringPriority,
    ) -> Result<SteeringMessage, AgentError> {
        let handle = self.require(agent_id)?;
        let state = handle.lifecycle.state();
        if state != AgentState::Executing {
            return Err(AgentError::NotExecuting {
                agent_id: agent_id.to_string(),
                state,
            });
        }
        let msg = SteeringMessage::new(agent_id, message, priority);
        handle.inbox.push(msg.clone());
        Ok(msg)
    }

    /// Begin draining an agent: no new jobs, in-flight work finishes.
    pub fn drain(&self, agent_id: &str, reason: &str) -> Result<Transition, AgentError> {
        let handle = self.require(agent_id)?;
        Ok(handle.lifecycle.transition(AgentState::Draining, reason)?)
    }

    /// Terminate an agent and drop any pending steering.
    pub fn terminate(&self, agent_id: &str, reason: &str) -> Result<Transition, AgentError> {
        let handle = self.require(agent_id)?;
        let transition = handle.lifecycle.transition(AgentState::Terminated, reason)?;
        handle.inbox.drain();
        Ok(transition)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
