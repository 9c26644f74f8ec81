//! skipper: a control plane for autonomous agents.
//!
//! Operators submit goals over chat channels or the REST gateway; goals
//! run as durable jobs on selected execution backends, stream live output
//! to subscribers, and gate dangerous actions behind human approval.

pub mod agents;
pub mod approvals;
pub mod boot;
pub mod buffer;
pub mod channels;
pub mod config;
pub mod error;
pub mod gateway;
pub mod jobs;
pub mod logging;
pub mod memory;
pub mod providers;
pub mod review;
pub mod sessions;
pub mod skills;
pub mod streaming;

/// Convenience re-exports for the most commonly used types across the
/// codebase.
///
/// ```rust
/// use skipper::prelude::*;
/// ```
pub mod prelude {
    // Error taxonomy
    pub use crate::error::{ClassifiedError, ErrorClass, classify};

    // Jobs
    pub use crate::jobs::{
        Job, JobPayload, JobStatus, JobStore, NewJob, TaskHandler, WorkerConfig, WorkerDeps,
        WorkerRuntime,
    };

    // Agents
    pub use crate::agents::{AgentProfile, AgentRegistry, AgentState, SteeringPriority};

    // Providers
    pub use crate::providers::{Backend, BreakerConfig, ProviderRouter, TaskKind, TaskRequest};

    // Streaming
    pub use crate::streaming::{StreamEvent, StreamingHub};

    // Buffer
    pub use crate::buffer::{BufferEvent, EventType, JobBuffer};

    // Channels
    pub use crate::channels::{ChannelAdapter, ChannelSupervisor, InboundMessage, MessageDispatcher};

    // Approvals
    pub use crate::approvals::{ApprovalGate, ApprovalStatus, Decision, RiskLevel};

    // Memory
    pub use crate::memory::{EmbeddingProvider, MemoryPipeline, MemoryRecord, VectorStore};

    // Sessions
    pub use crate::sessions::{MessageRole, Session, SessionStore};

    // Configuration
    pub use crate::config::Config;
}
