//! Durable jobs: store, retry policy, worker runtime, cron, and handlers.

pub mod cron;
pub mod handlers;
pub mod retry;
pub mod store;
pub mod types;
pub mod worker;

pub use cron::{CronEntry, CronScheduler, next_fire};
pub use handlers::{
    AgentExecuteHandler, ApprovalExpireHandler, CorrectionStrengthenHandler, MemoryExtractHandler,
    ProactiveDetectHandler,
};
pub use retry::{RetryPolicy, jitter};
pub use store::{JobStore, JobStoreError, TransitionRecord};
pub use types::{Checkpoint, HistoryMessage, Job, JobPayload, JobStatus, NewJob};
pub use worker::{CancelToken, JobContext, TaskHandler, WorkerConfig, WorkerDeps, WorkerRuntime};
