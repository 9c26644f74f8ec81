//! Process assembly: build shared state leaf-first, tear down in reverse.
//!
//! Order in: stores → provider router → streaming hub → channel
//! supervisor → dispatcher → memory → worker → cron.  Order out is the
//! mirror image, with the worker drained under the shutdown grace.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use thiserror::Error;

use crate::agents::AgentRegistry;
use crate::approvals::{ApprovalGate, HandoffVault};
use crate::channels::{
    BindingStore, ChannelSupervisor, MessageDispatcher, SupervisorConfig,
};
use crate::config::Config;
use crate::gateway::{AppState, AuthRegistry};
use crate::jobs::{
    AgentExecuteHandler, ApprovalExpireHandler, CorrectionStrengthenHandler, CronEntry,
    CronScheduler, JobPayload, JobStore, MemoryExtractHandler, ProactiveDetectHandler,
    WorkerConfig, WorkerDeps, WorkerRuntime,
};
use crate::memory::{
    FactExtractor, HashEmbedding, InMemoryVectorStore, LruEmbeddingCache, MemoryPipeline,
};
use crate::providers::{ProviderRouter, TaskRequest};
use crate::sessions::SessionStore;
use crate::skills::SkillIndex;
use crate::streaming::StreamingHub;

/// Distinct texts the embedding cache holds per process.
const EMBEDDING_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum BootError {
    #[error("store initialization failed: {0}")]
    Store(String),

    #[error("io error during boot: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Extraction over the provider router ─────────────────────────────────────

/// Fact extraction backed by whatever completion provider is routable.
struct RouterExtractor {
    router: Arc<ProviderRouter>,
}

#[async_trait]
impl FactExtractor for RouterExtractor {
    async fn extract(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String> {
        let request = TaskRequest::completion(serde_json::json!({
            "system": system_prompt,
            "prompt": user_prompt,
        }));
        self.router
            .execute(request)
            .await
            .map(|output| output.content)
            .map_err(|e| e.to_string())
    }
}

// ─── ProcessState ────────────────────────────────────────────────────────────

/// Everything the daemon owns, in construction order.
pub struct ProcessState {
    pub config: Config,
    pub jobs: JobStore,
    pub sessions: SessionStore,
    pub approvals: ApprovalGate,
    pub bindings: BindingStore,
    pub router: Arc<ProviderRouter>,
    pub hub: Arc<StreamingHub>,
    pub supervisor: Arc<ChannelSupervisor>,
    pub agents: Arc<AgentRegistry>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub memory: Arc<MemoryPipeline>,
    pub skills: Arc<SkillIndex>,
    pub auth: Arc<AuthRegistry>,
    pub handoffs: HandoffVault,
    pub worker: Arc<WorkerRuntime>,
    pub cron: Arc<CronScheduler>,
    pub ready: Arc<AtomicBool>,
    pub shutting_down: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ProcessState {
    /// Build and start everything under `data_dir`.
    pub async fn boot(config: Config, data_dir: &Path) -> Result<Self, BootError> {
        std::fs::create_dir_all(data_dir)?;
        let buffer_dir = data_dir.join("buffers");
        std::fs::create_dir_all(&buffer_dir)?;

        // Durable stores first: everything else leans on them.
        let jobs = JobStore::open(&data_dir.join("jobs.db")).map_err(store_err)?;
        let sessions = SessionStore::open(&data_dir.join("sessions.db")).map_err(store_err)?;
        let approvals = ApprovalGate::open(&data_dir.join("approvals.db")).map_err(store_err)?;
        let bindings = BindingStore::open(&data_dir.join("bindings.db")).map_err(store_err)?;

        // Leaf services.
        let router = Arc::new(ProviderRouter::new());
        let hub = Arc::new(StreamingHub::new());
        let supervisor = ChannelSupervisor::new(SupervisorConfig::default());
        let agents = Arc::new(AgentRegistry::new());
        let auth = Arc::new(AuthRegistry::new());
        let handoffs = HandoffVault::new();
        let skills = Arc::new(SkillIndex::new(data_dir.join("skills")));
        let _ = skills.refresh();

        let dispatcher = Arc::new(MessageDispatcher::new(
            bindings.clone(),
            sessions.clone(),
            jobs.clone(),
            Arc::clone(&supervisor),
        ));

        // All pipeline embeddings go through the LRU cache; the hash
        // provider underneath stands in for an external embedding backend.
        let embeddings = Arc::new(LruEmbeddingCache::new(
            Box::new(HashEmbedding::new()),
            EMBEDDING_CACHE_CAPACITY,
        ));
        let memory = Arc::new(MemoryPipeline::new(
            Arc::new(RouterExtractor {
                router: Arc::clone(&router),
            }),
            embeddings,
            Arc::new(InMemoryVectorStore::new()),
        ));

        // Worker on top of everything it coordinates.
        let deps = Arc::new(WorkerDeps {
            jobs: jobs.clone(),
            sessions: sessions.clone(),
            agents: Arc::clone(&agents),
            hub: Arc::clone(&hub),
            router: Arc::clone(&router),
            approvals: approvals.clone(),
            supervisor: Arc::clone(&supervisor),
            memory: Arc::clone(&memory),
            skills: Arc::clone(&skills),
            buffer_dir,
        });
        let mut worker = WorkerRuntime::new(
            WorkerConfig {
                concurrency: config.worker_concurrency,
                ..WorkerConfig::default()
            },
            Arc::clone(&deps),
        )
        .with_dispatcher(Arc::clone(&dispatcher));
        worker.register_handler(Arc::new(AgentExecuteHandler));
        worker.register_handler(Arc::new(MemoryExtractHandler));
        worker.register_handler(Arc::new(ApprovalExpireHandler));
        worker.register_handler(Arc::new(CorrectionStrengthenHandler::default()));
        worker.register_handler(Arc::new(ProactiveDetectHandler::default()));
        let worker = Arc::new(worker);

        let cron = CronScheduler::new(
            jobs.clone(),
            vec![CronEntry {
                name: "approval-expiry".into(),
                expr: "* * * * *".into(),
                agent_id: "system".into(),
                payload: JobPayload::ApprovalExpire,
            }],
        );

        let mut tasks = Vec::new();
        tasks.push(supervisor.run());
        tasks.push(worker.run());
        tasks.push(cron.run());

        let state = Self {
            config,
            jobs,
            sessions,
            approvals,
            bindings,
            router,
            hub,
            supervisor,
            agents,
            dispatcher,
            memory,
            skills,
            auth,
            handoffs,
            worker,
            cron,
            ready: Arc::new(AtomicBool::new(true)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            tasks,
        };
        log::info!("boot: process state assembled");
        Ok(state)
    }

    /// Gateway state view over the process state.
    pub fn app_state(&self) -> AppState {
        AppState {
            auth: Arc::clone(&self.auth),
            agents: Arc::clone(&self.agents),
            jobs: self.jobs.clone(),
            sessions: self.sessions.clone(),
            approvals: self.approvals.clone(),
            hub: Arc::clone(&self.hub),
            bindings: self.bindings.clone(),
            supervisor: Arc::clone(&self.supervisor),
            ready: Arc::clone(&self.ready),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }

    /// Tear down in reverse construction order.
    pub async fn shutdown(mut self) {
        log::info!("shutdown: draining");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.ready.store(false, Ordering::SeqCst);

        self.cron.stop();
        self.worker.stop_gracefully(self.config.shutdown_grace).await;
        self.supervisor.stop_all().await;
        for agent in self.agents.list() {
            self.hub.disconnect_all(&agent.profile.id);
        }
        self.handoffs.cleanup();

        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("shutdown: complete");
    }
}

fn store_err(err: impl std::fmt::Display) -> BootError {
    BootError::Store(err.to_string())
}

/// Default data directory for the daemon.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("skipper"))
        .unwrap_or_else(|| std::env::temp_dir().join("skipper"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boot_then_shutdown_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let state = ProcessState::boot(Config::default(), tmp.path())
            .await
            .unwrap();
        assert!(state.ready.load(Ordering::SeqCst));
        assert_eq!(state.cron.len(), 1);

        state.shutdown().await;
    }

    #[tokio::test]
    async fn app_state_shares_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let state = ProcessState::boot(Config::default(), tmp.path())
            .await
            .unwrap();
        let app = state.app_state();
        state.shutting_down.store(true, Ordering::SeqCst);
        assert!(app.shutting_down.load(Ordering::SeqCst));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn boot_creates_data_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("nested");
        let state = ProcessState::boot(Config::default(), &root).await.unwrap();
        assert!(root.join("jobs.db").exists());
        assert!(root.join("buffers").is_dir());
        state.shutdown().await;
    }
}
