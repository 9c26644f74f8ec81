//! End-to-end scenarios across the control plane: chat dispatch through
//! the worker to a backend, failover under an open breaker, steering,
//! and stream replay.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use skipper::agents::{AgentProfile, AgentRegistry, AgentState, ResourceLimits, SteeringPriority};
use skipper::approvals::{ApprovalGate, ApprovalRequest};
use skipper::channels::{
    BindingStore, ChannelAdapter, ChannelError, ChannelSupervisor, DispatchOutcome,
    InboundMessage, MessageDispatcher, SupervisorConfig, Transport,
};
use skipper::jobs::{
    AgentExecuteHandler, JobStatus, JobStore, RetryPolicy, WorkerConfig, WorkerDeps, WorkerRuntime,
};
use skipper::memory::extraction::FactExtractor;
use skipper::memory::{HashEmbedding, InMemoryVectorStore, MemoryPipeline};
use skipper::providers::{
    Backend, BackendError, BreakerConfig, ProviderRouter, TaskKind, TaskOutput, TaskRequest,
};
use skipper::sessions::{MessageRole, SessionStore};
use skipper::streaming::StreamingHub;

// ─── Test doubles ────────────────────────────────────────────────────────────

struct EchoBackend {
    id: String,
    calls: AtomicU32,
}

impl EchoBackend {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn id(&self) -> &str {
        &self.id
    }
    fn supports(&self, _kind: TaskKind) -> bool {
        true
    }
    async fn execute(&self, task: TaskRequest) -> Result<TaskOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = task.input["prompt"].as_str().unwrap_or_default();
        Ok(TaskOutput {
            content: format!("echo: {prompt}"),
            data: serde_json::Value::Null,
        })
    }
}

struct NullExtractor;

#[async_trait]
impl FactExtractor for NullExtractor {
    async fn extract(&self, _s: &str, _u: &str) -> Result<String, String> {
        Ok("{\"facts\": []}".to_string())
    }
}

/// Channel adapter that records outbound messages.
struct RecordingAdapter {
    name: String,
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingAdapter {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            sent: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel_type(&self) -> &str {
        &self.name
    }
    fn transport(&self) -> Transport {
        Transport::Push
    }
    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ChannelError> {
        Ok(())
    }
    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((chat_id.to_string(), text.to_string()));
        }
        Ok(())
    }
    async fn send_approval_request(
        &self,
        _chat_id: &str,
        _approval: &ApprovalRequest,
    ) -> Result<(), ChannelError> {
        Ok(())
    }
}

// ─── Fixture ─────────────────────────────────────────────────────────────────

struct Plane {
    deps: Arc<WorkerDeps>,
    dispatcher: Arc<MessageDispatcher>,
    adapter: Arc<RecordingAdapter>,
    worker: Arc<WorkerRuntime>,
    _buffer_dir: tempfile::TempDir,
}

impl Plane {
    fn new() -> Self {
        let adapter = RecordingAdapter::new("telegram");
        let supervisor = ChannelSupervisor::new(SupervisorConfig::default());
        supervisor.register(adapter.clone()).unwrap();

        let router = ProviderRouter::new();
        router.register(EchoBackend::new("llm-primary"), 0, BreakerConfig::default(), 4);

        let jobs = JobStore::open_in_memory()
            .unwrap()
            .with_retry_policy(RetryPolicy::new(
                Duration::from_millis(5),
                Duration::from_millis(50),
            ));
        let sessions = SessionStore::open_in_memory().unwrap();
        let bindings = BindingStore::open_in_memory().unwrap();
        bindings.bind("telegram", "chat-42", "A1").unwrap();

        let agents = Arc::new(AgentRegistry::new());
        let handle = agents
            .register(AgentProfile {
                id: "A1".to_string(),
                slug: "a1".to_string(),
                display_name: "Agent One".to_string(),
                limits: ResourceLimits::default(),
            })
            .unwrap();
        handle
            .lifecycle
            .transition(AgentState::Hydrating, "boot")
            .unwrap();
        handle
            .lifecycle
            .transition(AgentState::Ready, "hydrated")
            .unwrap();

        let buffer_dir = tempfile::tempdir().unwrap();
        let deps = Arc::new(WorkerDeps {
            jobs: jobs.clone(),
            sessions: sessions.clone(),
            agents,
            hub: Arc::new(StreamingHub::new()),
            router: Arc::new(router),
            approvals: ApprovalGate::open_in_memory().unwrap(),
            supervisor: Arc::clone(&supervisor),
            memory: Arc::new(MemoryPipeline::new(
                Arc::new(NullExtractor),
                Arc::new(HashEmbedding::new()),
                Arc::new(InMemoryVectorStore::new()),
            )),
            skills: Arc::new(skipper::skills::SkillIndex::new(
                buffer_dir.path().join("skills"),
            )),
            buffer_dir: buffer_dir.path().to_path_buf(),
        });

        let dispatcher = Arc::new(MessageDispatcher::new(
            bindings,
            sessions,
            jobs,
            supervisor,
        ));

        let mut worker = WorkerRuntime::new(
            WorkerConfig {
                concurrency: 2,
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(100),
                cancel_grace: Duration::from_millis(200),
            },
            Arc::clone(&deps),
        )
        .with_dispatcher(Arc::clone(&dispatcher));
        worker.register_handler(Arc::new(AgentExecuteHandler));
        worker.register_handler(Arc::new(skipper::jobs::MemoryExtractHandler));
        let worker = Arc::new(worker);

        Self {
            deps,
            dispatcher,
            adapter,
            worker,
            _buffer_dir: buffer_dir,
        }
    }

    async fn wait_status(&self, job_id: &str, expected: JobStatus, within: Duration) {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let job = self.deps.jobs.get(job_id).unwrap();
            if job.status == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {:?} (wanted {expected:?}): {:?}",
                job.status,
                job.error
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_chat_completes_and_replies_on_channel() {
    let plane = Plane::new();
    let worker_task = plane.worker.run();

    let outcome = plane
        .dispatcher
        .dispatch(InboundMessage::new("telegram", "chat-42", "user-7", "hello"))
        .await
        .unwrap();
    let DispatchOutcome::Dispatched { job_id, session_id } = outcome else {
        panic!("expected dispatch");
    };

    plane
        .wait_status(&job_id, JobStatus::Completed, Duration::from_secs(5))
        .await;

    // Assistant message persisted on the session.
    let messages = plane.deps.sessions.messages(&session_id).unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    assert_eq!(messages[1].content, "echo: hello");

    // Reply relayed back on the channel.
    let sent = plane.adapter.sent();
    assert!(
        sent.iter().any(|(chat, text)| chat == "chat-42" && text == "echo: hello"),
        "channel reply missing: {sent:?}"
    );

    plane.worker.stop_gracefully(Duration::from_millis(500)).await;
    worker_task.abort();
}

#[tokio::test]
async fn replay_from_last_event_id_delivers_exact_tail() {
    let hub = StreamingHub::new();
    for n in 1..=5 {
        hub.broadcast("A2", "agent:output", serde_json::json!({"n": n}));
    }

    let (_conn, mut rx) = hub.connect("A2", Some("A2:3"));
    let mut ids = Vec::new();
    while let Ok(event) = rx.try_recv() {
        ids.push(event.id);
    }
    assert_eq!(ids, vec!["A2:4", "A2:5"]);

    // Further broadcasts extend the stream.
    hub.broadcast("A2", "agent:output", serde_json::json!({"n": 6}));
    assert_eq!(rx.try_recv().unwrap().id, "A2:6");
}

#[tokio::test]
async fn steering_during_execution_is_acknowledged_in_output() {
    let plane = Plane::new();
    let agent = plane.deps.agents.require("A1").unwrap();
    let (_conn, mut events) = plane.deps.hub.connect("A1", None);

    // Queue the steering first so the handler finds it at its first yield
    // point, then run the job.
    agent
        .lifecycle
        .transition(AgentState::Executing, "warm")
        .unwrap();
    plane
        .deps
        .agents
        .steer("A1", "focus on X", SteeringPriority::High)
        .unwrap();

    let worker_task = plane.worker.run();
    let outcome = plane
        .dispatcher
        .dispatch(InboundMessage::new("telegram", "chat-42", "user-7", "go"))
        .await
        .unwrap();
    let DispatchOutcome::Dispatched { job_id, .. } = outcome else {
        panic!("expected dispatch");
    };
    plane
        .wait_status(&job_id, JobStatus::Completed, Duration::from_secs(5))
        .await;

    let mut saw_ack = false;
    let mut saw_steer_output = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == "steer:ack" {
            saw_ack = true;
        }
        if event.event_type == "agent:output"
            && event.data["text"].as_str() == Some("[STEER] focus on X")
        {
            assert!(saw_ack, "steer:ack must precede the [STEER] output");
            saw_steer_output = true;
        }
    }
    assert!(saw_steer_output, "steering was not surfaced");

    plane.worker.stop_gracefully(Duration::from_millis(500)).await;
    worker_task.abort();
}

#[tokio::test]
async fn steering_while_ready_is_rejected() {
    let plane = Plane::new();
    let err = plane
        .deps
        .agents
        .steer("A1", "too early", SteeringPriority::Normal)
        .unwrap_err();
    assert!(matches!(
        err,
        skipper::agents::AgentError::NotExecuting { .. }
    ));
}

#[tokio::test]
async fn failover_routes_around_open_breaker() {
    let router = ProviderRouter::new();
    let p1 = EchoBackend::new("P1");
    let p2 = EchoBackend::new("P2");
    router.register(p1.clone(), 0, BreakerConfig::default(), 1);
    router.register(p2.clone(), 1, BreakerConfig::default(), 1);
    router.trip_breaker("P1").unwrap();

    let mut events = router.subscribe();
    let task = TaskRequest::completion(serde_json::json!({"prompt": "x"}));
    let grant = router.route(&task).unwrap();
    assert_eq!(grant.provider_id, "P2");

    use skipper::providers::{RouteEvent, SkipReason};
    let first = events.try_recv().unwrap();
    assert_eq!(
        first,
        RouteEvent::Skipped {
            provider: "P1".into(),
            reason: SkipReason::CircuitOpen
        }
    );
    let second = events.try_recv().unwrap();
    assert_eq!(
        second,
        RouteEvent::Selected {
            provider: "P2".into()
        }
    );

    // Executing routes to P2 only.
    let output = router.execute(task).await.unwrap();
    assert_eq!(output.content, "echo: x");
    assert_eq!(p1.calls.load(Ordering::SeqCst), 0);
    assert_eq!(p2.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn buffer_survives_for_recovery_after_completion() {
    let plane = Plane::new();
    let worker_task = plane.worker.run();

    let outcome = plane
        .dispatcher
        .dispatch(InboundMessage::new("telegram", "chat-42", "user-7", "persist me"))
        .await
        .unwrap();
    let DispatchOutcome::Dispatched { job_id, .. } = outcome else {
        panic!("expected dispatch");
    };
    plane
        .wait_status(&job_id, JobStatus::Completed, Duration::from_secs(5))
        .await;

    let recovery = skipper::buffer::recover(&plane.deps.buffer_dir, &job_id).unwrap();
    assert!(recovery.last_checkpoint.is_some(), "checkpoint persisted");
    assert_eq!(recovery.corrupted_lines, 0);
    assert!(!recovery.last_line_truncated);

    plane.worker.stop_gracefully(Duration::from_millis(500)).await;
    worker_task.abort();
}
