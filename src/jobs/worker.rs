//! Worker runtime: claims scheduled jobs and runs task handlers.
//!
//! Handlers run concurrently up to the configured cap, each under a
//! cooperative cancellation token, a heartbeat task, and the job's
//! timeout.  A stale-heartbeat reclaim sweep runs alongside so jobs from
//! crashed processes return to the queue.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore, watch};

use crate::agents::AgentRegistry;
use crate::approvals::ApprovalGate;
use crate::channels::{ChannelSupervisor, MessageDispatcher};
use crate::error::{ClassifiedError, ErrorClass};
use crate::memory::MemoryPipeline;
use crate::providers::ProviderRouter;
use crate::sessions::SessionStore;
use crate::skills::SkillIndex;
use crate::streaming::StreamingHub;

use super::store::JobStore;
use super::types::{Job, JobPayload};

// ─── CancelToken ─────────────────────────────────────────────────────────────

/// Cooperative cancellation signal.
///
/// Handlers poll [`is_cancelled`](Self::is_cancelled) at their yield
/// points (before external calls, after checkpoint writes, at steering
/// polls) and may park on [`cancelled`](Self::cancelled) in selects.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

// ─── Handler seam ────────────────────────────────────────────────────────────

/// Shared services available to task handlers.
pub struct WorkerDeps {
    pub jobs: JobStore,
    pub sessions: SessionStore,
    pub agents: Arc<AgentRegistry>,
    pub hub: Arc<StreamingHub>,
    pub router: Arc<ProviderRouter>,
    pub approvals: ApprovalGate,
    pub supervisor: Arc<ChannelSupervisor>,
    pub memory: Arc<MemoryPipeline>,
    pub skills: Arc<SkillIndex>,
    /// Root of the per-job event buffer tree.
    pub buffer_dir: PathBuf,
}

/// Everything a handler needs for one job run.
pub struct JobContext {
    pub job: Job,
    pub cancel: CancelToken,
    pub deps: Arc<WorkerDeps>,
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task name this handler serves (matches `JobPayload::task_name`).
    fn name(&self) -> &'static str;

    /// Run the job to completion; the returned value becomes the job's
    /// result.  On cancellation the handler should checkpoint if safe and
    /// return an error promptly.
    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError>;
}

// ─── WorkerRuntime ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Idle wait between empty claim attempts.
    pub poll_interval: Duration,
    /// Heartbeat cadence; reclaim fires at twice this lease.
    pub heartbeat_interval: Duration,
    /// Extra time a cancelled handler gets to checkpoint and return.
    pub cancel_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(5),
        }
    }
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    deps: Arc<WorkerDeps>,
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
    /// Chat completions relay through the dispatcher when present.
    dispatcher: Option<Arc<MessageDispatcher>>,
    semaphore: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    active_tokens: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig, deps: Arc<WorkerDeps>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            deps,
            handlers: HashMap::new(),
            dispatcher: None,
            semaphore,
            stop_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            active_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<MessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start the dequeue loop and the stale-job reclaim sweep.  Process
    /// signals are ignored here; the shutdown coordinator drives
    /// [`stop_gracefully`](Self::stop_gracefully).
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let worker = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();

        // Reclaim sweep: jobs whose heartbeat went stale (2x lease).
        let reclaimer = Arc::clone(self);
        let mut reclaim_stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reclaimer.config.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reclaimer
                            .deps
                            .jobs
                            .reclaim_stale(reclaimer.config.heartbeat_interval)
                        {
                            log::warn!("worker: reclaim sweep failed: {e}");
                        }
                    }
                    Ok(()) = reclaim_stop.changed() => {
                        if *reclaim_stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                let Ok(permit) = worker.semaphore.clone().acquire_owned().await else {
                    break;
                };

                let claimed = match worker.deps.jobs.claim_next() {
                    Ok(job) => job,
                    Err(e) => {
                        log::warn!("worker: claim failed: {e}");
                        None
                    }
                };

                match claimed {
                    Some(job) => {
                        let runner = Arc::clone(&worker);
                        tokio::spawn(async move {
                            runner.run_one(job).await;
                            drop(permit);
                        });
                    }
                    None => {
                        drop(permit);
                        tokio::select! {
                            _ = tokio::time::sleep(worker.config.poll_interval) => {}
                            Ok(()) = stop_rx.changed() => {}
                        }
                    }
                }
            }
        })
    }

    /// Stop dequeueing, let in-flight handlers finish until `deadline`,
    /// then cancel the stragglers.
    pub async fn stop_gracefully(&self, deadline: Duration) {
        let _ = self.stop_tx.send(true);

        let waited = tokio::time::timeout(deadline, async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if waited.is_err() {
            let tokens: Vec<CancelToken> = {
                let guard = lock(&self.active_tokens);
                guard.values().cloned().collect()
            };
            log::warn!(
                "worker: {} handler(s) still running at deadline, cancelling",
                tokens.len()
            );
            for token in tokens {
                token.cancel();
            }
            // Bounded wait for the cancelled handlers to unwind.
            let _ = tokio::time::timeout(self.config.cancel_grace, async {
                while self.in_flight.load(Ordering::SeqCst) > 0 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await;
        }
    }

    /// Run a single claimed job through its handler.
    async fn run_one(self: &Arc<Self>, job: Job) {
        let job_id = job.id.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let outcome = self.execute_job(job).await;

        match outcome {
            Ok((payload, result)) => {
                if let Err(e) = self.deps.jobs.complete(&job_id, result) {
                    log::error!("worker: completing {job_id} failed: {e}");
                } else if matches!(payload, Some(JobPayload::ChatResponse { .. })) {
                    if let Some(dispatcher) = &self.dispatcher {
                        if let Err(e) = dispatcher.complete_chat(&job_id).await {
                            log::warn!("worker: chat relay for {job_id} failed: {e}");
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("worker: job {job_id} attempt failed: {err}");
                if let Err(e) = self.deps.jobs.fail(&job_id, &err) {
                    log::error!("worker: recording failure for {job_id} failed: {e}");
                }
            }
        }

        lock(&self.active_tokens).remove(&job_id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn execute_job(
        self: &Arc<Self>,
        job: Job,
    ) -> Result<(Option<JobPayload>, serde_json::Value), ClassifiedError> {
        let payload = job.typed_payload()?;
        let handler = self
            .handlers
            .get(payload.task_name())
            .cloned()
            .ok_or_else(|| {
                ClassifiedError::new(
                    ErrorClass::Permanent,
                    format!("no handler registered for task '{}'", payload.task_name()),
                )
            })?;

        let cancel = CancelToken::new();
        lock(&self.active_tokens).insert(job.id.clone(), cancel.clone());

        // Heartbeat while the handler runs.
        let beat_jobs = self.deps.jobs.clone();
        let beat_id = job.id.clone();
        let beat_cancel = cancel.clone();
        let beat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(beat_interval);
            ticker.tick().await; // first tick is immediate; skip it
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = beat_jobs.heartbeat(&beat_id) {
                            log::debug!("worker: heartbeat for {beat_id} failed: {e}");
                            break;
                        }
                    }
                    _ = beat_cancel.cancelled() => break,
                }
            }
        });

        let timeout = Duration::from_secs(job.timeout_seconds.max(1));
        let ctx = JobContext {
            job,
            cancel: cancel.clone(),
            deps: Arc::clone(&self.deps),
        };

        let handler_fut = handler.run(ctx);
        tokio::pin!(handler_fut);

        let result = tokio::select! {
            res = &mut handler_fut => res,
            _ = tokio::time::sleep(timeout) => {
                // Cooperative timeout: cancel, then grant the grace window
                // for a final checkpoint.
                cancel.cancel();
                match tokio::time::timeout(self.config.cancel_grace, &mut handler_fut).await {
                    Ok(res) => res,
                    Err(_) => Err(ClassifiedError::new(
                        ErrorClass::Timeout,
                        format!("handler exceeded {}s timeout and grace period", timeout.as_secs()),
                    )),
                }
            }
        };

        cancel.cancel();
        heartbeat.abort();
        result.map(|value| (Some(payload), value))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::channels::supervisor::SupervisorConfig;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::types::{JobStatus, NewJob};
    use crate::memory::extraction::FactExtractor;
    use crate::memory::{HashEmbedding, InMemoryVectorStore, MemoryPipeline};

    struct NullExtractor;

    #[async_trait]
    impl FactExtractor for NullExtractor {
        async fn extract(&self, _s: &str, _u: &str) -> Result<String, String> {
            Ok("{\"facts\": []}".to_string())
        }
    }

    fn deps() -> Arc<WorkerDeps> {
        let tmp = tempfile::tempdir().map(|d| d.keep()).unwrap_or_default();
        Arc::new(WorkerDeps {
            jobs: JobStore::open_in_memory()
                .unwrap()
                .with_retry_policy(RetryPolicy::new(
                    Duration::from_millis(1),
                    Duration::from_millis(10),
                )),
            sessions: SessionStore::open_in_memory().unwrap(),
            agents: Arc::new(AgentRegistry::new()),
            hub: Arc::new(StreamingHub::new()),
            router: Arc::new(ProviderRouter::new()),
            approvals: ApprovalGate::open_in_memory().unwrap(),
            supervisor: ChannelSupervisor::new(SupervisorConfig::default()),
            memory: Arc::new(MemoryPipeline::new(
                Arc::new(NullExtractor),
                Arc::new(HashEmbedding::new()),
                Arc::new(InMemoryVectorStore::new()),
            )),
            skills: Arc::new(crate::skills::SkillIndex::new(tmp.join("skills"))),
            buffer_dir: tmp,
        })
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            cancel_grace: Duration::from_millis(100),
        }
    }

    /// Handler scripted per test.
    struct ScriptedHandler {
        name: &'static str,
        behaviour: Behaviour,
    }

    enum Behaviour {
        Succeed(serde_json::Value),
        Fail(ClassifiedError),
        /// Sleep, honouring cancellation.
        Cooperative(Duration),
        /// Sleep, ignoring cancellation.
        Stubborn(Duration),
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
            match &self.behaviour {
                Behaviour::Succeed(value) => Ok(value.clone()),
                Behaviour::Fail(err) => Err(err.clone()),
                Behaviour::Cooperative(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*duration) => Ok(serde_json::json!({"slept": true})),
                        _ = ctx.cancel.cancelled() => Err(ClassifiedError::new(
                            ErrorClass::Timeout,
                            "cancelled at yield point",
                        )),
                    }
                }
                Behaviour::Stubborn(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(serde_json::json!({"slept": true}))
                }
            }
        }
    }

    fn worker_with(
        deps: &Arc<WorkerDeps>,
        name: &'static str,
        behaviour: Behaviour,
    ) -> Arc<WorkerRuntime> {
        let mut worker = WorkerRuntime::new(fast_config(), Arc::clone(deps));
        worker.register_handler(Arc::new(ScriptedHandler { name, behaviour }));
        Arc::new(worker)
    }

    fn chat_job(deps: &Arc<WorkerDeps>) -> crate::jobs::types::Job {
        deps.jobs
            .enqueue_scheduled(NewJob::new(
                "a1",
                JobPayload::ChatResponse {
                    prompt: "hi".into(),
                    conversation_history: vec![],
                    goal_type: None,
                    skills: vec![],
                },
            ))
            .unwrap()
    }

    async fn wait_for_status(
        deps: &Arc<WorkerDeps>,
        job_id: &str,
        expected: JobStatus,
        within: Duration,
    ) -> crate::jobs::types::Job {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let job = deps.jobs.get(job_id).unwrap();
            if job.status == expected {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} stuck in {:?}, wanted {expected:?}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn successful_handler_completes_job() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Succeed(serde_json::json!({"response": "done"})),
        );
        let job = chat_job(&deps);
        let handle = worker.run();

        let done =
            wait_for_status(&deps, &job.id, JobStatus::Completed, Duration::from_secs(2)).await;
        assert_eq!(done.result, Some(serde_json::json!({"response": "done"})));

        worker.stop_gracefully(Duration::from_millis(200)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn failing_handler_schedules_retry() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Fail(ClassifiedError::new(ErrorClass::Transient, "flaky")),
        );
        let job = chat_job(&deps);
        let handle = worker.run();

        // Transient failure: first attempt fails, retry is scheduled and
        // eventually dead-letters after max_attempts.
        let done = wait_for_status(
            &deps,
            &job.id,
            JobStatus::DeadLetter,
            Duration::from_secs(3),
        )
        .await;
        assert_eq!(done.attempt, done.max_attempts);

        worker.stop_gracefully(Duration::from_millis(200)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Fail(ClassifiedError::new(ErrorClass::Permanent, "bad payload")),
        );
        let job = chat_job(&deps);
        let handle = worker.run();

        let done = wait_for_status(
            &deps,
            &job.id,
            JobStatus::DeadLetter,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(done.attempt, 1, "no retry for permanent errors");

        worker.stop_gracefully(Duration::from_millis(200)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn missing_handler_is_permanent() {
        let deps = deps();
        // Worker with no handler for agent_execute.
        let worker = Arc::new(WorkerRuntime::new(fast_config(), Arc::clone(&deps)));
        let job = chat_job(&deps);
        let handle = worker.run();

        let done = wait_for_status(
            &deps,
            &job.id,
            JobStatus::DeadLetter,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(done.error.as_ref().map(|e| e.class), Some(ErrorClass::Permanent));

        worker.stop_gracefully(Duration::from_millis(200)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn timeout_cancels_cooperative_handler() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Cooperative(Duration::from_secs(60)),
        );
        let mut new = NewJob::new(
            "a1",
            JobPayload::ChatResponse {
                prompt: "hi".into(),
                conversation_history: vec![],
                goal_type: None,
                skills: vec![],
            },
        );
        new.timeout_seconds = 1;
        new.max_attempts = 1;
        let job = deps.jobs.enqueue_scheduled(new).unwrap();
        let handle = worker.run();

        let done = wait_for_status(
            &deps,
            &job.id,
            JobStatus::DeadLetter,
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(done.error.as_ref().map(|e| e.class), Some(ErrorClass::Timeout));

        worker.stop_gracefully(Duration::from_millis(200)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn concurrency_cap_limits_parallel_handlers() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Cooperative(Duration::from_millis(300)),
        );
        for _ in 0..4 {
            chat_job(&deps);
        }
        let handle = worker.run();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(
            worker.in_flight() <= 2,
            "cap is 2, saw {}",
            worker.in_flight()
        );

        worker.stop_gracefully(Duration::from_secs(2)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn stop_gracefully_cancels_stragglers() {
        let deps = deps();
        let worker = worker_with(
            &deps,
            "agent_execute",
            Behaviour::Cooperative(Duration::from_secs(60)),
        );
        let job = chat_job(&deps);
        let handle = worker.run();

        // Wait for the handler to start.
        wait_for_status(&deps, &job.id, JobStatus::Running, Duration::from_secs(2)).await;

        worker.stop_gracefully(Duration::from_millis(100)).await;
        assert_eq!(worker.in_flight(), 0, "straggler was cancelled");

        let job = deps.jobs.get(&job.id).unwrap();
        assert_ne!(job.status, JobStatus::Running, "cancelled job was recorded");
        handle.abort();
    }

    #[tokio::test]
    async fn cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancel should wake the waiter")
            .unwrap();
        assert!(token.is_cancelled());
    }
}
