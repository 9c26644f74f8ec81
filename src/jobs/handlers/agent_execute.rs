//! The chat/goal execution handler.
//!
//! Runs one agent goal end to end: lifecycle gating, the append-only
//! event buffer, checkpoint recovery, steering injection at yield points,
//! provider routing with failover, approval gating for sensitive actions,
//! and live streaming of progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::agents::{AgentHandle, AgentState};
use crate::approvals::{ApprovalRequest, ApprovalStatus, RiskLevel};
use crate::buffer::{BufferEvent, EventType, JobBuffer, recover};
use crate::error::{ClassifiedError, ErrorClass};
use crate::jobs::types::{Checkpoint, HistoryMessage, Job, JobPayload, NewJob};
use crate::jobs::worker::{JobContext, TaskHandler};
use crate::providers::{RouterError, TaskRequest};

/// Completion rounds per job: the initial call plus steering-driven
/// refinements.
const MAX_ROUNDS: u32 = 3;

/// How long an approval waits for a human before expiring.
const APPROVAL_TTL: Duration = Duration::from_secs(300);

/// Polling cadence while waiting on an approval decision.
const APPROVAL_POLL: Duration = Duration::from_millis(250);

pub struct AgentExecuteHandler;

#[async_trait]
impl TaskHandler for AgentExecuteHandler {
    fn name(&self) -> &'static str {
        "agent_execute"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
        let JobPayload::ChatResponse {
            prompt,
            conversation_history,
            skills,
            ..
        } = ctx.job.typed_payload()?
        else {
            return Err(ClassifiedError::new(
                ErrorClass::Permanent,
                "agent_execute requires a CHAT_RESPONSE payload",
            ));
        };

        let agent = ctx
            .deps
            .agents
            .require(&ctx.job.agent_id)
            .map_err(|e| ClassifiedError::new(ErrorClass::Permanent, e.to_string()))?;
        ensure_executing(&agent, &ctx.job)?;
        let skill_context = load_skills(&ctx, &agent, &skills)?;

        // Recover before opening the buffer: opening rolls a fresh session
        // file, and recovery must read the previous attempt's.
        let resume = recovered_step(&ctx);
        let mut buffer =
            JobBuffer::open(&ctx.deps.buffer_dir, &ctx.job.id).map_err(buffer_fatal)?;
        let session_id = ctx.job.session_id.clone().unwrap_or_default();
        append(
            &mut buffer,
            &ctx.job,
            &session_id,
            EventType::SessionStart,
            serde_json::json!({ "attempt": ctx.job.attempt, "resumeStep": resume }),
        )?;
        ctx.deps.hub.broadcast(
            &ctx.job.agent_id,
            "agent:state",
            serde_json::json!({ "state": "EXECUTING", "jobId": ctx.job.id }),
        );

        let mut steering_context: Vec<String> = Vec::new();
        let mut rounds = resume;
        let output = loop {
            rounds += 1;

            // Yield point: cancellation, then steering.
            if ctx.cancel.is_cancelled() {
                checkpoint(&ctx, &mut buffer, &session_id, rounds - 1)?;
                return Err(cancelled());
            }
            steering_context.extend(drain_steering(&ctx, &agent, &mut buffer, &session_id)?);

            let request = completion_request(
                &ctx.job,
                &prompt,
                &conversation_history,
                &steering_context,
                &skill_context,
            );
            append(
                &mut buffer,
                &ctx.job,
                &session_id,
                EventType::LlmRequest,
                serde_json::json!({ "round": rounds }),
            )?;

            let call = ctx.deps.router.execute(request);
            tokio::pin!(call);
            tokio::select! {
                result = &mut call => {
                    let output = result.map_err(router_error)?;
                    append(
                        &mut buffer,
                        &ctx.job,
                        &session_id,
                        EventType::LlmResponse,
                        serde_json::json!({ "round": rounds, "content": output.content }),
                    )?;

                    // Post-call yield point: fresh steering triggers one
                    // more refinement round.
                    if !agent.inbox.is_empty() && rounds < MAX_ROUNDS {
                        continue;
                    }
                    break output;
                }
                // High-priority steering preempts the in-flight call.
                _ = agent.inbox.preempted(), if rounds < MAX_ROUNDS => {
                    log::info!("agent_execute: job {} preempted by steering", ctx.job.id);
                    continue;
                }
                _ = ctx.cancel.cancelled() => {
                    checkpoint(&ctx, &mut buffer, &session_id, rounds - 1)?;
                    return Err(cancelled());
                }
            }
        };

        // Sensitive actions surface as an approval requirement on the
        // backend output; the job blocks on a human decision.
        if let Some(required) = parse_approval(&output.data) {
            match gate_on_approval(&ctx, &mut buffer, &session_id, required).await? {
                ApprovalStatus::Approved => {}
                ApprovalStatus::Rejected => {
                    finish_session(&ctx, &mut buffer, &session_id, rounds)?;
                    return Ok(serde_json::json!({
                        "response": "The requested action was rejected by an operator.",
                        "approval": "rejected",
                    }));
                }
                _ => {
                    return Err(ClassifiedError::new(ErrorClass::Permanent, "approval_expired"));
                }
            }
        }

        checkpoint(&ctx, &mut buffer, &session_id, rounds)?;
        ctx.deps.hub.broadcast(
            &ctx.job.agent_id,
            "agent:output",
            serde_json::json!({ "text": output.content }),
        );
        finish_session(&ctx, &mut buffer, &session_id, rounds)?;
        schedule_extraction(&ctx);

        Ok(serde_json::json!({ "response": output.content, "rounds": rounds }))
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

fn ensure_executing(agent: &Arc<AgentHandle>, job: &Job) -> Result<(), ClassifiedError> {
    match agent.lifecycle.state() {
        AgentState::Executing => Ok(()),
        AgentState::Ready => {
            agent
                .lifecycle
                .transition(AgentState::Executing, format!("job {}", job.id))
                .map_err(|e| ClassifiedError::new(ErrorClass::Transient, e.to_string()))?;
            Ok(())
        }
        state @ (AgentState::Booting | AgentState::Hydrating) => Err(ClassifiedError::new(
            ErrorClass::Transient,
            format!("agent {} is {state}, not ready for work yet", job.agent_id),
        )),
        state @ (AgentState::Draining | AgentState::Terminated) => Err(ClassifiedError::new(
            ErrorClass::Permanent,
            format!("agent {} is {state} and accepts no new work", job.agent_id),
        )),
    }
}

// ─── Buffer helpers ──────────────────────────────────────────────────────────

fn append(
    buffer: &mut JobBuffer,
    job: &Job,
    session_id: &str,
    event_type: EventType,
    data: serde_json::Value,
) -> Result<BufferEvent, ClassifiedError> {
    buffer
        .append(BufferEvent::new(&job.id, session_id, &job.agent_id, event_type, data).with_crc())
        .map_err(buffer_fatal)
}

fn buffer_fatal(err: crate::buffer::BufferError) -> ClassifiedError {
    ClassifiedError::from_message(err.to_string())
}

fn cancelled() -> ClassifiedError {
    ClassifiedError::new(ErrorClass::Timeout, "cancelled at yield point")
}

/// The resumable step for this attempt: the buffer's last valid
/// checkpoint wins, the store's copy is the fallback.
fn recovered_step(ctx: &JobContext) -> u32 {
    if ctx.job.attempt <= 1 {
        return 0;
    }
    let from_buffer = recover(&ctx.deps.buffer_dir, &ctx.job.id)
        .ok()
        .and_then(|r| r.last_checkpoint)
        .and_then(|event| event.data.get("step").and_then(|s| s.as_u64()));
    if let Some(step) = from_buffer {
        return step as u32;
    }
    ctx.job
        .checkpoint
        .as_ref()
        .filter(|cp| cp.crc_matches())
        .and_then(|cp| cp.state.get("step").and_then(|s| s.as_u64()))
        .unwrap_or(0) as u32
}

/// Write a checkpoint to the buffer first, then commit it to the store.
fn checkpoint(
    ctx: &JobContext,
    buffer: &mut JobBuffer,
    session_id: &str,
    step: u32,
) -> Result<(), ClassifiedError> {
    let state = serde_json::json!({ "step": step });
    append(buffer, &ctx.job, session_id, EventType::Checkpoint, state.clone())?;
    ctx.deps
        .jobs
        .save_checkpoint(&ctx.job.id, &Checkpoint::new(state))
        .map_err(|e| ClassifiedError::from_message(e.to_string()))?;
    Ok(())
}

fn finish_session(
    ctx: &JobContext,
    buffer: &mut JobBuffer,
    session_id: &str,
    rounds: u32,
) -> Result<(), ClassifiedError> {
    append(
        buffer,
        &ctx.job,
        session_id,
        EventType::SessionEnd,
        serde_json::json!({ "rounds": rounds }),
    )?;
    let meta = crate::buffer::BufferMetadata {
        job_id: ctx.job.id.clone(),
        agent_id: ctx.job.agent_id.clone(),
        session_count: buffer.session_no(),
        last_event_at: Some(chrono::Utc::now()),
        notes: None,
    };
    buffer.write_metadata(&meta).map_err(buffer_fatal)?;
    Ok(())
}

// ─── Steering ────────────────────────────────────────────────────────────────

/// Drain the inbox at a yield point: record, acknowledge, and surface each
/// message, returning the context lines to inject.
fn drain_steering(
    ctx: &JobContext,
    agent: &Arc<AgentHandle>,
    buffer: &mut JobBuffer,
    session_id: &str,
) -> Result<Vec<String>, ClassifiedError> {
    let mut injected = Vec::new();
    for message in agent.inbox.drain() {
        append(
            buffer,
            &ctx.job,
            session_id,
            EventType::Steering,
            serde_json::json!({
                "steerMessageId": message.id,
                "message": message.message,
                "priority": message.priority,
            }),
        )?;
        ctx.deps.hub.broadcast(
            &ctx.job.agent_id,
            "steer:ack",
            serde_json::json!({ "steerMessageId": message.id }),
        );
        ctx.deps.hub.broadcast(
            &ctx.job.agent_id,
            "agent:output",
            serde_json::json!({ "text": format!("[STEER] {}", message.message) }),
        );
        injected.push(message.message);
    }
    Ok(injected)
}

// ─── Skills ──────────────────────────────────────────────────────────────────

/// Resolve pinned skills and fit them into the agent's token budget.
fn load_skills(
    ctx: &JobContext,
    agent: &Arc<AgentHandle>,
    names: &[String],
) -> Result<serde_json::Value, ClassifiedError> {
    if names.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    let _ = ctx.deps.skills.refresh();
    let resolved = ctx
        .deps
        .skills
        .resolve(names)
        .map_err(|e| ClassifiedError::new(ErrorClass::Permanent, e.to_string()))?;

    let budget = agent.profile.limits.skill_token_budget;
    let (kept, dropped) = crate::skills::select_within_budget(resolved, budget);
    if !dropped.is_empty() {
        log::info!(
            "agent_execute: job {} dropped skills over budget: {dropped:?}",
            ctx.job.id
        );
    }
    let constraints: Vec<_> = kept.iter().map(|s| s.entry.constraints.clone()).collect();
    let merged = crate::skills::merge_constraints(&constraints);

    Ok(serde_json::json!({
        "content": kept.iter().map(|s| s.content.clone()).collect::<Vec<_>>(),
        "ids": kept.iter().map(|s| s.entry.id.clone()).collect::<Vec<_>>(),
        "constraints": merged,
    }))
}

// ─── Backend call ────────────────────────────────────────────────────────────

fn completion_request(
    job: &Job,
    prompt: &str,
    history: &[HistoryMessage],
    steering: &[String],
    skills: &serde_json::Value,
) -> TaskRequest {
    TaskRequest::completion(serde_json::json!({
        "prompt": prompt,
        "history": history,
        "steering": steering,
        "skills": skills,
    }))
    .with_deadline(Duration::from_secs(job.timeout_seconds.clamp(1, 120)))
}

fn router_error(err: RouterError) -> ClassifiedError {
    match err {
        RouterError::NoBackendAvailable => {
            ClassifiedError::new(ErrorClass::Transient, "no_backend_available")
        }
        RouterError::UnknownProvider(p) => {
            ClassifiedError::new(ErrorClass::Permanent, format!("unknown provider {p}"))
        }
        RouterError::Backend(e) => e,
    }
}

// ─── Approval gating ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequirement {
    summary: String,
    #[serde(default)]
    detail: serde_json::Value,
    #[serde(default)]
    risk: Option<RiskLevel>,
}

fn parse_approval(data: &serde_json::Value) -> Option<ApprovalRequirement> {
    serde_json::from_value(data.get("requiresApproval")?.clone()).ok()
}

/// Create the approval, notify the session channel, and block until a
/// decision, expiry, or cancellation.
async fn gate_on_approval(
    ctx: &JobContext,
    buffer: &mut JobBuffer,
    session_id: &str,
    required: ApprovalRequirement,
) -> Result<ApprovalStatus, ClassifiedError> {
    let approval = ctx
        .deps
        .approvals
        .create(
            &ctx.job.id,
            &ctx.job.agent_id,
            &required.summary,
            required.detail,
            required.risk.unwrap_or(RiskLevel::Medium),
            APPROVAL_TTL,
        )
        .map_err(|e| ClassifiedError::from_message(e.to_string()))?;
    let _ = ctx
        .deps
        .jobs
        .set_approval_deadline(&ctx.job.id, Some(approval.expires_at));

    append(
        buffer,
        &ctx.job,
        session_id,
        EventType::ApprovalRequest,
        serde_json::json!({ "approvalId": approval.id, "summary": approval.summary }),
    )?;
    ctx.deps.hub.broadcast(
        &ctx.job.agent_id,
        "approval:request",
        serde_json::json!({ "approvalId": approval.id, "summary": approval.summary }),
    );
    notify_channel(ctx, &approval).await;

    let status = wait_for_decision(ctx, &approval.id).await?;
    append(
        buffer,
        &ctx.job,
        session_id,
        EventType::ApprovalDecision,
        serde_json::json!({ "approvalId": approval.id, "status": status }),
    )?;
    let _ = ctx.deps.jobs.set_approval_deadline(&ctx.job.id, None);
    Ok(status)
}

/// Send the approval to the session's channel, when the session has one.
async fn notify_channel(ctx: &JobContext, approval: &ApprovalRequest) {
    let Some(session_id) = ctx.job.session_id.as_deref() else {
        return;
    };
    let Ok(session) = ctx.deps.sessions.get(session_id) else {
        return;
    };
    let Some((channel_type, chat_id)) = session.channel_id.split_once(':') else {
        return;
    };
    let Some(adapter) = ctx.deps.supervisor.adapter(channel_type) else {
        return;
    };
    match adapter.send_approval_request(chat_id, approval).await {
        Ok(()) => {
            if let Err(e) = ctx
                .deps
                .approvals
                .record_notification(&approval.id, channel_type, chat_id)
            {
                log::warn!("agent_execute: recording notification failed: {e}");
            }
        }
        Err(e) => log::warn!("agent_execute: approval notify failed: {e}"),
    }
}

async fn wait_for_decision(
    ctx: &JobContext,
    approval_id: &str,
) -> Result<ApprovalStatus, ClassifiedError> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(cancelled());
        }
        let approval = ctx
            .deps
            .approvals
            .get(approval_id)
            .map_err(|e| ClassifiedError::from_message(e.to_string()))?;
        match approval.status {
            ApprovalStatus::Pending => {
                if chrono::Utc::now() > approval.expires_at {
                    let _ = ctx.deps.approvals.expire_due();
                }
                tokio::select! {
                    _ = tokio::time::sleep(APPROVAL_POLL) => {}
                    _ = ctx.cancel.cancelled() => return Err(cancelled()),
                }
            }
            decided => return Ok(decided),
        }
    }
}

// ─── Follow-up work ──────────────────────────────────────────────────────────

/// Queue memory extraction over the session after a completed chat.
fn schedule_extraction(ctx: &JobContext) {
    let Some(session_id) = ctx.job.session_id.clone() else {
        return;
    };
    let result = ctx.deps.jobs.enqueue_scheduled(
        NewJob::new(
            ctx.job.agent_id.clone(),
            JobPayload::MemoryExtract {
                session_id,
                window: 20,
            },
        )
        .with_priority(10),
    );
    if let Err(e) = result {
        log::warn!("agent_execute: scheduling memory extraction failed: {e}");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfile, AgentRegistry, ResourceLimits, SteeringPriority};
    use crate::approvals::{ApprovalGate, Decision};
    use crate::channels::supervisor::SupervisorConfig;
    use crate::channels::ChannelSupervisor;
    use crate::jobs::store::JobStore;
    use crate::jobs::types::JobStatus;
    use crate::jobs::worker::{CancelToken, WorkerDeps};
    use crate::memory::extraction::FactExtractor;
    use crate::memory::{HashEmbedding, InMemoryVectorStore, MemoryPipeline};
    use crate::providers::{Backend, BackendError, BreakerConfig, ProviderRouter, TaskKind, TaskOutput};
    use crate::sessions::SessionStore;
    use crate::streaming::StreamingHub;
    use std::sync::Mutex;

    struct NullExtractor;

    #[async_trait]
    impl FactExtractor for NullExtractor {
        async fn extract(&self, _s: &str, _u: &str) -> Result<String, String> {
            Ok("{\"facts\": []}".to_string())
        }
    }

    /// Backend returning scripted outputs in order; records the last input.
    struct ScriptedBackend {
        id: String,
        outputs: Mutex<Vec<Result<TaskOutput, BackendError>>>,
        last_input: Mutex<Option<serde_json::Value>>,
    }

    impl ScriptedBackend {
        fn with_outputs(outputs: Vec<Result<TaskOutput, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                id: "llm-primary".to_string(),
                outputs: Mutex::new(outputs),
                last_input: Mutex::new(None),
            })
        }

        fn text(content: &str) -> Result<TaskOutput, BackendError> {
            Ok(TaskOutput {
                content: content.to_string(),
                data: serde_json::Value::Null,
            })
        }

        fn last_input(&self) -> Option<serde_json::Value> {
            self.last_input.lock().ok().and_then(|g| g.clone())
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn id(&self) -> &str {
            &self.id
        }
        fn supports(&self, _kind: TaskKind) -> bool {
            true
        }
        async fn execute(&self, task: TaskRequest) -> Result<TaskOutput, BackendError> {
            if let Ok(mut last) = self.last_input.lock() {
                *last = Some(task.input.clone());
            }
            let mut outputs = self.outputs.lock().map_err(|e| BackendError::new(e.to_string()))?;
            if outputs.is_empty() {
                return ScriptedBackend::text("default reply");
            }
            outputs.remove(0)
        }
    }

    struct Fixture {
        deps: Arc<WorkerDeps>,
        backend: Arc<ScriptedBackend>,
    }

    impl Fixture {
        fn new(outputs: Vec<Result<TaskOutput, BackendError>>) -> Self {
            let backend = ScriptedBackend::with_outputs(outputs);
            let router = ProviderRouter::new();
            router.register(backend.clone(), 0, BreakerConfig::default(), 4);

            let tmp = tempfile::tempdir().map(|d| d.keep()).unwrap_or_default();
            let deps = Arc::new(WorkerDeps {
                jobs: JobStore::open_in_memory().unwrap(),
                sessions: SessionStore::open_in_memory().unwrap(),
                agents: Arc::new(AgentRegistry::new()),
                hub: Arc::new(StreamingHub::new()),
                router: Arc::new(router),
                approvals: ApprovalGate::open_in_memory().unwrap(),
                supervisor: ChannelSupervisor::new(SupervisorConfig::default()),
                memory: Arc::new(MemoryPipeline::new(
                    Arc::new(NullExtractor),
                    Arc::new(HashEmbedding::new()),
                    Arc::new(InMemoryVectorStore::new()),
                )),
                skills: Arc::new(crate::skills::SkillIndex::new(tmp.join("skills"))),
                buffer_dir: tmp,
            });

            let handle = deps
                .agents
                .register(AgentProfile {
                    id: "a1".to_string(),
                    slug: "a1".to_string(),
                    display_name: "Agent One".to_string(),
                    limits: ResourceLimits::default(),
                })
                .unwrap();
            handle
                .lifecycle
                .transition(AgentState::Hydrating, "boot")
                .unwrap();
            handle.lifecycle.transition(AgentState::Ready, "test").unwrap();

            Self { deps, backend }
        }

        fn chat_context(&self, prompt: &str) -> JobContext {
            let job = self
                .deps
                .jobs
                .enqueue_scheduled(NewJob::new(
                    "a1",
                    JobPayload::ChatResponse {
                        prompt: prompt.to_string(),
                        conversation_history: vec![],
                        goal_type: Some("chat".to_string()),
                        skills: vec![],
                    },
                ))
                .unwrap();
            self.deps.jobs.claim_next().unwrap().unwrap();
            JobContext {
                job: self.deps.jobs.get(&job.id).unwrap(),
                cancel: CancelToken::new(),
                deps: Arc::clone(&self.deps),
            }
        }
    }

    #[tokio::test]
    async fn happy_path_returns_response_and_checkpoints() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("hello from the model")]);
        let ctx = fixture.chat_context("hi");
        let job_id = ctx.job.id.clone();

        let result = AgentExecuteHandler.run(ctx).await.unwrap();
        assert_eq!(result["response"], "hello from the model");

        let job = fixture.deps.jobs.get(&job_id).unwrap();
        assert!(job.checkpoint.is_some(), "checkpoint committed to the store");

        // Buffer carries the full event trail.
        let recovery = recover(&fixture.deps.buffer_dir, &job_id).unwrap();
        assert!(recovery.last_checkpoint.is_some());
        let kinds: Vec<EventType> = recovery.events_after.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![EventType::SessionEnd]);
    }

    #[tokio::test]
    async fn agent_moves_ready_to_executing_and_stays() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("ok")]);
        let ctx = fixture.chat_context("hi");
        AgentExecuteHandler.run(ctx).await.unwrap();

        let agent = fixture.deps.agents.require("a1").unwrap();
        assert_eq!(agent.lifecycle.state(), AgentState::Executing);

        // A second job on the now-EXECUTING agent still runs.
        let ctx = fixture.chat_context("again");
        let result = AgentExecuteHandler.run(ctx).await.unwrap();
        assert_eq!(result["response"], "default reply");
    }

    #[tokio::test]
    async fn terminated_agent_is_permanent() {
        let fixture = Fixture::new(vec![]);
        let agent = fixture.deps.agents.require("a1").unwrap();
        agent
            .lifecycle
            .transition(AgentState::Draining, "shutdown")
            .unwrap();
        agent
            .lifecycle
            .transition(AgentState::Terminated, "gone")
            .unwrap();

        let ctx = fixture.chat_context("hi");
        let err = AgentExecuteHandler.run(ctx).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn steering_is_acknowledged_and_injected() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("steered reply")]);
        let agent = fixture.deps.agents.require("a1").unwrap();
        let (_conn, mut events) = fixture.deps.hub.connect("a1", None);

        let ctx = fixture.chat_context("do the thing");
        // Queue steering before the run reaches its first yield point.
        agent
            .lifecycle
            .transition(AgentState::Executing, "pre-steer")
            .unwrap();
        fixture
            .deps
            .agents
            .steer("a1", "focus on X", SteeringPriority::High)
            .unwrap();

        AgentExecuteHandler.run(ctx).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let ack_pos = seen.iter().position(|e| e.event_type == "steer:ack");
        let steer_output = seen.iter().position(|e| {
            e.event_type == "agent:output"
                && e.data["text"].as_str().unwrap_or_default() == "[STEER] focus on X"
        });
        assert!(ack_pos.is_some(), "steer:ack missing: {seen:?}");
        assert!(steer_output.is_some(), "[STEER] output missing");
        assert!(ack_pos < steer_output, "ack precedes the steering output");
    }

    #[tokio::test]
    async fn approval_approved_completes_with_response() {
        let output = Ok(TaskOutput {
            content: "I will delete the table".to_string(),
            data: serde_json::json!({
                "requiresApproval": { "summary": "drop table users", "risk": "CRITICAL" }
            }),
        });
        let fixture = Fixture::new(vec![output]);
        let ctx = fixture.chat_context("clean up the db");
        let job_id = ctx.job.id.clone();

        let approvals = fixture.deps.approvals.clone();
        let approver = tokio::spawn(async move {
            // Approve as soon as the request lands.
            loop {
                let pending = approvals.pending_for_job(&job_id).unwrap_or_default();
                if let Some(approval) = pending.first() {
                    approvals
                        .decide(
                            &approval.id,
                            Decision::Approved,
                            &approval.approve_token,
                            Some("fine"),
                        )
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let result = AgentExecuteHandler.run(ctx).await.unwrap();
        approver.await.unwrap();
        assert_eq!(result["response"], "I will delete the table");
    }

    #[tokio::test]
    async fn approval_rejected_reports_rejection() {
        let output = Ok(TaskOutput {
            content: "irrelevant".to_string(),
            data: serde_json::json!({
                "requiresApproval": { "summary": "send 1000 emails" }
            }),
        });
        let fixture = Fixture::new(vec![output]);
        let ctx = fixture.chat_context("spam everyone");
        let job_id = ctx.job.id.clone();

        let approvals = fixture.deps.approvals.clone();
        let rejecter = tokio::spawn(async move {
            loop {
                let pending = approvals.pending_for_job(&job_id).unwrap_or_default();
                if let Some(approval) = pending.first() {
                    approvals
                        .decide(&approval.id, Decision::Rejected, &approval.reject_token, None)
                        .unwrap();
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let result = AgentExecuteHandler.run(ctx).await.unwrap();
        rejecter.await.unwrap();
        assert_eq!(result["approval"], "rejected");
    }

    #[tokio::test]
    async fn completed_chat_schedules_memory_extraction() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("done")]);
        let session = fixture
            .deps
            .sessions
            .find_or_create_active("a1", "user-1", "telegram:42")
            .unwrap();

        let job = fixture
            .deps
            .jobs
            .enqueue_scheduled(
                NewJob::new(
                    "a1",
                    JobPayload::ChatResponse {
                        prompt: "hi".to_string(),
                        conversation_history: vec![],
                        goal_type: None,
                        skills: vec![],
                    },
                )
                .with_session(session.id.clone()),
            )
            .unwrap();
        fixture.deps.jobs.claim_next().unwrap().unwrap();
        let ctx = JobContext {
            job: fixture.deps.jobs.get(&job.id).unwrap(),
            cancel: CancelToken::new(),
            deps: Arc::clone(&fixture.deps),
        };

        AgentExecuteHandler.run(ctx).await.unwrap();

        let follow_ups: Vec<_> = fixture
            .deps
            .jobs
            .list(10)
            .unwrap()
            .into_iter()
            .filter(|j| j.status == JobStatus::Scheduled)
            .collect();
        assert_eq!(follow_ups.len(), 1, "memory extraction queued");
        let payload = follow_ups[0].typed_payload().unwrap();
        assert!(matches!(payload, JobPayload::MemoryExtract { .. }));
    }

    fn write_skill(dir: &std::path::Path, id: &str, body: &str) {
        let skill_dir = dir.join(id);
        std::fs::create_dir_all(&skill_dir).unwrap();
        std::fs::write(
            skill_dir.join("SKILL.md"),
            format!("---\ntitle: {id}\n---\n{body}\n"),
        )
        .unwrap();
    }

    fn skill_job(fixture: &Fixture, skills: Vec<String>) -> JobContext {
        let job = fixture
            .deps
            .jobs
            .enqueue_scheduled(NewJob::new(
                "a1",
                JobPayload::ChatResponse {
                    prompt: "use your skills".to_string(),
                    conversation_history: vec![],
                    goal_type: None,
                    skills,
                },
            ))
            .unwrap();
        fixture.deps.jobs.claim_next().unwrap().unwrap();
        JobContext {
            job: fixture.deps.jobs.get(&job.id).unwrap(),
            cancel: CancelToken::new(),
            deps: Arc::clone(&fixture.deps),
        }
    }

    #[tokio::test]
    async fn pinned_skills_flow_into_the_request_within_budget() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("ok")]);
        let skills_dir = fixture.deps.buffer_dir.join("skills");
        write_skill(&skills_dir, "style", "Write tersely.");
        // Default budget is 4000 tokens (~16k chars); this one busts it.
        write_skill(&skills_dir, "giant", &"x".repeat(80_000));

        let ctx = skill_job(&fixture, vec!["style".to_string(), "giant".to_string()]);
        AgentExecuteHandler.run(ctx).await.unwrap();

        let input = fixture.backend.last_input().unwrap();
        let ids: Vec<&str> = input["skills"]["ids"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert_eq!(ids, vec!["style"], "oversized skill dropped, small one kept");
        assert!(
            input["skills"]["content"][0]
                .as_str()
                .unwrap()
                .contains("Write tersely."),
            "skill content injected"
        );
    }

    #[tokio::test]
    async fn unknown_pinned_skill_is_permanent() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("ok")]);
        let ctx = skill_job(&fixture, vec!["does-not-exist".to_string()]);
        let err = AgentExecuteHandler.run(ctx).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn cancelled_run_checkpoints_and_reports_timeout() {
        let fixture = Fixture::new(vec![ScriptedBackend::text("never used")]);
        let ctx = fixture.chat_context("hi");
        let job_id = ctx.job.id.clone();
        ctx.cancel.cancel();

        let err = AgentExecuteHandler.run(ctx).await.unwrap_err();
        assert_eq!(err.class, ErrorClass::Timeout);

        let recovery = recover(&fixture.deps.buffer_dir, &job_id).unwrap();
        assert!(
            recovery.last_checkpoint.is_some(),
            "final checkpoint written on cancellation"
        );
    }

    #[tokio::test]
    async fn retry_resumes_from_buffer_checkpoint() {
        let fixture = Fixture::new(vec![
            ScriptedBackend::text("first attempt"),
            ScriptedBackend::text("second attempt"),
        ]);
        let ctx = fixture.chat_context("hi");
        let job_id = ctx.job.id.clone();
        AgentExecuteHandler.run(ctx).await.unwrap();

        // Simulate a retry: fail and reclaim the job, then run attempt 2.
        let mut job = fixture.deps.jobs.get(&job_id).unwrap();
        job.attempt = 2;
        let ctx = JobContext {
            job,
            cancel: CancelToken::new(),
            deps: Arc::clone(&fixture.deps),
        };
        let result = AgentExecuteHandler.run(ctx).await.unwrap();
        // Resumed past step 1: rounds continue from the recovered step.
        assert!(result["rounds"].as_u64().unwrap_or(0) >= 2);
    }
}
