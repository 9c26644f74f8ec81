//! HTTP endpoints over the core stores and services.
//!
//! The router is a thin layer: authentication, authorization, CSRF, and
//! status mapping live here; all behaviour belongs to the subsystems
//! underneath.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agents::{AgentRegistry, SteeringPriority};
use crate::approvals::{ApprovalError, ApprovalGate, Decision};
use crate::channels::{BindingStore, ChannelSupervisor};
use crate::jobs::store::{JobStore, JobStoreError};
use crate::jobs::types::{HistoryMessage, JobPayload, JobStatus, NewJob};
use crate::sessions::{MessageRole, SessionStore};
use crate::streaming::StreamingHub;

use super::auth::{AuthRegistry, Role};
use super::error::ApiError;
use super::sse::open_stream;

/// Maximum accepted request body.
const BODY_LIMIT: usize = 256 * 1024;

/// Default wait window for `?wait=true` chat requests.
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 2_000;

/// Poll cadence while waiting on a chat job.
const WAIT_POLL: Duration = Duration::from_millis(100);

// ─── AppState ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub jobs: JobStore,
    pub sessions: SessionStore,
    pub approvals: ApprovalGate,
    pub hub: Arc<StreamingHub>,
    pub bindings: BindingStore,
    pub supervisor: Arc<ChannelSupervisor>,
    pub ready: Arc<AtomicBool>,
    pub shutting_down: Arc<AtomicBool>,
}

impl AppState {
    fn ensure_accepting(&self) -> Result<(), ApiError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ApiError::ShuttingDown);
        }
        Ok(())
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/agents/:agent_id/chat", post(chat))
        .route("/agents/:agent_id/stream", get(stream))
        .route("/agents/:agent_id/steer", post(steer))
        .route(
            "/agents/:agent_id/approvals/:approval_id/decision",
            post(approval_decision),
        )
        .route("/jobs", get(list_jobs))
        .route("/jobs/:job_id", get(get_job))
        .route("/jobs/:job_id/retry", post(retry_job))
        .route(
            "/agents/:agent_id/channels",
            get(list_channels).post(bind_channel),
        )
        .route(
            "/agents/:agent_id/channels/:channel_type/:chat_id",
            axum::routing::delete(unbind_channel),
        )
        .route("/plans/runs/:run_id/timeline", get(run_timeline))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Health ──────────────────────────────────────────────────────────────────

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.ready.load(Ordering::SeqCst) && !state.shutting_down.load(Ordering::SeqCst);
    let body = json!({
        "ready": ready,
        "shuttingDown": state.shutting_down.load(Ordering::SeqCst),
        "channels": state.supervisor.status(),
    });
    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatBody {
    text: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    #[serde(default)]
    wait: Option<bool>,
    /// Milliseconds to wait for completion when `wait=true`.
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
struct ChatAccepted {
    job_id: String,
    session_id: String,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
}

async fn chat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<ChatQuery>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    let identity = state.auth.authorize_mutation(&headers, Role::Operator)?;
    if body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text must not be empty".into()));
    }

    let agent = state
        .agents
        .get(&agent_id)
        .ok_or_else(|| ApiError::NotFound(format!("agent {agent_id}")))?;
    if !agent.lifecycle.state().is_ready() {
        return Err(ApiError::Conflict(format!(
            "agent {agent_id} is {}, not accepting chat",
            agent.lifecycle.state()
        )));
    }

    let session = match &body.session_id {
        Some(session_id) => {
            let session = state
                .sessions
                .get(session_id)
                .map_err(|_| ApiError::NotFound(format!("session {session_id}")))?;
            if session.agent_id != agent_id {
                return Err(ApiError::Conflict("session belongs to another agent".into()));
            }
            session
        }
        None => state
            .sessions
            .find_or_create_active(
                &agent_id,
                &identity.principal,
                &format!("api:{}", identity.principal),
            )
            .map_err(internal)?,
    };
    state
        .sessions
        .append_message(&session.id, MessageRole::User, &body.text)
        .map_err(internal)?;

    let history: Vec<HistoryMessage> = state
        .sessions
        .recent_messages(&session.id, 20)
        .map_err(internal)?
        .into_iter()
        .map(|m| HistoryMessage {
            role: format!("{:?}", m.role).to_lowercase(),
            content: m.content,
        })
        .collect();

    let job = state
        .jobs
        .enqueue(
            NewJob::new(
                agent_id.clone(),
                JobPayload::ChatResponse {
                    prompt: body.text,
                    conversation_history: history,
                    goal_type: Some("chat".into()),
                    skills: Vec::new(),
                },
            )
            .with_session(session.id.clone()),
        )
        .map_err(internal)?;
    let job = state
        .jobs
        .schedule(&job.id, "api chat")
        .map_err(internal)?;

    // wait=true: hand back the completion when it lands inside the window,
    // otherwise fall through to 202 with the live status.
    if query.wait.unwrap_or(false) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(query.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
        while tokio::time::Instant::now() < deadline {
            let current = state.jobs.get(&job.id).map_err(internal)?;
            match current.status {
                JobStatus::Completed => {
                    let response = current
                        .result
                        .as_ref()
                        .and_then(|r| r.get("response"))
                        .and_then(|r| r.as_str())
                        .unwrap_or_default()
                        .to_string();
                    return Ok((
                        StatusCode::OK,
                        Json(ChatAccepted {
                            job_id: current.id,
                            session_id: session.id,
                            status: JobStatus::Completed,
                            response: Some(response),
                        }),
                    ));
                }
                JobStatus::Failed | JobStatus::DeadLetter => {
                    let message = current
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "execution failed".into());
                    return Err(ApiError::Upstream(message));
                }
                _ => tokio::time::sleep(WAIT_POLL).await,
            }
        }
    }

    let current = state.jobs.get(&job.id).map_err(internal)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ChatAccepted {
            job_id: current.id,
            session_id: session.id,
            status: current.status,
            response: None,
        }),
    ))
}

// ─── Streaming ───────────────────────────────────────────────────────────────

async fn stream(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.authorize_stream(&headers, &agent_id)?;
    if state.agents.get(&agent_id).is_none() {
        return Err(ApiError::NotFound(format!("agent {agent_id}")));
    }
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok());
    Ok(open_stream(state.hub.clone(), &agent_id, last_event_id))
}

// ─── Steering ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SteerBody {
    message: String,
    #[serde(default)]
    priority: Option<SteeringPriority>,
}

async fn steer(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SteerBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    state.auth.authorize_mutation(&headers, Role::Operator)?;

    let message = state
        .agents
        .steer(
            &agent_id,
            body.message,
            body.priority.unwrap_or(SteeringPriority::Normal),
        )
        .map_err(|e| match e {
            crate::agents::AgentError::NotFound(_) => {
                ApiError::NotFound(format!("agent {agent_id}"))
            }
            crate::agents::AgentError::NotExecuting { state, .. } => {
                ApiError::Conflict(format!("agent is {state}, steering requires EXECUTING"))
            }
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "steerMessageId": message.id, "status": "accepted" })),
    ))
}

// ─── Approvals ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DecisionBody {
    decision: Decision,
    #[serde(default)]
    reason: Option<String>,
}

async fn approval_decision(
    State(state): State<AppState>,
    Path((agent_id, approval_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<DecisionBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    state.auth.authorize_mutation(&headers, Role::Operator)?;

    let approval = state.approvals.get(&approval_id).map_err(|e| match e {
        ApprovalError::NotFound(_) => ApiError::NotFound(format!("approval {approval_id}")),
        other => ApiError::Internal(other.to_string()),
    })?;
    if approval.agent_id != agent_id {
        return Err(ApiError::NotFound(format!("approval {approval_id}")));
    }

    // The API path is an authenticated operator surface; it uses the
    // stored token for the requested decision.
    let token = match body.decision {
        Decision::Approved => approval.approve_token.clone(),
        Decision::Rejected => approval.reject_token.clone(),
    };
    let decided = state
        .approvals
        .decide(&approval_id, body.decision, &token, body.reason.as_deref())
        .map_err(|e| match e {
            ApprovalError::Expired => ApiError::Gone("approval_expired".into()),
            ApprovalError::AlreadyDecided(_) => {
                ApiError::Conflict("approval already decided".into())
            }
            ApprovalError::NotFound(_) => ApiError::NotFound(format!("approval {approval_id}")),
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok(Json(json!({ "approvalId": decided.id, "status": decided.status })))
}

// ─── Jobs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.authorize(&headers, Role::Viewer)?;
    let jobs = state
        .jobs
        .list(query.limit.unwrap_or(50).min(500))
        .map_err(internal)?;
    Ok(Json(json!({ "jobs": jobs })))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.authorize(&headers, Role::Viewer)?;
    let job = state.jobs.get(&job_id).map_err(|e| match e {
        JobStoreError::NotFound(_) => ApiError::NotFound(format!("job {job_id}")),
        other => ApiError::Internal(other.to_string()),
    })?;
    Ok(Json(job))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    state.auth.authorize_mutation(&headers, Role::Operator)?;
    let job = state.jobs.retry_job(&job_id).map_err(|e| match e {
        JobStoreError::NotFound(_) => ApiError::NotFound(format!("job {job_id}")),
        JobStoreError::Conflict { from, .. } => {
            ApiError::Conflict(format!("job is {from}, only failed jobs retry"))
        }
        other => ApiError::Internal(other.to_string()),
    })?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "jobId": job.id, "status": "retrying" })),
    ))
}

// ─── Channel bindings ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindBody {
    channel_type: String,
    chat_id: String,
}

async fn list_channels(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.authorize(&headers, Role::Viewer)?;
    let bindings = state
        .bindings
        .bindings_for_agent(&agent_id)
        .map_err(internal)?;
    Ok(Json(json!({ "bindings": bindings })))
}

async fn bind_channel(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<BindBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    state.auth.authorize_mutation(&headers, Role::Operator)?;
    if state.agents.get(&agent_id).is_none() {
        return Err(ApiError::NotFound(format!("agent {agent_id}")));
    }
    state
        .bindings
        .bind(&body.channel_type, &body.chat_id, &agent_id)
        .map_err(internal)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "channelType": body.channel_type,
            "chatId": body.chat_id,
            "agentId": agent_id,
        })),
    ))
}

async fn unbind_channel(
    State(state): State<AppState>,
    Path((agent_id, channel_type, chat_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.ensure_accepting()?;
    state.auth.authorize_mutation(&headers, Role::Operator)?;
    let current = state
        .bindings
        .direct_binding(&channel_type, &chat_id)
        .map_err(internal)?;
    if current.map(|b| b.agent_id) != Some(agent_id) {
        return Err(ApiError::NotFound(format!(
            "binding {channel_type}:{chat_id}"
        )));
    }
    state
        .bindings
        .unbind(&channel_type, &chat_id)
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Plan timelines ──────────────────────────────────────────────────────────

async fn run_timeline(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.authorize(&headers, Role::Viewer)?;
    // A run is addressed by its root job id; the timeline is the job's
    // transition audit.
    state.jobs.get(&run_id).map_err(|e| match e {
        JobStoreError::NotFound(_) => ApiError::NotFound(format!("run {run_id}")),
        other => ApiError::Internal(other.to_string()),
    })?;
    let transitions = state.jobs.transitions(&run_id).map_err(internal)?;
    let timeline: Vec<serde_json::Value> = transitions
        .into_iter()
        .map(|t| {
            json!({
                "at": t.at,
                "from": t.from,
                "to": t.to,
                "reason": t.reason,
            })
        })
        .collect();
    Ok(Json(json!({ "runId": run_id, "timeline": timeline })))
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    ApiError::Internal(err.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
