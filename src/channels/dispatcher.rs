//! Inbound message dispatch: channel → session → job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::store::{JobStore, JobStoreError};
use crate::jobs::types::{HistoryMessage, JobPayload, NewJob};
use crate::sessions::{MessageRole, SessionError, SessionStore};

use super::bindings::{BindingError, BindingStore};
use super::supervisor::ChannelSupervisor;
use super::traits::{ChannelError, InboundMessage};

/// Reply sent when no agent is bound to the chat.
pub const NO_AGENT_REPLY: &str =
    "No agent is configured for this chat. Ask an operator to bind one.";

/// Conversation window handed to the chat handler.
const HISTORY_WINDOW: usize = 20;

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchOutcome {
    /// Message dispatched; a chat-response job is on the queue.
    Dispatched { job_id: String, session_id: String },
    /// No agent bound; the fixed reply was sent and nothing persisted.
    NoAgent,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Job(#[from] JobStoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

// ─── MessageDispatcher ───────────────────────────────────────────────────────

/// Resolves inbound chat messages to agents and enqueues response jobs.
pub struct MessageDispatcher {
    bindings: BindingStore,
    sessions: SessionStore,
    jobs: JobStore,
    supervisor: Arc<ChannelSupervisor>,
}

impl MessageDispatcher {
    pub fn new(
        bindings: BindingStore,
        sessions: SessionStore,
        jobs: JobStore,
        supervisor: Arc<ChannelSupervisor>,
    ) -> Self {
        Self {
            bindings,
            sessions,
            jobs,
            supervisor,
        }
    }

    /// Handle one inbound message end to end (resolution → persistence →
    /// job enqueue → SCHEDULED).
    pub async fn dispatch(&self, msg: InboundMessage) -> Result<DispatchOutcome, DispatchError> {
        let Some(agent_id) = self.bindings.resolve(&msg.channel_type, &msg.chat_id)? else {
            // Unbound chat: reply and drop; nothing is persisted.
            if let Err(e) = self
                .supervisor
                .send(&msg.channel_type, &msg.chat_id, NO_AGENT_REPLY)
                .await
            {
                log::warn!(
                    "dispatcher: no-agent reply failed on {}:{}: {e}",
                    msg.channel_type,
                    msg.chat_id
                );
            }
            return Ok(DispatchOutcome::NoAgent);
        };

        let channel_id = format!("{}:{}", msg.channel_type, msg.chat_id);
        let session =
            self.sessions
                .find_or_create_active(&agent_id, &msg.user_account_id, &channel_id)?;
        self.sessions
            .append_message(&session.id, MessageRole::User, &msg.content)?;

        let history: Vec<HistoryMessage> = self
            .sessions
            .recent_messages(&session.id, HISTORY_WINDOW)?
            .into_iter()
            .map(|m| HistoryMessage {
                role: match m.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                    MessageRole::System => "system".to_string(),
                    MessageRole::Tool => "tool".to_string(),
                },
                content: m.content,
            })
            .collect();

        let job = self.jobs.enqueue(
            NewJob::new(
                agent_id,
                JobPayload::ChatResponse {
                    prompt: msg.content.clone(),
                    conversation_history: history,
                    goal_type: Some("chat".to_string()),
                    skills: Vec::new(),
                },
            )
            .with_session(session.id.clone()),
        )?;
        let job = self.jobs.schedule(&job.id, "chat message dispatched")?;

        Ok(DispatchOutcome::Dispatched {
            job_id: job.id,
            session_id: session.id,
        })
    }

    /// Completion callback: persist the assistant reply into the session
    /// and relay it back on the originating channel.
    pub async fn complete_chat(&self, job_id: &str) -> Result<(), DispatchError> {
        let job = self.jobs.get(job_id)?;
        let Some(session_id) = job.session_id.as_deref() else {
            return Ok(());
        };
        let response = job
            .result
            .as_ref()
            .and_then(|r| r.get("response"))
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string();
        if response.is_empty() {
            return Ok(());
        }

        self.sessions
            .append_message(session_id, MessageRole::Assistant, &response)?;

        let session = self.sessions.get(session_id)?;
        if let Some((channel_type, chat_id)) = session.channel_id.split_once(':') {
            if let Err(e) = self.supervisor.send(channel_type, chat_id, &response).await {
                log::warn!("dispatcher: relay to {channel_type}:{chat_id} failed: {e}");
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
