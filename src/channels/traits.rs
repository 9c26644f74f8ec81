//! Channel adapter abstraction.
//!
//! A **channel adapter** binds one chat transport (Telegram, Discord, a
//! webhook bridge) to the control plane.  Transport SDKs live outside the
//! core; the supervisor and dispatcher only ever see this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::approvals::ApprovalRequest;

// ─── Transport ───────────────────────────────────────────────────────────────

/// How the adapter receives messages; long-poll and webhook adapters get
/// heartbeat staleness checks on top of `health_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    LongPoll,
    Webhook,
    Push,
}

// ─── InboundMessage ──────────────────────────────────────────────────────────

/// A message received from a channel peer, normalised for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel_type: String,
    pub chat_id: String,
    pub user_account_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        channel_type: impl Into<String>,
        chat_id: impl Into<String>,
        user_account_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel_type: channel_type.into(),
            chat_id: chat_id.into(),
            user_account_id: user_account_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

// ─── ChannelError ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("channel not found: {0}")]
    NotFound(String),

    #[error("channel transport error: {0}")]
    Transport(String),
}

// ─── ChannelAdapter trait ────────────────────────────────────────────────────

/// One chat transport.
///
/// `start` must return promptly after spawning the adapter's internal
/// receive loop; inbound messages flow through the sender it was given.
/// `stop` + `start` is the supervisor's restart sequence, so both must be
/// safe to call repeatedly.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique registry key, e.g. `"telegram"`.
    fn channel_type(&self) -> &str;

    fn transport(&self) -> Transport;

    /// Begin receiving; forward inbound messages on `tx`.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError>;

    async fn stop(&self) -> Result<(), ChannelError>;

    /// Lightweight liveness probe; an error counts as unhealthy.
    async fn health_check(&self) -> Result<(), ChannelError>;

    /// Deliver a plain text message to a chat.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError>;

    /// Deliver an approval request with its callback tokens rendered as
    /// whatever the transport supports (buttons, links, plain text).
    async fn send_approval_request(
        &self,
        chat_id: &str,
        approval: &ApprovalRequest,
    ) -> Result<(), ChannelError>;

    /// When the receive loop last showed signs of life.  `None` disables
    /// staleness checking for this adapter.
    fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}
