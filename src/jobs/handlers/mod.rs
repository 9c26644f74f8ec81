//! Task handlers dispatched by the worker runtime.

pub mod agent_execute;

pub use agent_execute::AgentExecuteHandler;

use async_trait::async_trait;

use crate::error::{ClassifiedError, ErrorClass};
use crate::memory::cluster::{FeedbackEntry, cluster_corrections};
use crate::memory::signals::{DEFAULT_MIN_OVERLAP, Signal, correlate};

use super::types::JobPayload;
use super::worker::{JobContext, TaskHandler};

// ─── approval_expire ─────────────────────────────────────────────────────────

/// Cron task: expire overdue approvals and notify their channels.
pub struct ApprovalExpireHandler;

#[async_trait]
impl TaskHandler for ApprovalExpireHandler {
    fn name(&self) -> &'static str {
        "approval_expire"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
        let expired = ctx
            .deps
            .approvals
            .expire_due()
            .map_err(|e| ClassifiedError::from_message(e.to_string()))?;

        for approval in &expired {
            let text = format!(
                "Approval expired without a decision: {}",
                approval.summary
            );
            for note in &approval.notifications {
                if let Err(e) = ctx
                    .deps
                    .supervisor
                    .send(&note.channel_type, &note.chat_id, &text)
                    .await
                {
                    log::warn!(
                        "approval_expire: notify {}:{} failed: {e}",
                        note.channel_type,
                        note.chat_id
                    );
                }
            }
        }

        Ok(serde_json::json!({ "expired": expired.len() }))
    }
}

// ─── memory_extract ──────────────────────────────────────────────────────────

/// Run the extraction pipeline over a session's trailing messages.
pub struct MemoryExtractHandler;

#[async_trait]
impl TaskHandler for MemoryExtractHandler {
    fn name(&self) -> &'static str {
        "memory_extract"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
        let JobPayload::MemoryExtract { session_id, window } = ctx.job.typed_payload()? else {
            return Err(ClassifiedError::new(
                ErrorClass::Permanent,
                "memory_extract requires a MEMORY_EXTRACT payload",
            ));
        };

        let messages = ctx
            .deps
            .sessions
            .recent_messages(&session_id, window)
            .map_err(|e| ClassifiedError::from_message(e.to_string()))?;
        if messages.is_empty() {
            return Ok(serde_json::json!({
                "extracted": 0, "inserted": 0, "deduped": 0, "superseded": 0, "failed": 0
            }));
        }

        let window: Vec<(String, String)> = messages
            .into_iter()
            .map(|m| {
                let role = match m.role {
                    crate::sessions::MessageRole::User => "user",
                    crate::sessions::MessageRole::Assistant => "assistant",
                    crate::sessions::MessageRole::System => "system",
                    crate::sessions::MessageRole::Tool => "tool",
                };
                (role.to_string(), m.content)
            })
            .collect();

        let summary = ctx
            .deps
            .memory
            .extract_from_window(&window)
            .await
            .map_err(|e| ClassifiedError::from_message(e.to_string()))?;

        serde_json::to_value(&summary)
            .map_err(|e| ClassifiedError::new(ErrorClass::Permanent, e.to_string()))
    }
}

// ─── correction_strengthen ───────────────────────────────────────────────────

/// Cluster correction feedback into proposals.
pub struct CorrectionStrengthenHandler {
    pub similarity_threshold: f32,
    pub min_cluster_size: usize,
}

impl Default for CorrectionStrengthenHandler {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            min_cluster_size: 2,
        }
    }
}

#[async_trait]
impl TaskHandler for CorrectionStrengthenHandler {
    fn name(&self) -> &'static str {
        "correction_strengthen"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
        let JobPayload::CorrectionStrengthen { entries } = ctx.job.typed_payload()? else {
            return Err(ClassifiedError::new(
                ErrorClass::Permanent,
                "correction_strengthen requires a CORRECTION_STRENGTHEN payload",
            ));
        };

        let parsed: Vec<FeedbackEntry> = entries
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        let proposals =
            cluster_corrections(&parsed, self.similarity_threshold, self.min_cluster_size);

        Ok(serde_json::json!({
            "entries": parsed.len(),
            "proposals": proposals,
        }))
    }
}

// ─── proactive_detect ────────────────────────────────────────────────────────

/// Correlate proactive-detection signals across sources.
pub struct ProactiveDetectHandler {
    pub min_overlap: usize,
}

impl Default for ProactiveDetectHandler {
    fn default() -> Self {
        Self {
            min_overlap: DEFAULT_MIN_OVERLAP,
        }
    }
}

#[async_trait]
impl TaskHandler for ProactiveDetectHandler {
    fn name(&self) -> &'static str {
        "proactive_detect"
    }

    async fn run(&self, ctx: JobContext) -> Result<serde_json::Value, ClassifiedError> {
        let JobPayload::ProactiveDetect { signals } = ctx.job.typed_payload()? else {
            return Err(ClassifiedError::new(
                ErrorClass::Permanent,
                "proactive_detect requires a PROACTIVE_DETECT payload",
            ));
        };

        let parsed: Vec<Signal> = signals
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        let cross = correlate(&parsed, self.min_overlap);

        Ok(serde_json::json!({
            "signals": parsed.len(),
            "crossSignals": cross,
        }))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
