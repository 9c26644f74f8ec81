//! Human approval gating for sensitive agent actions.

pub mod gate;
pub mod handoff;

pub use gate::{
    ApprovalError, ApprovalGate, ApprovalRequest, ApprovalStatus, Decision, NotificationRecord,
    RiskLevel, parse_callback_token,
};
pub use handoff::{HandoffError, HandoffVault};
