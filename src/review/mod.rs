//! Review chains: builder → reviewer(s) → verifier loops with escalation.

pub mod engine;

pub use engine::{
    ActionableComment, EscalationReason, LoopRecord, ReviewChainEngine, ReviewOutcome,
    ReviewPolicy, ReviewTask, RevisionTask, StageKind, StageOutcome, StagePolicy, StageRunner,
};
